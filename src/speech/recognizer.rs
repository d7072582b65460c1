//! # Recognition Engine Seam
//!
//! A continuous recognizer reads from an [`AudioStreamReader`] and reports
//! results through callbacks, on a thread the session does not control.
//!
//! ## Callback contract:
//! - `on_partial` / `on_final`: recognized text, any number of times
//! - `on_canceled`: recognition failed; carries the reason
//! - `on_stopped`: called exactly once, last, after the engine has nothing
//!   left to report (end of audio, cancellation, or `stop`)

use crate::locale::Language;
use crate::speech::stream_source::AudioStreamReader;
use std::fmt;
use std::sync::Arc;

pub type TextCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type StoppedCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct RecognitionCallbacks {
    pub on_partial: TextCallback,
    pub on_final: TextCallback,
    pub on_canceled: TextCallback,
    pub on_stopped: StoppedCallback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionError {
    /// The engine could not be created or started
    Startup(String),
    /// A recognition request failed
    Request(String),
    /// `start` called twice on the same engine
    AlreadyStarted,
}

impl fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionError::Startup(msg) => write!(f, "recognizer failed to start: {}", msg),
            RecognitionError::Request(msg) => write!(f, "recognition request failed: {}", msg),
            RecognitionError::AlreadyStarted => write!(f, "recognizer already started"),
        }
    }
}

impl std::error::Error for RecognitionError {}

impl From<reqwest::Error> for RecognitionError {
    fn from(err: reqwest::Error) -> Self {
        RecognitionError::Request(err.to_string())
    }
}

/// One continuous recognition, bound to one audio stream.
pub trait RecognitionEngine: Send {
    fn start(&mut self, reader: AudioStreamReader, callbacks: RecognitionCallbacks) -> Result<(), RecognitionError>;

    /// Stop recognizing. Must not block and must be safe to call more than once.
    fn stop(&mut self);
}

/// Builds a fresh engine for every session round.
pub trait RecognizerFactory: Send + Sync {
    fn create(&self, language: Language) -> Result<Box<dyn RecognitionEngine>, RecognitionError>;
}

/// Scripted engine used by the session, send loop and websocket tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::speech::stream_source::AudioRead;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Emits one final per audio write (`"chunk N"`), plus `late_final` after
    /// end of audio, then reports stopped. With `cancel_after` set it reports a
    /// cancellation after that many writes and stops on its own.
    pub struct ScriptedEngine {
        pub late_final: Option<String>,
        pub cancel_after: Option<usize>,
        pub stop_calls: Arc<AtomicUsize>,
        pub hold_stopped: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    impl RecognitionEngine for ScriptedEngine {
        fn start(&mut self, reader: AudioStreamReader, callbacks: RecognitionCallbacks) -> Result<(), RecognitionError> {
            let late_final = self.late_final.clone();
            let cancel_after = self.cancel_after;
            let stopped = self.stopped.clone();
            let hold_stopped = self.hold_stopped.clone();
            thread::spawn(move || {
                let mut count = 0;
                loop {
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    match reader.read_timeout(Duration::from_millis(5)) {
                        AudioRead::Audio(_) => {
                            count += 1;
                            (callbacks.on_partial)(format!("partial {}", count));
                            (callbacks.on_final)(format!("chunk {}", count));
                            if cancel_after == Some(count) {
                                (callbacks.on_canceled)(format!("recognition canceled after chunk {}", count));
                                break;
                            }
                        }
                        AudioRead::Flush | AudioRead::Idle => {}
                        AudioRead::Closed => {
                            thread::sleep(Duration::from_millis(20));
                            if let Some(text) = &late_final {
                                (callbacks.on_final)(text.clone());
                            }
                            break;
                        }
                    }
                }
                while hold_stopped.load(Ordering::SeqCst) && !stopped.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                (callbacks.on_stopped)();
            });
            Ok(())
        }

        fn stop(&mut self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub struct ScriptedFactory {
        pub late_final: Option<String>,
        pub cancel_after: Option<usize>,
        pub stop_calls: Arc<AtomicUsize>,
        pub hold_stopped: Arc<AtomicBool>,
        pub created: AtomicUsize,
    }

    impl RecognizerFactory for ScriptedFactory {
        fn create(&self, _language: Language) -> Result<Box<dyn RecognitionEngine>, RecognitionError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedEngine {
                late_final: self.late_final.clone(),
                cancel_after: self.cancel_after,
                stop_calls: self.stop_calls.clone(),
                hold_stopped: self.hold_stopped.clone(),
                stopped: Arc::new(AtomicBool::new(false)),
            }))
        }
    }
}
