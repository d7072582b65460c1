//! # Transcription Session
//!
//! One round of continuous recognition: a fresh audio stream and a fresh
//! recognition engine, from the first audio frame until the results have
//! been delivered or the round is aborted.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: created, nothing allocated yet
//! 2. **Listening**: engine running, audio accepted via `feed`
//! 3. **Draining**: client sent `"completed"`, or the engine stopped on its own
//!    (e.g. recognition was canceled); audio is closed and the session waits
//!    for the engine to stop AND for every result to be delivered
//! 4. **Closed**: engine stopped, send loop cancelled; never reused
//!
//! `abort` moves any non-Closed session to Closed. Teardown runs exactly once
//! no matter how `abort`, `finish`, the recognizer watcher and the send loop race.
//!
//! ## Threads:
//! Engine callbacks run on the engine's own thread. They only touch the
//! [`ResultProducer`] and atomics, never the session lock.

use crate::locale::Language;
use crate::speech::queue::{result_queue, DrainHandle, ResultConsumer, ResultProducer, TranscriptionFrame};
use crate::speech::recognizer::{RecognitionCallbacks, RecognitionEngine, RecognitionError, RecognizerFactory};
use crate::speech::stream_source::{audio_stream, AudioStreamWriter};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Operation not allowed in the current state
    InvalidState { operation: &'static str, state: SessionState },
    /// `feed` before `start`
    NotStarted,
    /// The audio stream refused the write
    WriterClosed,
    Recognizer(RecognitionError),
    /// The session was aborted while finishing
    Aborted,
    /// Results were not delivered within the drain timeout
    DrainTimeout,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidState { operation, state } => {
                write!(f, "cannot {} while session is {}", operation, state.as_str())
            }
            SessionError::NotStarted => write!(f, "session has not been started"),
            SessionError::WriterClosed => write!(f, "audio stream is closed"),
            SessionError::Recognizer(err) => write!(f, "{}", err),
            SessionError::Aborted => write!(f, "session was aborted"),
            SessionError::DrainTimeout => write!(f, "timed out waiting for results to be delivered"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RecognitionError> for SessionError {
    fn from(err: RecognitionError) -> Self {
        SessionError::Recognizer(err)
    }
}

/// Set once by the engine's stopped callback.
#[derive(Debug, Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn set(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Finished,
    Aborted,
    DrainTimeout,
    RecognizerStopped,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Finished => "finished",
            CloseReason::Aborted => "aborted",
            CloseReason::DrainTimeout => "drain timeout",
            CloseReason::RecognizerStopped => "recognizer stopped",
        }
    }
}

struct Inner {
    state: SessionState,
    writer: Option<AudioStreamWriter>,
    engine: Option<Box<dyn RecognitionEngine>>,
    /// Draining because the engine stopped by itself, not because of `finish`
    recognizer_ended: bool,
    close_reason: Option<CloseReason>,
}

/// State shared between the session handle and its recognizer watcher.
struct Shared {
    id: String,
    language: Language,
    inner: Mutex<Inner>,
    producer: ResultProducer,
    drain: DrainHandle,
    recognizer_stopped: Arc<StopSignal>,
    recognizer_canceled: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listening → Draining with the audio stream closed. False in any other state.
    fn begin_drain(&self, inner: &mut Inner) -> bool {
        if inner.state != SessionState::Listening {
            return false;
        }
        inner.state = SessionState::Draining;
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush();
            writer.close();
        }
        true
    }

    fn close(&self, reason: CloseReason) -> bool {
        let engine = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return false;
            }
            inner.state = SessionState::Closed;
            inner.close_reason = Some(reason);
            if let Some(mut writer) = inner.writer.take() {
                writer.close();
            }
            inner.engine.take()
        };

        self.accepting.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(mut engine) = engine {
            engine.stop();
        }
        info!(session_id = %self.id, reason = reason.as_str(), "Transcription session closed");
        true
    }
}

/// Closes a Listening session whose engine stopped without `finish`, usually
/// after a cancellation. Queued results are still delivered first.
async fn watch_recognizer(shared: Arc<Shared>, drain_timeout: Duration) {
    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => return,
        _ = shared.recognizer_stopped.wait() => {}
    }

    {
        let mut inner = shared.lock();
        if !shared.begin_drain(&mut inner) {
            return;
        }
        inner.recognizer_ended = true;
    }

    if shared.recognizer_canceled.load(Ordering::SeqCst) {
        warn!(session_id = %shared.id, "Recognition canceled, closing transcription session");
    } else {
        info!(session_id = %shared.id, "Recognizer stopped on its own, closing transcription session");
    }

    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {}
        result = tokio::time::timeout(drain_timeout, shared.drain.wait_empty()) => {
            let reason = match result {
                Ok(()) => CloseReason::RecognizerStopped,
                Err(_) => {
                    warn!(
                        session_id = %shared.id,
                        undelivered = shared.drain.pending(),
                        "Drain timed out after recognizer stopped"
                    );
                    CloseReason::DrainTimeout
                }
            };
            shared.close(reason);
        }
    }
}

pub struct TranscriptionSession {
    shared: Arc<Shared>,
    factory: Arc<dyn RecognizerFactory>,
    drain_timeout: Duration,
}

impl TranscriptionSession {
    /// Create an Idle session and the consumer its send loop will drain.
    pub fn new(
        language: Language,
        factory: Arc<dyn RecognizerFactory>,
        drain_timeout: Duration,
    ) -> (Self, ResultConsumer) {
        let (producer, consumer) = result_queue();
        let drain = producer.drain_handle();
        let shared = Shared {
            id: Uuid::new_v4().to_string(),
            language,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                writer: None,
                engine: None,
                recognizer_ended: false,
                close_reason: None,
            }),
            producer,
            drain,
            recognizer_stopped: Arc::new(StopSignal::default()),
            recognizer_canceled: Arc::new(AtomicBool::new(false)),
            accepting: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
        };
        let session = Self {
            shared: Arc::new(shared),
            factory,
            drain_timeout,
        };
        (session, consumer)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn language(&self) -> Language {
        self.shared.language
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// True once the engine has reported stopped, for whatever reason.
    pub fn recognizer_ended(&self) -> bool {
        self.shared.recognizer_stopped.is_set()
    }

    /// True if the engine reported a cancellation.
    pub fn recognizer_canceled(&self) -> bool {
        self.shared.recognizer_canceled.load(Ordering::SeqCst)
    }

    /// Cancelled when the session closes. The send loop watches it.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Idle → Listening. Allocates a fresh audio stream and engine, and
    /// watches the engine so a session it abandons still reaches Closed.
    pub fn start(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.lock();
        if inner.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation: "start",
                state: inner.state,
            });
        }

        let mut engine = self.factory.create(self.shared.language)?;
        let (writer, reader) = audio_stream();
        engine.start(reader, self.callbacks())?;

        inner.writer = Some(writer);
        inner.engine = Some(engine);
        inner.state = SessionState::Listening;
        drop(inner);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(watch_recognizer(self.shared.clone(), self.drain_timeout));
            }
            Err(err) => warn!(session_id = %self.shared.id, error = %err, "No runtime to watch the recognizer"),
        }
        info!(session_id = %self.shared.id, language = %self.shared.language, "Transcription session listening");
        Ok(())
    }

    /// Append audio. Only valid while Listening.
    pub fn feed(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Listening => {
                let written = inner.writer.as_mut().map(|writer| writer.write(bytes)).unwrap_or(false);
                if written {
                    Ok(())
                } else {
                    Err(SessionError::WriterClosed)
                }
            }
            SessionState::Idle => Err(SessionError::NotStarted),
            state => Err(SessionError::InvalidState { operation: "feed", state }),
        }
    }

    /// Listening → Draining → Closed.
    ///
    /// Resolves once the engine has stopped and every queued result has been
    /// delivered. An abort during the wait resolves with `Aborted`; hitting
    /// the drain timeout aborts the session and resolves with `DrainTimeout`.
    /// If the engine already stopped on its own, this waits for that drain.
    pub async fn finish(&self) -> Result<(), SessionError> {
        let joining = {
            let mut inner = self.shared.lock();
            if inner.state == SessionState::Draining && inner.recognizer_ended {
                true
            } else if self.shared.begin_drain(&mut inner) {
                false
            } else {
                return Err(SessionError::InvalidState {
                    operation: "finish",
                    state: inner.state,
                });
            }
        };
        if joining {
            return self.join_recognizer_drain().await;
        }
        debug!(session_id = %self.shared.id, "Transcription session draining");

        let drained = async {
            self.shared.recognizer_stopped.wait().await;
            self.shared.drain.wait_empty().await;
        };

        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(SessionError::Aborted),
            result = tokio::time::timeout(self.drain_timeout, drained) => match result {
                Ok(()) => {
                    self.shared.close(CloseReason::Finished);
                    Ok(())
                }
                Err(_) => {
                    warn!(
                        session_id = %self.shared.id,
                        undelivered = self.shared.drain.pending(),
                        timeout_secs = self.drain_timeout.as_secs(),
                        "Drain timed out, aborting transcription session"
                    );
                    self.shared.close(CloseReason::DrainTimeout);
                    Err(SessionError::DrainTimeout)
                }
            }
        }
    }

    async fn join_recognizer_drain(&self) -> Result<(), SessionError> {
        self.shared.cancel.cancelled().await;
        match self.shared.lock().close_reason {
            Some(CloseReason::RecognizerStopped) | Some(CloseReason::Finished) => Ok(()),
            Some(CloseReason::DrainTimeout) => Err(SessionError::DrainTimeout),
            _ => Err(SessionError::Aborted),
        }
    }

    /// Any state → Closed. Returns false if the session was already closed.
    pub fn abort(&self) -> bool {
        self.shared.close(CloseReason::Aborted)
    }

    fn callbacks(&self) -> RecognitionCallbacks {
        let forward = |make: fn(String) -> TranscriptionFrame, kind: &'static str| {
            let producer = self.shared.producer.clone();
            let accepting = self.shared.accepting.clone();
            let session_id = self.shared.id.clone();
            Arc::new(move |text: String| {
                if accepting.load(Ordering::SeqCst) {
                    producer.push(make(text));
                } else {
                    debug!(session_id = %session_id, kind, text = %text, "Dropping result for closed session");
                }
            }) as Arc<dyn Fn(String) + Send + Sync>
        };

        let on_error = forward(|text| TranscriptionFrame::error(text), "canceled");
        let canceled = self.shared.recognizer_canceled.clone();
        let stopped = self.shared.recognizer_stopped.clone();
        let session_id = self.shared.id.clone();
        RecognitionCallbacks {
            on_partial: forward(|text| TranscriptionFrame::partial(text), "partial"),
            on_final: forward(|text| TranscriptionFrame::final_text(text), "final"),
            on_canceled: Arc::new(move |reason: String| {
                canceled.store(true, Ordering::SeqCst);
                on_error(reason);
            }),
            on_stopped: Arc::new(move || {
                debug!(session_id = %session_id, "Recognizer stopped");
                stopped.set();
            }),
        }
    }
}
