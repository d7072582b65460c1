//! # Audio Stream Source
//!
//! Append-only push channel between the WebSocket actor (writer) and the
//! recognizer worker thread (reader).
//!
//! ## Signals carried on the channel:
//! - non-empty write → audio bytes, in arrival order
//! - empty write (`flush`) → "end of utterance, finalize what you have"
//! - writer closed or dropped → end of audio
//!
//! The reader blocks on a plain thread, so the channel is a crossbeam one
//! rather than a tokio one.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Create a connected writer/reader pair.
pub fn audio_stream() -> (AudioStreamWriter, AudioStreamReader) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (
        AudioStreamWriter {
            sender: Some(sender),
            bytes_written: 0,
        },
        AudioStreamReader { receiver },
    )
}

/// Writer half, owned by the session.
#[derive(Debug)]
pub struct AudioStreamWriter {
    sender: Option<Sender<Vec<u8>>>,
    bytes_written: usize,
}

impl AudioStreamWriter {
    /// Push audio bytes. Returns false once the writer is closed or the
    /// reader is gone. Empty slices are ignored here; use [`flush`](Self::flush).
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return self.is_open();
        }
        match &self.sender {
            Some(sender) => {
                if sender.send(bytes.to_vec()).is_ok() {
                    self.bytes_written += bytes.len();
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Ask the reader to finalize buffered audio.
    pub fn flush(&mut self) -> bool {
        match &self.sender {
            Some(sender) => sender.send(Vec::new()).is_ok(),
            None => false,
        }
    }

    /// Signal end of audio. Idempotent.
    pub fn close(&mut self) {
        self.sender = None;
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_some()
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

/// What a reader sees on one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioRead {
    Audio(Vec<u8>),
    Flush,
    /// Nothing arrived within the wait
    Idle,
    /// Writer closed and every queued write has been read
    Closed,
}

/// Reader half, owned by the recognition engine.
#[derive(Debug)]
pub struct AudioStreamReader {
    receiver: Receiver<Vec<u8>>,
}

impl AudioStreamReader {
    pub fn read_timeout(&self, wait: Duration) -> AudioRead {
        match self.receiver.recv_timeout(wait) {
            Ok(bytes) if bytes.is_empty() => AudioRead::Flush,
            Ok(bytes) => AudioRead::Audio(bytes),
            Err(RecvTimeoutError::Timeout) => AudioRead::Idle,
            Err(RecvTimeoutError::Disconnected) => AudioRead::Closed,
        }
    }
}
