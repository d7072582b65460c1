//! # Network Send Loop
//!
//! Drains a session's result queue onto the client connection. Runs as its own
//! task so a slow client never blocks the receive path.
//!
//! ## Loop:
//! 1. Pop with a bounded wait (`poll_interval`); nothing → poll again
//! 2. Send the frame through the [`FrameSink`]
//! 3. On success mark it delivered; on failure log it, abort the session and exit
//!
//! Session cancellation is checked before every poll.

use crate::speech::queue::{ResultConsumer, TranscriptionFrame};
use crate::speech::session::TranscriptionSession;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SinkError {
    /// The connection is gone
    Closed,
    Send(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Closed => write!(f, "connection closed"),
            SinkError::Send(msg) => write!(f, "send failed: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

/// Where transcription frames are written.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &TranscriptionFrame) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendLoopOutcome {
    /// The session closed; everything queued before that was delivered
    Cancelled { delivered: usize },
    /// A send failed and the session was aborted
    ConnectionLost { delivered: usize },
}

pub struct NetworkSendLoop {
    consumer: ResultConsumer,
    session: Arc<TranscriptionSession>,
    poll_interval: Duration,
}

impl NetworkSendLoop {
    pub fn new(consumer: ResultConsumer, session: Arc<TranscriptionSession>, poll_interval: Duration) -> Self {
        Self {
            consumer,
            session,
            poll_interval,
        }
    }

    pub async fn run<S: FrameSink>(mut self, mut sink: S) -> SendLoopOutcome {
        let cancel = self.session.cancellation();
        let mut delivered = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(session_id = %self.session.id(), delivered, "Send loop cancelled");
                    return SendLoopOutcome::Cancelled { delivered };
                }
                next = self.consumer.pop_timeout(self.poll_interval) => next,
            };

            let Some(frame) = next else {
                tokio::task::yield_now().await;
                continue;
            };

            match sink.send(&frame).await {
                Ok(()) => {
                    delivered += 1;
                    self.consumer.mark_delivered();
                }
                Err(err) => {
                    warn!(
                        session_id = %self.session.id(),
                        frame = ?frame,
                        error = %err,
                        "Undelivered transcription result, aborting session"
                    );
                    self.consumer.mark_delivered();
                    self.session.abort();
                    return SendLoopOutcome::ConnectionLost { delivered };
                }
            }
        }
    }
}
