//! # Result Queue
//!
//! Unbounded FIFO from the recognizer callback thread to the send loop.
//!
//! Items are counted from push until the send loop reports them delivered, so
//! the session can wait for "queue empty AND everything delivered" before it
//! closes, not just "channel empty".

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// One message to the transcription client.
///
/// ## Wire format:
/// ```text
/// {"text":"how do refunds","is_final":false}
/// {"text":"How do refunds work?","is_final":true}
/// {"error":"recognition request failed: ..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TranscriptionFrame {
    Result { text: String, is_final: bool },
    Error { error: String },
}

impl TranscriptionFrame {
    pub fn partial(text: impl Into<String>) -> Self {
        TranscriptionFrame::Result {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        TranscriptionFrame::Result {
            text: text.into(),
            is_final: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TranscriptionFrame::Error { error: message.into() }
    }
}

#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    drained: Notify,
}

pub fn result_queue() -> (ResultProducer, ResultConsumer) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let pending = Arc::new(Pending::default());
    (
        ResultProducer {
            sender,
            pending: pending.clone(),
        },
        ResultConsumer { receiver, pending },
    )
}

/// Push side. Cloned into every recognizer callback.
#[derive(Debug, Clone)]
pub struct ResultProducer {
    sender: mpsc::UnboundedSender<TranscriptionFrame>,
    pending: Arc<Pending>,
}

impl ResultProducer {
    /// Never blocks. Returns false if the consumer is gone, in which case
    /// the item is logged and dropped.
    pub fn push(&self, frame: TranscriptionFrame) -> bool {
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        match self.sender.send(frame) {
            Ok(()) => true,
            Err(mpsc::error::SendError(frame)) => {
                warn!(frame = ?frame, "Result queue consumer is gone, dropping transcription result");
                settle(&self.pending);
                false
            }
        }
    }

    pub fn drain_handle(&self) -> DrainHandle {
        DrainHandle {
            pending: self.pending.clone(),
        }
    }
}

/// Pop side, owned by the send loop.
#[derive(Debug)]
pub struct ResultConsumer {
    receiver: mpsc::UnboundedReceiver<TranscriptionFrame>,
    pending: Arc<Pending>,
}

impl ResultConsumer {
    /// Wait up to `wait` for the next item.
    pub async fn pop_timeout(&mut self, wait: Duration) -> Option<TranscriptionFrame> {
        match tokio::time::timeout(wait, self.receiver.recv()).await {
            Ok(Some(frame)) => Some(frame),
            Ok(None) => {
                // All producers dropped; keep the poll cadence instead of spinning.
                tokio::time::sleep(wait).await;
                None
            }
            Err(_) => None,
        }
    }

    /// Report a popped item as finished with, whether it was delivered or
    /// its delivery failure was logged.
    pub fn mark_delivered(&self) {
        settle(&self.pending);
    }

    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }
}

fn settle(pending: &Pending) {
    if pending.count.fetch_sub(1, Ordering::SeqCst) == 1 {
        pending.drained.notify_waiters();
    }
}

/// Waits for every pushed item to be delivered.
#[derive(Debug, Clone)]
pub struct DrainHandle {
    pending: Arc<Pending>,
}

impl DrainHandle {
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.pending.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a settle between the check and the
            // await is not missed.
            notified.as_mut().enable();
            if self.pending.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[test]
    fn test_frame_wire_format() {
        let json = serde_json::to_string(&TranscriptionFrame::final_text("Hi.")).unwrap();
        assert_eq!(json, r#"{"text":"Hi.","is_final":true}"#);
        let json = serde_json::to_string(&TranscriptionFrame::error("canceled")).unwrap();
        assert_eq!(json, r#"{"error":"canceled"}"#);
    }

    #[tokio::test]
    async fn test_fifo_and_pending_count() {
        let (producer, mut consumer) = result_queue();
        assert!(producer.push(TranscriptionFrame::partial("a")));
        assert!(producer.push(TranscriptionFrame::final_text("b")));
        assert_eq!(consumer.pending(), 2);

        assert_eq!(consumer.pop_timeout(WAIT).await, Some(TranscriptionFrame::partial("a")));
        consumer.mark_delivered();
        assert_eq!(consumer.pop_timeout(WAIT).await, Some(TranscriptionFrame::final_text("b")));
        assert_eq!(consumer.pending(), 1);
        consumer.mark_delivered();
        assert_eq!(consumer.pending(), 0);
        assert_eq!(consumer.pop_timeout(WAIT).await, None);
    }

    #[tokio::test]
    async fn test_wait_empty_returns_after_delivery() {
        let (producer, mut consumer) = result_queue();
        let drain = producer.drain_handle();
        drain.wait_empty().await;

        producer.push(TranscriptionFrame::final_text("x"));
        let waiter = tokio::spawn(async move { drain.wait_empty().await });
        tokio::time::sleep(WAIT).await;
        assert!(!waiter.is_finished());

        consumer.pop_timeout(WAIT).await.unwrap();
        consumer.mark_delivered();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain did not complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_to_dropped_consumer_settles() {
        let (producer, consumer) = result_queue();
        drop(consumer);
        assert!(!producer.push(TranscriptionFrame::partial("lost")));
        assert_eq!(producer.drain_handle().pending(), 0);
    }

    #[test]
    fn test_push_from_plain_thread() {
        let (producer, mut consumer) = result_queue();
        std::thread::spawn(move || {
            producer.push(TranscriptionFrame::final_text("from callback thread"));
        })
        .join()
        .unwrap();
        let frame = consumer.receiver.try_recv().unwrap();
        assert_eq!(frame, TranscriptionFrame::final_text("from callback thread"));
    }
}
