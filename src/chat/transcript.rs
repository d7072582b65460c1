//! # Answer Transcripts
//!
//! Every answer stream keeps a running log of what happened (the question,
//! the answer text, sources, token usage, timing, and the error if any). The
//! log is handed to a [`TranscriptStore`] only after the last frame has been
//! emitted, so persistence never delays delivery.

use crate::chat::events::{GenerationEvent, Source, TokenUsage};
use crate::chat::frame::ResponseFrame;
use crate::chat::ChatRequest;
use crate::locale::Language;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// What gets persisted for one answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub conversation_id: String,
    pub query: String,
    pub language: Language,
    pub voice: bool,
    pub answer: String,
    pub sources: Vec<Source>,
    pub usage: Option<TokenUsage>,
    pub frames_emitted: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Running log updated while the answer streams.
#[derive(Debug)]
pub struct TranscriptLog {
    conversation_id: String,
    query: String,
    language: Language,
    voice: bool,
    answer: String,
    sources: Vec<Source>,
    usage: Option<TokenUsage>,
    frames_emitted: usize,
    error: Option<String>,
    started_at: Instant,
    created_at: DateTime<Utc>,
}

impl TranscriptLog {
    pub fn new(request: &ChatRequest) -> Self {
        Self {
            conversation_id: request
                .conversation_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            query: request.query.clone(),
            language: request.language,
            voice: request.voice,
            answer: String::new(),
            sources: Vec::new(),
            usage: None,
            frames_emitted: 0,
            error: None,
            started_at: Instant::now(),
            created_at: Utc::now(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn record_event(&mut self, event: &GenerationEvent) {
        match event {
            GenerationEvent::TextDelta(Some(content)) => self.answer.push_str(content),
            GenerationEvent::TextDelta(None) => {}
            GenerationEvent::SourceBatch(sources) => self.sources.extend(sources.iter().cloned()),
            GenerationEvent::Usage(usage) => self.usage = Some(*usage),
            GenerationEvent::Error(err) => self.error = Some(err.to_string()),
        }
    }

    pub fn record_frame(&mut self, _frame: &ResponseFrame) {
        self.frames_emitted += 1;
    }

    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn into_record(self) -> TranscriptRecord {
        TranscriptRecord {
            conversation_id: self.conversation_id,
            query: self.query,
            language: self.language,
            voice: self.voice,
            answer: self.answer,
            sources: self.sources,
            usage: self.usage,
            frames_emitted: self.frames_emitted,
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
            error: self.error,
            created_at: self.created_at,
        }
    }
}

/// Persistence for finished transcripts.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save(&self, record: &TranscriptRecord) -> anyhow::Result<()>;
}

/// Appends one JSON object per transcript to a local file.
pub struct JsonlTranscriptStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTranscriptStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TranscriptStore for JsonlTranscriptStore {
    async fn save(&self, record: &TranscriptRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::events::GenerationError;

    #[test]
    fn test_log_accumulates_events() {
        let request = ChatRequest::new("How do refunds work?");
        let mut log = TranscriptLog::new(&request);
        log.record_event(&GenerationEvent::SourceBatch(vec![Source::new("a_0", "A", "https://kb/a")]));
        log.record_event(&GenerationEvent::text("Refunds "));
        log.record_event(&GenerationEvent::text("take 14 days."));
        log.record_event(&GenerationEvent::Usage(TokenUsage { prompt_tokens: 120, completion_tokens: 6 }));
        log.record_frame(&ResponseFrame::text("Refunds "));
        log.record_event(&GenerationEvent::end());

        let record = log.into_record();
        assert_eq!(record.answer, "Refunds take 14 days.");
        assert_eq!(record.sources.len(), 1);
        assert_eq!(record.usage.map(|u| u.completion_tokens), Some(6));
        assert_eq!(record.frames_emitted, 1);
        assert!(record.error.is_none());
    }

    #[test]
    fn test_log_keeps_conversation_id() {
        let mut request = ChatRequest::new("hi");
        request.conversation_id = Some("conv-42".to_string());
        let mut log = TranscriptLog::new(&request);
        log.record_event(&GenerationEvent::Error(GenerationError::ContextTooLong));
        let record = log.into_record();
        assert_eq!(record.conversation_id, "conv-42");
        assert_eq!(record.error.as_deref(), Some("context length exceeded"));
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_lines() {
        let dir = std::env::temp_dir().join(format!("kvb-transcripts-{}", Uuid::new_v4()));
        let path = dir.join("nested").join("transcripts.jsonl");
        let store = JsonlTranscriptStore::new(&path);

        let record = TranscriptLog::new(&ChatRequest::new("first")).into_record();
        store.save(&record).await.unwrap();
        let record = TranscriptLog::new(&ChatRequest::new("second")).into_record();
        store.save(&record).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: TranscriptRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.query, "second");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
