//! # Chat Answer Streaming
//!
//! Turns one generation call into the ordered frame stream a client reads.
//!
//! ## Key Components:
//! - **events**: What the generation call yields (`GenerationEvent`, `Source`)
//! - **generator**: The `Generator` seam and the hosted chat-completions client
//! - **sentence**: Sentence-boundary buffering for voice mode
//! - **multiplexer**: The event → frame translator (`EventMultiplexer`)
//! - **frame**: Client-facing frames and their NDJSON encoding
//! - **messages**: Localized in-band error messages
//! - **transcript**: Per-answer telemetry and its persistence
//!
//! ## Data flow:
//! ```text
//! Generator ──events──▶ EventMultiplexer ──frames──▶ NDJSON body
//!                          │ voice mode
//!                          └─▶ SentenceAccumulator ─▶ SpeechSynthesizer
//! ```

pub mod events;
pub mod frame;
pub mod generator;
pub mod messages;
pub mod multiplexer;
pub mod sentence;
pub mod transcript;

use crate::locale::Language;
use crate::speech::synthesis::SynthesisError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One prior turn of the conversation, replayed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Body of `POST /api/v1/chat`.
///
/// `voice = true` switches the answer from text chunks to synthesized audio
/// chunks in the requested language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub voice: bool,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: None,
            history: Vec::new(),
            language: Language::default(),
            voice: false,
        }
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn with_voice(mut self, voice: bool) -> Self {
        self.voice = voice;
        self
    }
}

/// Failures that end an answer stream early instead of becoming an in-band frame.
#[derive(Debug)]
pub enum ChatStreamError {
    /// Speech synthesis failed while building an audio chunk
    Synthesis(SynthesisError),
    /// A frame could not be serialized
    Encode(serde_json::Error),
}

impl fmt::Display for ChatStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatStreamError::Synthesis(err) => write!(f, "speech synthesis failed: {}", err),
            ChatStreamError::Encode(err) => write!(f, "frame encoding failed: {}", err),
        }
    }
}

impl std::error::Error for ChatStreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChatStreamError::Synthesis(err) => Some(err),
            ChatStreamError::Encode(err) => Some(err),
        }
    }
}

impl From<SynthesisError> for ChatStreamError {
    fn from(err: SynthesisError) -> Self {
        ChatStreamError::Synthesis(err)
    }
}

impl From<serde_json::Error> for ChatStreamError {
    fn from(err: serde_json::Error) -> Self {
        ChatStreamError::Encode(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: ChatRequest = serde_json::from_str(r#"{"query": "What is the refund policy?"}"#).unwrap();
        assert_eq!(request.language, Language::English);
        assert!(!request.voice);
        assert!(request.history.is_empty());
        assert!(request.conversation_id.is_none());
    }

    #[test]
    fn test_request_with_language_alias() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"query": "退款政策是什么？", "language": "zh", "voice": true}"#).unwrap();
        assert_eq!(request.language, Language::Chinese);
        assert!(request.voice);
    }
}
