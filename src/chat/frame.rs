//! # Response Frames
//!
//! The only thing that crosses the transport boundary on the answer path.
//! Frames are written as newline-delimited JSON, one object per line, in the
//! order the multiplexer produced them.
//!
//! ## Wire format:
//! ```text
//! {"type":"sources","sources":[{"ids":["doc_0"],"title":"...","url":"..."}]}
//! {"type":"text","text":"Refunds are "}
//! {"type":"audio","text":"Refunds are issued within 14 days.","audio":"SUQzBAAAAA..."}
//! {"type":"error","message":"Sorry, ..."}
//! ```

use crate::chat::events::Source;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseFrame {
    #[serde(rename = "text")]
    TextChunk { text: String },

    #[serde(rename = "sources")]
    SourceList { sources: Vec<Source> },

    /// Synthesized speech for `text`, base64-encoded
    #[serde(rename = "audio")]
    AudioChunk { text: String, audio: String },

    #[serde(rename = "error")]
    ErrorFrame { message: String },
}

impl ResponseFrame {
    pub fn text(text: impl Into<String>) -> Self {
        ResponseFrame::TextChunk { text: text.into() }
    }

    pub fn audio(text: impl Into<String>, audio: &[u8]) -> Self {
        ResponseFrame::AudioChunk {
            text: text.into(),
            audio: general_purpose::STANDARD.encode(audio),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ResponseFrame::ErrorFrame { message: message.into() }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseFrame::TextChunk { .. } => "text",
            ResponseFrame::SourceList { .. } => "sources",
            ResponseFrame::AudioChunk { .. } => "audio",
            ResponseFrame::ErrorFrame { .. } => "error",
        }
    }

    /// Serialize as one NDJSON line (trailing `\n` included).
    pub fn to_ndjson(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
