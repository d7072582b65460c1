//! # Generation Events
//!
//! The irregular stream a generation call produces, normalized into one enum.
//! Events arrive in strict generation order; `TextDelta(None)` marks the end of
//! the call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A retrieved knowledge-base document.
///
/// `ids` holds every retrieved chunk id that points at this document's url,
/// in retrieval order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub ids: Vec<String>,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
}

impl Source {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            title: title.into(),
            url: url.into(),
            category: None,
            filepath: None,
        }
    }
}

/// Token counts reported by the generation service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Why a generation call stopped producing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The prompt or the answer tripped the provider's content filter
    ContentFiltered,
    /// Filtered for self-harm; answered with helpline information
    SelfHarmFiltered,
    /// Question plus history plus retrieved passages exceed the context window
    ContextTooLong,
    /// Anything else (network, HTTP status, malformed stream)
    Other(String),
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::ContentFiltered => write!(f, "content filtered"),
            GenerationError::SelfHarmFiltered => write!(f, "content filtered (self-harm)"),
            GenerationError::ContextTooLong => write!(f, "context length exceeded"),
            GenerationError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for GenerationError {}

/// One event of a generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Next piece of answer text; `None` ends the stream
    TextDelta(Option<String>),
    /// Passages the answer is grounded on
    SourceBatch(Vec<Source>),
    /// Token accounting; produces no frame
    Usage(TokenUsage),
    /// The call failed; no further text follows
    Error(GenerationError),
}

impl GenerationEvent {
    pub fn text(content: impl Into<String>) -> Self {
        GenerationEvent::TextDelta(Some(content.into()))
    }

    pub fn end() -> Self {
        GenerationEvent::TextDelta(None)
    }
}

/// Merge sources that share a url into one entry with the ids accumulated.
///
/// Urls keep the order in which they were first seen.
pub fn coalesce_sources(sources: Vec<Source>) -> Vec<Source> {
    let mut merged: Vec<Source> = Vec::with_capacity(sources.len());
    let mut by_url: HashMap<String, usize> = HashMap::new();

    for source in sources {
        match by_url.get(&source.url) {
            Some(&index) => {
                let existing = &mut merged[index];
                existing.ids.extend(source.ids);
                if existing.category.is_none() {
                    existing.category = source.category;
                }
            }
            None => {
                by_url.insert(source.url.clone(), merged.len());
                merged.push(source);
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_same_url() {
        let a = Source::new("doc-1_0", "Refunds", "https://kb.example.com/refunds");
        let merged = coalesce_sources(vec![a.clone(), a]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].ids, vec!["doc-1_0", "doc-1_0"]);
    }

    #[test]
    fn test_coalesce_keeps_first_seen_order() {
        let sources = vec![
            Source::new("b_0", "B", "https://kb.example.com/b"),
            Source::new("a_0", "A", "https://kb.example.com/a"),
            Source::new("b_1", "B", "https://kb.example.com/b"),
        ];
        let merged = coalesce_sources(sources);
        let urls: Vec<_> = merged.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["https://kb.example.com/b", "https://kb.example.com/a"]);
        assert_eq!(merged[0].ids, vec!["b_0", "b_1"]);
    }

    #[test]
    fn test_coalesce_fills_missing_category() {
        let first = Source::new("x_0", "X", "https://kb.example.com/x");
        let mut second = Source::new("x_1", "X", "https://kb.example.com/x");
        second.category = Some("billing".to_string());
        let merged = coalesce_sources(vec![first, second]);
        assert_eq!(merged[0].category.as_deref(), Some("billing"));
    }
}
