//! # Generation Call
//!
//! The [`Generator`] trait is the seam between the streaming core and the
//! hosted language model. The multiplexer only sees an [`EventStream`].
//!
//! [`OpenAiGenerator`] talks to an OpenAI-compatible chat-completions endpoint
//! with `stream: true`. When a search index is configured it is passed along as
//! a data source, and the deployment returns the retrieved passages as
//! `citations` inside the first delta's `context`.
//!
//! ## Stream format (server-sent events):
//! ```text
//! data: {"choices":[{"delta":{"context":{"citations":[...]}}}]}
//! data: {"choices":[{"delta":{"content":"Refunds"}}]}
//! data: {"choices":[{"delta":{},"finish_reason":"stop"}]}
//! data: {"choices":[],"usage":{"prompt_tokens":812,"completion_tokens":64}}
//! data: [DONE]
//! ```

use crate::chat::events::{GenerationError, GenerationEvent, Source, TokenUsage};
use crate::chat::ChatRequest;
use crate::config::GenerationConfig;
use crate::credentials::ServiceCredential;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Ordered events of one generation call. An `Err` item ends the call.
pub type EventStream = BoxStream<'static, Result<GenerationEvent, GenerationError>>;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Start a generation call for `request`.
    ///
    /// Errors returned here (instead of inside the stream) mean the call was
    /// rejected before any event was produced.
    async fn generate(&self, request: &ChatRequest) -> Result<EventStream, GenerationError>;
}

/// A stream that fails immediately; lets callers treat a rejected call like
/// any other in-band error.
pub fn failed_stream(error: GenerationError) -> EventStream {
    stream::once(async move { Err(error) }).boxed()
}

pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: GenerationConfig,
    credential: ServiceCredential,
    search_credential: ServiceCredential,
}

impl OpenAiGenerator {
    pub fn new(
        config: GenerationConfig,
        credential: ServiceCredential,
        search_credential: ServiceCredential,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            credential,
            search_credential,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if !self.config.system_prompt.trim().is_empty() {
            messages.push(json!({"role": "system", "content": self.config.system_prompt}));
        }
        for turn in &request.history {
            messages.push(json!({"role": turn.role, "content": turn.content}));
        }
        messages.push(json!({"role": "user", "content": request.query}));

        let mut body = json!({
            "messages": messages,
            "stream": true,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "stream_options": {"include_usage": true},
        });

        if !self.config.search_endpoint.is_empty() && !self.config.search_index.is_empty() {
            let mut parameters = json!({
                "endpoint": self.config.search_endpoint,
                "index_name": self.config.search_index,
            });
            if let Some(key) = self.search_credential.secret() {
                parameters["authentication"] = json!({"type": "api_key", "key": key});
            }
            body["data_sources"] = json!([{"type": "azure_search", "parameters": parameters}]);
        }

        body
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, request: &ChatRequest) -> Result<EventStream, GenerationError> {
        let mut http = self.client.post(&self.config.endpoint).json(&self.build_body(request));
        if let Some(key) = self.credential.secret() {
            http = if self.config.api_key_header.eq_ignore_ascii_case("authorization") {
                http.bearer_auth(key)
            } else {
                http.header(self.config.api_key_header.as_str(), key)
            };
        }

        let response = http
            .send()
            .await
            .map_err(|e| GenerationError::Other(format!("generation request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "Generation call rejected");
            return Err(classify_failure(status.as_u16(), &body));
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let events = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            let mut ended = false;

            while !ended {
                let lines = match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(err)) => {
                        yield Err(GenerationError::Other(format!("generation stream interrupted: {}", err)));
                        ended = true;
                        continue;
                    }
                    None => {
                        ended = true;
                        decoder.finish()
                    }
                };

                for line in lines {
                    for event in parse_sse_line(&line) {
                        let terminal = matches!(
                            event,
                            Err(_) | Ok(GenerationEvent::TextDelta(None)) | Ok(GenerationEvent::Error(_))
                        );
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                }
            }

            debug!("Generation stream closed without [DONE]");
            yield Ok(GenerationEvent::end());
        };

        Ok(events.boxed())
    }
}

/// Map a rejected call onto the error taxonomy.
pub fn classify_failure(status: u16, body: &str) -> GenerationError {
    let lowered = body.to_ascii_lowercase();
    if lowered.contains("context_length_exceeded") || lowered.contains("maximum context length") {
        GenerationError::ContextTooLong
    } else if lowered.contains("content_filter") || lowered.contains("responsibleaipolicyviolation") {
        let self_harm = serde_json::from_str::<serde_json::Value>(body)
            .map(|value| {
                self_harm_filtered(&value["error"]["innererror"]["content_filter_result"])
                    || self_harm_filtered(&value["innererror"]["content_filter_result"])
            })
            .unwrap_or(false);
        if self_harm {
            GenerationError::SelfHarmFiltered
        } else {
            GenerationError::ContentFiltered
        }
    } else {
        let snippet: String = body.chars().take(200).collect();
        GenerationError::Other(format!("generation service returned {}: {}", status, snippet))
    }
}

/// `true` when a content-filter result marks the self-harm category as filtered.
fn self_harm_filtered(filter_result: &serde_json::Value) -> bool {
    filter_result["self_harm"]["filtered"].as_bool().unwrap_or(false)
}

/// Splits a byte stream into complete lines. Multi-byte characters may be cut
/// across chunks, so bytes are buffered until a newline arrives.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(&mut self) -> Vec<String> {
        let rest = String::from_utf8_lossy(&std::mem::take(&mut self.buffer))
            .trim()
            .to_string();
        if rest.is_empty() {
            Vec::new()
        } else {
            vec![rest]
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
    #[serde(default)]
    content_filter_results: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    context: Option<DeltaContext>,
}

#[derive(Debug, Deserialize)]
struct DeltaContext {
    #[serde(default)]
    citations: Vec<Citation>,
}

#[derive(Debug, Deserialize)]
struct Citation {
    title: Option<String>,
    url: Option<String>,
    filepath: Option<String>,
    chunk_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Translate one SSE line into zero or more events, in payload order:
/// citations, then text, then finish reason, then usage.
fn parse_sse_line(line: &str) -> Vec<Result<GenerationEvent, GenerationError>> {
    let payload = match line.strip_prefix("data:") {
        Some(payload) => payload.trim(),
        None => return Vec::new(),
    };
    if payload == "[DONE]" {
        return vec![Ok(GenerationEvent::end())];
    }

    let chunk: CompletionChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(err) => {
            return vec![Err(GenerationError::Other(format!("malformed stream chunk: {}", err)))];
        }
    };

    // Error chunks share the shape of a rejected call's body
    if chunk.error.is_some() {
        return vec![Err(classify_failure(200, payload))];
    }

    let mut events = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(delta) = choice.delta {
            if let Some(context) = delta.context {
                if !context.citations.is_empty() {
                    let sources = context
                        .citations
                        .into_iter()
                        .enumerate()
                        .map(|(index, citation)| citation_to_source(index, citation))
                        .collect();
                    events.push(Ok(GenerationEvent::SourceBatch(sources)));
                }
            }
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                events.push(Ok(GenerationEvent::TextDelta(Some(content))));
            }
        }
        if choice.finish_reason.as_deref() == Some("content_filter") {
            let error = if self_harm_filtered(&choice.content_filter_results) {
                GenerationError::SelfHarmFiltered
            } else {
                GenerationError::ContentFiltered
            };
            events.push(Ok(GenerationEvent::Error(error)));
        }
    }

    if let Some(usage) = chunk.usage {
        events.push(Ok(GenerationEvent::Usage(TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })));
    }

    events
}

fn citation_to_source(index: usize, citation: Citation) -> Source {
    let url = citation
        .url
        .clone()
        .or_else(|| citation.filepath.clone())
        .unwrap_or_default();
    let id = citation
        .chunk_id
        .clone()
        .or_else(|| citation.filepath.clone())
        .unwrap_or_else(|| format!("citation-{}", index));
    let category = citation
        .filepath
        .as_deref()
        .and_then(|path| path.rsplit_once('/'))
        .map(|(dir, _)| dir.to_string())
        .filter(|dir| !dir.is_empty());

    Source {
        ids: vec![id],
        title: citation.title.unwrap_or_default(),
        url,
        category,
        filepath: citation.filepath,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatTurn;

    #[test]
    fn test_parse_text_delta() {
        let events = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#);
        assert_eq!(events, vec![Ok(GenerationEvent::text("Hello"))]);
    }

    #[test]
    fn test_parse_done_and_comments() {
        assert_eq!(parse_sse_line("data: [DONE]"), vec![Ok(GenerationEvent::end())]);
        assert!(parse_sse_line(": keep-alive").is_empty());
    }

    #[test]
    fn test_parse_citations_before_text() {
        let line = r#"data: {"choices":[{"delta":{"content":"See","context":{"citations":[{"title":"Refunds","url":"https://kb/refunds","filepath":"billing/refunds.md","chunk_id":"0"}]}}}]}"#;
        let events = parse_sse_line(line);
        assert_eq!(events.len(), 2);
        match &events[0] {
            Ok(GenerationEvent::SourceBatch(sources)) => {
                assert_eq!(sources[0].ids, vec!["0"]);
                assert_eq!(sources[0].url, "https://kb/refunds");
                assert_eq!(sources[0].category.as_deref(), Some("billing"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events[1], Ok(GenerationEvent::text("See")));
    }

    #[test]
    fn test_parse_content_filter_finish() {
        let events = parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"content_filter"}]}"#);
        assert_eq!(events, vec![Ok(GenerationEvent::Error(GenerationError::ContentFiltered))]);
    }

    #[test]
    fn test_parse_usage() {
        let events = parse_sse_line(r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":3}}"#);
        assert_eq!(
            events,
            vec![Ok(GenerationEvent::Usage(TokenUsage { prompt_tokens: 10, completion_tokens: 3 }))]
        );
    }

    #[test]
    fn test_parse_malformed_chunk() {
        let events = parse_sse_line("data: {not json");
        assert!(matches!(events.as_slice(), [Err(GenerationError::Other(_))]));
    }

    #[test]
    fn test_classify_failure() {
        let body = r#"{"error":{"code":"context_length_exceeded","message":"This model's maximum context length is 8192 tokens."}}"#;
        assert_eq!(classify_failure(400, body), GenerationError::ContextTooLong);
        let body = r#"{"error":{"code":"content_filter","message":"The response was filtered"}}"#;
        assert_eq!(classify_failure(400, body), GenerationError::ContentFiltered);
        assert!(matches!(classify_failure(502, "bad gateway"), GenerationError::Other(_)));
    }

    #[test]
    fn test_classify_self_harm_filter() {
        let body = r#"{"error":{"code":"content_filter","message":"The prompt was filtered","innererror":{"code":"ResponsibleAIPolicyViolation","content_filter_result":{"hate":{"filtered":false,"severity":"safe"},"self_harm":{"filtered":true,"severity":"medium"}}}}}"#;
        assert_eq!(classify_failure(400, body), GenerationError::SelfHarmFiltered);

        let body = r#"{"error":{"code":"content_filter","innererror":{"content_filter_result":{"self_harm":{"filtered":false},"violence":{"filtered":true}}}}}"#;
        assert_eq!(classify_failure(400, body), GenerationError::ContentFiltered);
    }

    #[test]
    fn test_parse_self_harm_in_stream() {
        let line = r#"data: {"error":{"code":"content_filter","message":"filtered","innererror":{"content_filter_result":{"self_harm":{"filtered":true}}}}}"#;
        assert_eq!(parse_sse_line(line), vec![Err(GenerationError::SelfHarmFiltered)]);

        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"content_filter","content_filter_results":{"self_harm":{"filtered":true,"severity":"high"}}}]}"#;
        assert_eq!(
            parse_sse_line(line),
            vec![Ok(GenerationEvent::Error(GenerationError::SelfHarmFiltered))]
        );
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        let text = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\n";
        let bytes = text.as_bytes();
        let (first, second) = bytes.split_at(40);
        assert!(decoder.push(first).is_empty());
        let lines = decoder.push(second);
        assert_eq!(lines.len(), 1);
        assert_eq!(parse_sse_line(&lines[0]), vec![Ok(GenerationEvent::text("你好"))]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_body_includes_history_and_search() {
        let mut config = crate::config::AppConfig::default().generation;
        config.system_prompt = "Answer from the knowledge base.".to_string();
        config.search_endpoint = "https://search.example.com".to_string();
        config.search_index = "kb".to_string();
        let generator = OpenAiGenerator::new(
            config,
            ServiceCredential::fixed("k"),
            ServiceCredential::fixed("search-key"),
        );

        let mut request = ChatRequest::new("And for annual plans?");
        request.history.push(ChatTurn {
            role: "user".to_string(),
            content: "How do refunds work?".to_string(),
        });
        let body = generator.build_body(&request);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], "And for annual plans?");
        assert_eq!(body["stream"], true);
        assert_eq!(body["data_sources"][0]["parameters"]["index_name"], "kb");
        assert_eq!(body["data_sources"][0]["parameters"]["authentication"]["key"], "search-key");
    }
}
