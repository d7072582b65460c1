//! # Event Multiplexer
//!
//! Translates the events of one generation call into the frames a client
//! receives, in the same order.
//!
//! ## Translation rules:
//! - **SourceBatch** → one `SourceList` frame, immediately (sources sharing a
//!   url are merged first)
//! - **TextDelta(text)**, text mode → one `TextChunk` with exactly that text
//! - **TextDelta(text)**, voice mode → buffered; each completed sentence is
//!   synthesized and sent as an `AudioChunk`
//! - **TextDelta(None)** → voice mode flushes the unfinished sentence; the
//!   stream ends
//! - **Error** (or an `Err` from upstream) → voice mode speaks the localized
//!   message as an `AudioChunk`, then one `ErrorFrame`; the stream ends.
//!   Both are sent because an `AudioChunk` looks like any other sentence of
//!   an answer; the trailing `ErrorFrame` is the only frame telling a voice
//!   client the answer failed, and it is the same marker text clients get.
//! - **Usage** → no frame, only recorded in the transcript
//!
//! ## Error convention:
//! Generation failures are delivered in-band: the HTTP response has already
//! started with status 200 and the client reads the `ErrorFrame`. Only a
//! synthesis failure ends the stream with an `Err` item, because no frame can
//! be built for that sentence.
//!
//! ## Telemetry:
//! Every event updates a [`TranscriptLog`]. It is persisted on a spawned task
//! after the last frame, so a slow store never holds back delivery.

use crate::chat::events::{coalesce_sources, GenerationEvent};
use crate::chat::frame::ResponseFrame;
use crate::chat::generator::EventStream;
use crate::chat::messages::error_message;
use crate::chat::sentence::SentenceAccumulator;
use crate::chat::transcript::{TranscriptLog, TranscriptStore};
use crate::chat::{ChatRequest, ChatStreamError};
use crate::locale::Language;
use crate::speech::synthesis::{SpeechSynthesizer, SynthesisError};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub type FrameStream = BoxStream<'static, Result<ResponseFrame, ChatStreamError>>;

pub struct EventMultiplexer {
    request: ChatRequest,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcripts: Arc<dyn TranscriptStore>,
}

impl EventMultiplexer {
    pub fn new(
        request: ChatRequest,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcripts: Arc<dyn TranscriptStore>,
    ) -> Self {
        Self {
            request,
            synthesizer,
            transcripts,
        }
    }

    /// Consume `upstream` and produce the ordered frame stream.
    pub fn run(self, upstream: EventStream) -> FrameStream {
        let EventMultiplexer {
            request,
            synthesizer,
            transcripts,
        } = self;
        let language = request.language;
        let voice = request.voice;

        let frames = async_stream::stream! {
            let mut upstream = upstream;
            let mut log = TranscriptLog::new(&request);
            let mut sentences = SentenceAccumulator::new();

            debug!(conversation_id = %log.conversation_id(), voice, language = %language, "Answer stream started");

            loop {
                let event = match upstream.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(err)) => GenerationEvent::Error(err),
                    None => GenerationEvent::end(),
                };
                log.record_event(&event);

                match event {
                    GenerationEvent::SourceBatch(sources) => {
                        let frame = ResponseFrame::SourceList { sources: coalesce_sources(sources) };
                        log.record_frame(&frame);
                        yield Ok(frame);
                    }
                    GenerationEvent::Usage(_) => {}
                    GenerationEvent::TextDelta(Some(content)) if !voice => {
                        let frame = ResponseFrame::text(content);
                        log.record_frame(&frame);
                        yield Ok(frame);
                    }
                    GenerationEvent::TextDelta(Some(content)) => {
                        let mut failure = None;
                        for sentence in sentences.push(&content) {
                            match speak(synthesizer.as_ref(), sentence, language).await {
                                Ok(frame) => {
                                    log.record_frame(&frame);
                                    yield Ok(frame);
                                }
                                Err(err) => {
                                    failure = Some(err);
                                    break;
                                }
                            }
                        }
                        if let Some(err) = failure {
                            error!(conversation_id = %log.conversation_id(), error = %err, "Speech synthesis failed, ending answer");
                            log.record_failure(err.to_string());
                            yield Err(ChatStreamError::from(err));
                            break;
                        }
                    }
                    GenerationEvent::TextDelta(None) => {
                        if voice {
                            if let Some(rest) = sentences.finish() {
                                match speak(synthesizer.as_ref(), rest, language).await {
                                    Ok(frame) => {
                                        log.record_frame(&frame);
                                        yield Ok(frame);
                                    }
                                    Err(err) => {
                                        error!(conversation_id = %log.conversation_id(), error = %err, "Speech synthesis failed on final sentence");
                                        log.record_failure(err.to_string());
                                        yield Err(ChatStreamError::from(err));
                                    }
                                }
                            }
                        }
                        break;
                    }
                    GenerationEvent::Error(err) => {
                        let message = error_message(&err, language);
                        warn!(conversation_id = %log.conversation_id(), error = %err, "Generation failed, sending in-band error");

                        if voice {
                            match speak(synthesizer.as_ref(), message.to_string(), language).await {
                                Ok(frame) => {
                                    log.record_frame(&frame);
                                    yield Ok(frame);
                                }
                                Err(synth_err) => {
                                    warn!(error = %synth_err, "Could not voice the error message");
                                }
                            }
                        }

                        let frame = ResponseFrame::error(message);
                        log.record_frame(&frame);
                        yield Ok(frame);
                        break;
                    }
                }
            }

            let record = log.into_record();
            info!(
                conversation_id = %record.conversation_id,
                frames = record.frames_emitted,
                elapsed_ms = record.elapsed_ms,
                failed = record.error.is_some(),
                "Answer stream finished"
            );
            tokio::spawn(async move {
                if let Err(err) = transcripts.save(&record).await {
                    warn!(conversation_id = %record.conversation_id, error = %err, "Failed to persist transcript");
                }
            });
        };

        frames.boxed()
    }
}

async fn speak(
    synthesizer: &dyn SpeechSynthesizer,
    text: String,
    language: Language,
) -> Result<ResponseFrame, SynthesisError> {
    let audio = synthesizer.synthesize(&text, language).await?;
    Ok(ResponseFrame::audio(text, &audio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::events::{GenerationError, Source};
    use crate::chat::messages::{CONTENT_FILTERED_ZH, CONTEXT_TOO_LONG_EN, GENERIC_FAILURE_EN};
    use crate::chat::transcript::TranscriptRecord;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSynthesizer {
        spoken: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl SpeechSynthesizer for RecordingSynthesizer {
        async fn synthesize(&self, text: &str, _language: Language) -> Result<Vec<u8>, SynthesisError> {
            if self.fail_on.as_deref() == Some(text) {
                return Err(SynthesisError::Rejected { status: 500, body: "boom".to_string() });
            }
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(format!("audio:{}", text).into_bytes())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<TranscriptRecord>>,
    }

    #[async_trait]
    impl TranscriptStore for MemoryStore {
        async fn save(&self, record: &TranscriptRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    impl MemoryStore {
        async fn wait_for_record(&self) -> TranscriptRecord {
            for _ in 0..100 {
                if let Some(record) = self.records.lock().unwrap().first().cloned() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("transcript was never persisted");
        }
    }

    fn upstream(events: Vec<GenerationEvent>) -> EventStream {
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn collect(
        request: ChatRequest,
        upstream: EventStream,
        synthesizer: Arc<RecordingSynthesizer>,
        store: Arc<MemoryStore>,
    ) -> Vec<Result<ResponseFrame, ChatStreamError>> {
        EventMultiplexer::new(request, synthesizer, store)
            .run(upstream)
            .collect()
            .await
    }

    async fn frames(request: ChatRequest, events: Vec<GenerationEvent>) -> Vec<ResponseFrame> {
        collect(
            request,
            upstream(events),
            Arc::new(RecordingSynthesizer::default()),
            Arc::new(MemoryStore::default()),
        )
        .await
        .into_iter()
        .map(|item| item.unwrap())
        .collect()
    }

    fn audio_texts(frames: &[ResponseFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                ResponseFrame::AudioChunk { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_text_mode_passthrough() {
        let output = frames(
            ChatRequest::new("q"),
            vec![GenerationEvent::text("Hel"), GenerationEvent::text("lo. "), GenerationEvent::end()],
        )
        .await;
        assert_eq!(output, vec![ResponseFrame::text("Hel"), ResponseFrame::text("lo. ")]);
    }

    #[tokio::test]
    async fn test_sources_keep_their_position() {
        let source = Source::new("a_0", "A", "https://kb/a");
        let output = frames(
            ChatRequest::new("q"),
            vec![
                GenerationEvent::text("before"),
                GenerationEvent::SourceBatch(vec![source.clone()]),
                GenerationEvent::text("after"),
                GenerationEvent::end(),
            ],
        )
        .await;
        let kinds: Vec<&str> = output.iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec!["text", "sources", "text"]);
    }

    #[tokio::test]
    async fn test_duplicate_url_sources_are_merged() {
        let source = Source::new("doc_0", "Refunds", "https://kb/refunds");
        let output = frames(
            ChatRequest::new("q"),
            vec![GenerationEvent::SourceBatch(vec![source.clone(), source]), GenerationEvent::end()],
        )
        .await;
        match output.as_slice() {
            [ResponseFrame::SourceList { sources }] => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].ids.len(), 2);
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_voice_mode_two_sentences() {
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let output: Vec<ResponseFrame> = collect(
            ChatRequest::new("q").with_voice(true),
            upstream(vec![
                GenerationEvent::text("Hello"),
                GenerationEvent::text(" world."),
                GenerationEvent::text(" How are you?"),
                GenerationEvent::end(),
            ]),
            synthesizer.clone(),
            Arc::new(MemoryStore::default()),
        )
        .await
        .into_iter()
        .map(|item| item.unwrap())
        .collect();

        assert_eq!(output.len(), 2);
        assert_eq!(audio_texts(&output), vec!["Hello world.", " How are you?"]);
        assert_eq!(output[0], ResponseFrame::audio("Hello world.", b"audio:Hello world."));
        assert_eq!(*synthesizer.spoken.lock().unwrap(), vec!["Hello world.", " How are you?"]);
    }

    #[tokio::test]
    async fn test_voice_segmentation_ignores_delta_boundaries() {
        let text = "Refunds take 14 days, sometimes less. Contact support! 谢谢。 Bye";
        let whole = frames(
            ChatRequest::new("q").with_voice(true),
            vec![GenerationEvent::text(text), GenerationEvent::end()],
        )
        .await;

        let mut pieces: Vec<GenerationEvent> = text
            .chars()
            .collect::<Vec<_>>()
            .chunks(3)
            .map(|chunk| GenerationEvent::text(chunk.iter().collect::<String>()))
            .collect();
        pieces.push(GenerationEvent::end());
        let split = frames(ChatRequest::new("q").with_voice(true), pieces).await;

        assert_eq!(audio_texts(&whole), audio_texts(&split));
        assert_eq!(audio_texts(&whole).len(), 5);
    }

    #[tokio::test]
    async fn test_content_filtered_in_chinese() {
        let upstream: EventStream = stream::iter(vec![Err(GenerationError::ContentFiltered)]).boxed();
        let output: Vec<ResponseFrame> = collect(
            ChatRequest::new("q").with_language(Language::Chinese),
            upstream,
            Arc::new(RecordingSynthesizer::default()),
            Arc::new(MemoryStore::default()),
        )
        .await
        .into_iter()
        .map(|item| item.unwrap())
        .collect();

        assert_eq!(output, vec![ResponseFrame::error(CONTENT_FILTERED_ZH)]);
    }

    #[tokio::test]
    async fn test_error_ends_stream_even_with_more_events() {
        let output = frames(
            ChatRequest::new("q"),
            vec![
                GenerationEvent::text("partial"),
                GenerationEvent::Error(GenerationError::Other("socket reset".to_string())),
                GenerationEvent::text("never sent"),
                GenerationEvent::end(),
            ],
        )
        .await;
        assert_eq!(output, vec![ResponseFrame::text("partial"), ResponseFrame::error(GENERIC_FAILURE_EN)]);
    }

    #[tokio::test]
    async fn test_voice_mode_error_is_spoken_then_sent() {
        let output = frames(
            ChatRequest::new("q").with_voice(true),
            vec![GenerationEvent::Error(GenerationError::ContextTooLong)],
        )
        .await;
        let kinds: Vec<&str> = output.iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec!["audio", "error"]);
        assert_eq!(audio_texts(&output), vec![CONTEXT_TOO_LONG_EN.to_string()]);
        assert_eq!(output.last(), Some(&ResponseFrame::error(CONTEXT_TOO_LONG_EN)));
    }

    #[tokio::test]
    async fn test_missing_end_marker_still_flushes() {
        let output = frames(
            ChatRequest::new("q").with_voice(true),
            vec![GenerationEvent::text("No terminal mark")],
        )
        .await;
        assert_eq!(audio_texts(&output), vec!["No terminal mark"]);
    }

    #[tokio::test]
    async fn test_synthesis_failure_ends_stream() {
        let synthesizer = Arc::new(RecordingSynthesizer {
            spoken: Mutex::new(Vec::new()),
            fail_on: Some(" Second.".to_string()),
        });
        let store = Arc::new(MemoryStore::default());
        let output = collect(
            ChatRequest::new("q").with_voice(true),
            upstream(vec![
                GenerationEvent::text("First. Second. Third."),
                GenerationEvent::text(" More"),
                GenerationEvent::end(),
            ]),
            synthesizer,
            store.clone(),
        )
        .await;

        assert_eq!(output.len(), 2);
        assert!(output[0].is_ok());
        assert!(matches!(output[1], Err(ChatStreamError::Synthesis(_))));

        let record = store.wait_for_record().await;
        assert!(record.error.unwrap().contains("synthesis rejected"));
    }

    #[tokio::test]
    async fn test_transcript_persisted_after_last_frame() {
        let store = Arc::new(MemoryStore::default());
        let mut request = ChatRequest::new("How do refunds work?");
        request.conversation_id = Some("conv-7".to_string());
        let output = collect(
            request,
            upstream(vec![
                GenerationEvent::SourceBatch(vec![Source::new("a_0", "A", "https://kb/a")]),
                GenerationEvent::text("Within "),
                GenerationEvent::text("14 days."),
                GenerationEvent::end(),
            ]),
            Arc::new(RecordingSynthesizer::default()),
            store.clone(),
        )
        .await;
        assert_eq!(output.len(), 3);

        let record = store.wait_for_record().await;
        assert_eq!(record.conversation_id, "conv-7");
        assert_eq!(record.answer, "Within 14 days.");
        assert_eq!(record.frames_emitted, 3);
        assert_eq!(record.sources.len(), 1);
    }
}
