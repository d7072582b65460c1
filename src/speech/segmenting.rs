//! # Segmenting Recognizer
//!
//! Continuous recognition built on a hosted "transcribe this file" endpoint.
//! Incoming PCM is cut into segments and each segment is posted as a WAV file.
//!
//! ## Segment rules:
//! - every `partial_interval` of new audio → transcribe the segment so far and
//!   report it as a partial (best effort, failures only logged)
//! - segment reaches `max_segment`, a flush arrives, or audio ends → transcribe
//!   and report a final, then start a new segment
//! - a failed final → `on_canceled` with the reason, then `on_stopped`
//!
//! ## Threading:
//! Each engine runs one worker thread with its own current-thread tokio
//! runtime, so blocking reads on the audio channel never stall the server's
//! executor and results are reported from a thread the session does not own.

use crate::config::TranscriptionConfig;
use crate::credentials::ServiceCredential;
use crate::locale::Language;
use crate::speech::recognizer::{RecognitionCallbacks, RecognitionEngine, RecognitionError, RecognizerFactory};
use crate::speech::stream_source::{AudioRead, AudioStreamReader};
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use serde::Deserialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const READ_WAIT: Duration = Duration::from_millis(50);
const BYTES_PER_SAMPLE: usize = 2;

/// Turns one WAV segment into text.
#[async_trait]
pub trait SegmentTranscriber: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>, language: Language) -> Result<String, RecognitionError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Hosted transcription client (`multipart/form-data` upload, JSON reply).
pub struct HttpSegmentTranscriber {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    credential: ServiceCredential,
}

impl HttpSegmentTranscriber {
    pub fn new(config: &TranscriptionConfig, credential: ServiceCredential) -> Result<Self, RecognitionError> {
        // Requests run on short-lived per-engine runtimes; a pooled connection
        // would outlive the runtime that opened it.
        let client = reqwest::Client::builder().pool_max_idle_per_host(0).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            credential,
        })
    }
}

#[async_trait]
impl SegmentTranscriber for HttpSegmentTranscriber {
    async fn transcribe(&self, wav: Vec<u8>, language: Language) -> Result<String, RecognitionError> {
        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("language", language.code());

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = self.credential.secret() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecognitionError::Request(format!("status {}: {}", status.as_u16(), body)));
        }

        let parsed: TranscriptionResponse = response.json().await?;
        Ok(parsed.text.trim().to_string())
    }
}

/// Segment sizes, in bytes of 16-bit mono PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSettings {
    pub sample_rate: u32,
    pub partial_bytes: usize,
    pub max_segment_bytes: usize,
}

impl SegmentSettings {
    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            partial_bytes: pcm_bytes(config.partial_interval_ms, config.sample_rate),
            max_segment_bytes: pcm_bytes(config.max_segment_ms, config.sample_rate),
        }
    }
}

/// Bytes of 16-bit mono PCM covering `ms`, in whole samples (at least one).
fn pcm_bytes(ms: u64, sample_rate: u32) -> usize {
    let samples = ms * sample_rate as u64 / 1000;
    (samples as usize * BYTES_PER_SAMPLE).max(BYTES_PER_SAMPLE)
}

pub struct SegmentingRecognizer {
    transcriber: Arc<dyn SegmentTranscriber>,
    language: Language,
    settings: SegmentSettings,
    stop: Arc<AtomicBool>,
    started: bool,
}

impl SegmentingRecognizer {
    pub fn new(transcriber: Arc<dyn SegmentTranscriber>, language: Language, settings: SegmentSettings) -> Self {
        Self {
            transcriber,
            language,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
            started: false,
        }
    }
}

impl RecognitionEngine for SegmentingRecognizer {
    fn start(&mut self, reader: AudioStreamReader, callbacks: RecognitionCallbacks) -> Result<(), RecognitionError> {
        if self.started {
            return Err(RecognitionError::AlreadyStarted);
        }

        let worker = SegmentWorker {
            reader,
            callbacks,
            transcriber: self.transcriber.clone(),
            language: self.language,
            settings: self.settings,
            stop: self.stop.clone(),
            segment: Vec::new(),
            since_partial: 0,
        };

        thread::Builder::new()
            .name("segment-recognizer".to_string())
            .spawn(move || worker.run())
            .map_err(|err| RecognitionError::Startup(err.to_string()))?;

        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct SegmentWorker {
    reader: AudioStreamReader,
    callbacks: RecognitionCallbacks,
    transcriber: Arc<dyn SegmentTranscriber>,
    language: Language,
    settings: SegmentSettings,
    stop: Arc<AtomicBool>,
    segment: Vec<u8>,
    since_partial: usize,
}

impl SegmentWorker {
    fn run(mut self) {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(error = %err, "Failed to build recognizer runtime");
                (self.callbacks.on_canceled)(format!("recognizer failed to start: {}", err));
                (self.callbacks.on_stopped)();
                return;
            }
        };

        info!(language = %self.language, "Segment recognizer started");
        while !self.stop.load(Ordering::SeqCst) {
            let keep_going = match self.reader.read_timeout(READ_WAIT) {
                AudioRead::Audio(bytes) => {
                    self.segment.extend_from_slice(&bytes);
                    self.since_partial += bytes.len();
                    if self.segment.len() >= self.settings.max_segment_bytes {
                        self.finalize(&runtime)
                    } else {
                        if self.since_partial >= self.settings.partial_bytes {
                            self.partial(&runtime);
                        }
                        true
                    }
                }
                AudioRead::Flush => self.finalize(&runtime),
                AudioRead::Idle => true,
                AudioRead::Closed => {
                    self.finalize(&runtime);
                    false
                }
            };
            if !keep_going {
                break;
            }
        }

        debug!(language = %self.language, "Segment recognizer stopped");
        (self.callbacks.on_stopped)();
    }

    fn partial(&mut self, runtime: &tokio::runtime::Runtime) {
        self.since_partial = 0;
        let wav = match pcm_to_wav(&self.segment, self.settings.sample_rate) {
            Ok(wav) => wav,
            Err(err) => {
                warn!(error = %err, "Could not encode partial segment");
                return;
            }
        };
        match runtime.block_on(self.transcriber.transcribe(wav, self.language)) {
            Ok(text) if !text.is_empty() => (self.callbacks.on_partial)(text),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "Partial transcription failed"),
        }
    }

    /// Returns false when recognition must stop.
    fn finalize(&mut self, runtime: &tokio::runtime::Runtime) -> bool {
        self.since_partial = 0;
        if self.segment.is_empty() {
            return true;
        }
        let segment = std::mem::take(&mut self.segment);
        let start_time = Instant::now();

        let result = match pcm_to_wav(&segment, self.settings.sample_rate) {
            Ok(wav) => runtime.block_on(self.transcriber.transcribe(wav, self.language)),
            Err(err) => Err(RecognitionError::Request(err.to_string())),
        };

        match result {
            Ok(text) => {
                debug!(
                    bytes = segment.len(),
                    chars = text.chars().count(),
                    duration_ms = %start_time.elapsed().as_millis(),
                    "Segment transcribed"
                );
                if !text.is_empty() {
                    (self.callbacks.on_final)(text);
                }
                true
            }
            Err(err) => {
                error!(error = %err, bytes = segment.len(), "Segment transcription failed, canceling recognition");
                (self.callbacks.on_canceled)(err.to_string());
                false
            }
        }
    }
}

/// Wrap 16-bit mono little-endian PCM in a WAV container. A trailing odd
/// byte is dropped.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> io::Result<Vec<u8>> {
    let data = &pcm[..pcm.len() - pcm.len() % BYTES_PER_SAMPLE];
    let data_len = data.len() as u32;
    let block_align = BYTES_PER_SAMPLE as u16;

    let mut wav = Vec::with_capacity(44 + data.len());
    wav.write_all(b"RIFF")?;
    wav.write_u32::<LittleEndian>(36 + data_len)?;
    wav.write_all(b"WAVE")?;

    wav.write_all(b"fmt ")?;
    wav.write_u32::<LittleEndian>(16)?;
    wav.write_u16::<LittleEndian>(1)?; // PCM
    wav.write_u16::<LittleEndian>(1)?; // mono
    wav.write_u32::<LittleEndian>(sample_rate)?;
    wav.write_u32::<LittleEndian>(sample_rate * block_align as u32)?;
    wav.write_u16::<LittleEndian>(block_align)?;
    wav.write_u16::<LittleEndian>(16)?;

    wav.write_all(b"data")?;
    wav.write_u32::<LittleEndian>(data_len)?;
    wav.write_all(data)?;
    Ok(wav)
}

/// Builds one [`SegmentingRecognizer`] per session over a shared transcriber.
pub struct SegmentingRecognizerFactory {
    transcriber: Arc<dyn SegmentTranscriber>,
    settings: SegmentSettings,
}

impl SegmentingRecognizerFactory {
    pub fn new(transcriber: Arc<dyn SegmentTranscriber>, settings: SegmentSettings) -> Self {
        Self { transcriber, settings }
    }
}

impl RecognizerFactory for SegmentingRecognizerFactory {
    fn create(&self, language: Language) -> Result<Box<dyn RecognitionEngine>, RecognitionError> {
        Ok(Box::new(SegmentingRecognizer::new(
            self.transcriber.clone(),
            language,
            self.settings,
        )))
    }
}
