//! # Speech Synthesis
//!
//! Voice-mode answers are spoken one sentence at a time. The multiplexer only
//! depends on the [`SpeechSynthesizer`] trait; [`HttpSpeechSynthesizer`] is the
//! hosted text-to-speech client used by the server.
//!
//! ## Request format:
//! The hosted endpoint takes SSML and returns encoded audio bytes:
//! ```text
//! POST {synthesis_endpoint}
//! Content-Type: application/ssml+xml
//! X-Microsoft-OutputFormat: audio-16khz-32kbitrate-mono-mp3
//!
//! <speak version='1.0' xml:lang='en-US'><voice name='en-US-JennyNeural'>...</voice></speak>
//! ```

use crate::config::SpeechConfig;
use crate::credentials::ServiceCredential;
use crate::locale::Language;
use async_trait::async_trait;
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Why a synthesis call failed. Synthesis errors are not retried.
#[derive(Debug)]
pub enum SynthesisError {
    /// The request never got a response
    Transport(String),
    /// The service answered with a non-success status
    Rejected { status: u16, body: String },
    /// The service answered with no audio
    EmptyAudio,
}

impl fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisError::Transport(msg) => write!(f, "synthesis request failed: {}", msg),
            SynthesisError::Rejected { status, body } => {
                write!(f, "synthesis rejected with status {}: {}", status, body)
            }
            SynthesisError::EmptyAudio => write!(f, "synthesis returned no audio"),
        }
    }
}

impl std::error::Error for SynthesisError {}

impl From<reqwest::Error> for SynthesisError {
    fn from(err: reqwest::Error) -> Self {
        SynthesisError::Transport(err.to_string())
    }
}

/// Text-to-speech capability.
///
/// The language is chosen per call so one synthesizer serves every request.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, language: Language) -> Result<Vec<u8>, SynthesisError>;
}

/// Hosted text-to-speech client.
pub struct HttpSpeechSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    output_format: String,
    english_voice: String,
    chinese_voice: String,
    malay_voice: String,
    tamil_voice: String,
    credential: ServiceCredential,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: &SpeechConfig, credential: ServiceCredential) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.synthesis_endpoint.clone(),
            output_format: config.output_format.clone(),
            english_voice: config.english_voice.clone(),
            chinese_voice: config.chinese_voice.clone(),
            malay_voice: config.malay_voice.clone(),
            tamil_voice: config.tamil_voice.clone(),
            credential,
        }
    }

    fn voice(&self, language: Language) -> &str {
        match language {
            Language::English => &self.english_voice,
            Language::Chinese => &self.chinese_voice,
            Language::Malay => &self.malay_voice,
            Language::Tamil => &self.tamil_voice,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str, language: Language) -> Result<Vec<u8>, SynthesisError> {
        let start_time = Instant::now();
        let body = build_ssml(text, language, self.voice(language));

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", &self.output_format)
            .body(body);
        if let Some(key) = self.credential.secret() {
            request = request.header("Ocp-Apim-Subscription-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }

        debug!(
            language = %language,
            chars = text.chars().count(),
            bytes = audio.len(),
            duration_ms = %start_time.elapsed().as_millis(),
            "Synthesized sentence"
        );
        Ok(audio.to_vec())
    }
}

fn build_ssml(text: &str, language: Language, voice: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='{}'><voice name='{}'>{}</voice></speak>",
        language.locale(),
        escape_xml(voice),
        escape_xml(strip_markdown(text).trim())
    )
}

/// Drop markdown emphasis markers so they are not read aloud.
fn strip_markdown(text: &str) -> String {
    text.replace('*', "")
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}
