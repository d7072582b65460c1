//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nesting levels)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_TRANSCRIPTION__IDLE_TIMEOUT_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Secrets:
//! API keys are never stored here. Each hosted service names the environment
//! variable its key is read from, and the key itself is resolved (and refreshed)
//! by [`crate::credentials::ServiceCredential`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each hosted collaborator (generation, synthesis, recognition) gets its own
/// section so it can be pointed at a different deployment without touching the
/// streaming core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub generation: GenerationConfig,
    pub speech: SpeechConfig,
    pub transcription: TranscriptionConfig,
    pub storage: StorageConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Hosted chat-completion deployment used to answer questions.
///
/// ## Fields:
/// - `endpoint`: Full URL of the streaming chat-completions route
/// - `api_key_env`: Environment variable holding the key
/// - `api_key_header`: Header the key is sent in (`api-key` or `Authorization`)
/// - `search_endpoint` / `search_index`: Knowledge index handed to the
///   deployment as a data source; empty strings disable retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub api_key_header: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub search_endpoint: String,
    pub search_index: String,
    pub search_key_env: String,
}

/// Text-to-speech deployment used for voice-mode answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub synthesis_endpoint: String,
    pub api_key_env: String,
    pub output_format: String,
    pub english_voice: String,
    pub chinese_voice: String,
    pub malay_voice: String,
    pub tamil_voice: String,
}

/// Live transcription settings.
///
/// ## Timing fields:
/// - `partial_interval_ms`: How much new audio triggers a partial result
/// - `max_segment_ms`: Longest segment before a final result is forced
/// - `poll_interval_ms`: Bounded wait of the send loop and recognizer reads
/// - `idle_timeout_secs`: Connections with no client activity are closed
/// - `drain_timeout_secs`: Upper bound on waiting for the recognizer to finish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub model: String,
    pub sample_rate: u32,
    pub partial_interval_ms: u64,
    pub max_segment_ms: u64,
    pub poll_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub drain_timeout_secs: u64,
}

/// Where conversation transcripts are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub transcript_path: String,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Maximum number of live transcription connections
/// - `credential_refresh_secs`: How long a resolved API key is reused before
///   it is read again from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub credential_refresh_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            generation: GenerationConfig {
                endpoint: "http://127.0.0.1:8000/v1/chat/completions".to_string(),
                api_key_env: "GENERATION_API_KEY".to_string(),
                api_key_header: "api-key".to_string(),
                system_prompt: String::new(),
                temperature: 0.0,
                max_tokens: 800,
                search_endpoint: String::new(),
                search_index: String::new(),
                search_key_env: "SEARCH_API_KEY".to_string(),
            },
            speech: SpeechConfig {
                synthesis_endpoint: "http://127.0.0.1:8000/cognitiveservices/v1".to_string(),
                api_key_env: "SPEECH_API_KEY".to_string(),
                output_format: "audio-16khz-32kbitrate-mono-mp3".to_string(),
                english_voice: "en-US-JennyNeural".to_string(),
                chinese_voice: "zh-CN-XiaoxiaoNeural".to_string(),
                malay_voice: "ms-MY-YasminNeural".to_string(),
                tamil_voice: "ta-IN-PallaviNeural".to_string(),
            },
            transcription: TranscriptionConfig {
                endpoint: "http://127.0.0.1:8000/v1/audio/transcriptions".to_string(),
                api_key_env: "SPEECH_API_KEY".to_string(),
                model: "whisper-1".to_string(),
                sample_rate: 16000,
                partial_interval_ms: 1500,
                max_segment_ms: 15000,
                poll_interval_ms: 100,
                idle_timeout_secs: 30 * 60,
                drain_timeout_secs: 60,
            },
            storage: StorageConfig {
                transcript_path: "data/transcripts.jsonl".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                credential_refresh_secs: 300,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SPEECH__CHINESE_VOICE=zh-CN-YunxiNeural`: Override a voice
    /// - `APP_TRANSCRIPTION__IDLE_TIMEOUT_SECS=600`: Shorter idle timeout
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.generation.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Generation endpoint must be set"));
        }

        if self.speech.synthesis_endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Synthesis endpoint must be set"));
        }

        if self.transcription.sample_rate == 0 {
            return Err(anyhow::anyhow!("Transcription sample rate must be greater than 0"));
        }

        if self.transcription.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Poll interval must be greater than 0"));
        }

        if self.transcription.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.transcription.drain_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Drain timeout must be greater than 0"));
        }

        if self.transcription.partial_interval_ms > self.transcription.max_segment_ms {
            return Err(anyhow::anyhow!(
                "Partial interval ({}ms) cannot exceed max segment length ({}ms)",
                self.transcription.partial_interval_ms,
                self.transcription.max_segment_ms
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed, e.g.
    /// `{"transcription": {"idle_timeout_secs": 600}}`. Endpoints and key
    /// variables are deliberately not updatable at runtime; the service
    /// clients are built once at startup.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(generation) = partial_config.get("generation") {
            if let Some(temperature) = generation.get("temperature").and_then(|v| v.as_f64()) {
                self.generation.temperature = temperature as f32;
            }
            if let Some(max_tokens) = generation.get("max_tokens").and_then(|v| v.as_u64()) {
                self.generation.max_tokens = max_tokens as u32;
            }
        }

        if let Some(speech) = partial_config.get("speech") {
            let voices = [
                ("english_voice", &mut self.speech.english_voice),
                ("chinese_voice", &mut self.speech.chinese_voice),
                ("malay_voice", &mut self.speech.malay_voice),
                ("tamil_voice", &mut self.speech.tamil_voice),
            ];
            for (key, voice) in voices {
                if let Some(name) = speech.get(key).and_then(|v| v.as_str()) {
                    *voice = name.to_string();
                }
            }
        }

        if let Some(transcription) = partial_config.get("transcription") {
            if let Some(ms) = transcription.get("poll_interval_ms").and_then(|v| v.as_u64()) {
                self.transcription.poll_interval_ms = ms;
            }
            if let Some(secs) = transcription.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.transcription.idle_timeout_secs = secs;
            }
            if let Some(secs) = transcription.get("drain_timeout_secs").and_then(|v| v.as_u64()) {
                self.transcription.drain_timeout_secs = secs;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl TranscriptionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transcription.idle_timeout(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transcription.partial_interval_ms = config.transcription.max_segment_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_drain_timeout_is_rejected() {
        let mut config = AppConfig::default();
        config.transcription.drain_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        let json = r#"{"transcription": {"drain_timeout_secs": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"transcription": {"idle_timeout_secs": 600}, "speech": {"chinese_voice": "zh-CN-YunxiNeural"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.transcription.idle_timeout_secs, 600);
        assert_eq!(config.speech.chinese_voice, "zh-CN-YunxiNeural");
        assert_eq!(config.speech.english_voice, "en-US-JennyNeural");

        let json = r#"{"speech": {"tamil_voice": "ta-IN-ValluvarNeural"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.speech.tamil_voice, "ta-IN-ValluvarNeural");
        assert_eq!(config.speech.malay_voice, "ms-MY-YasminNeural");
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
