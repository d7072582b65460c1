//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: `Arc<RwLock<AppConfig>>`, readable by every request and
//!   replaceable through `PUT /api/v1/config`
//! - **metrics**: server-wide counters (requests, errors, live transcription
//!   sessions, streamed answers, per-endpoint timings)
//! - **services**: the hosted collaborators (generation, synthesis,
//!   recognition, transcript storage), built once at startup
//!
//! ## Arc<RwLock<T>> Pattern
//! Many workers read config and metrics at once; writes are short and rare.
//! A poisoned lock still holds consistent data (every write is a single field
//! update), so the guards recover it instead of panicking.
//!
//! Metrics are telemetry only. No session reads another session's state
//! through here.

use crate::chat::generator::Generator;
use crate::chat::transcript::TranscriptStore;
use crate::config::AppConfig;
use crate::speech::recognizer::RecognizerFactory;
use crate::speech::synthesis::SpeechSynthesizer;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The hosted collaborators every request goes through.
///
/// Each one sits behind a trait object so the tests (and a different
/// deployment) can swap them without touching the handlers.
#[derive(Clone)]
pub struct Services {
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub recognizers: Arc<dyn RecognizerFactory>,
    pub transcripts: Arc<dyn TranscriptStore>,
}

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the middleware, the chat handler and the
    /// transcription socket
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub services: Services,

    /// When the server started
    pub start_time: Instant,
}

/// Server-wide counters.
///
/// ## Why these metrics matter:
/// - **request_count** / **error_count**: load and reliability
/// - **active_sessions**: live transcription sockets, capped by
///   `performance.max_concurrent_sessions`
/// - **chat_streams**: answers streamed since start
/// - **endpoint_metrics**: per-route timings
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: u32,
    pub chat_streams: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, services: Services) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            services,
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so a long-lived session never
    /// blocks a config update.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn increment_chat_streams(&self) {
        self.metrics_mut().chat_streams += 1;
    }

    /// Record timing for one request.
    ///
    /// ## Parameters:
    /// - **endpoint**: method and path, e.g. `"POST /api/v1/chat"`
    /// - **duration_ms**: time until the response head was produced; for the
    ///   streaming chat route this excludes the body
    /// - **is_error**: 4xx/5xx status
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a transcription slot. Returns false when the server is at
    /// `max_concurrent_sessions`.
    ///
    /// Check and increment happen under one write lock so two sockets racing
    /// for the last slot cannot both get it.
    pub fn try_acquire_session(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.metrics_mut();
        if (metrics.active_sessions as usize) < limit {
            metrics.active_sessions += 1;
            true
        } else {
            false
        }
    }

    /// Release a slot taken by [`try_acquire_session`](Self::try_acquire_session).
    pub fn release_session(&self) {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Consistent copy for the `/metrics` endpoint, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics_ref();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            chat_streams: metrics.chat_streams,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// In-process collaborators for handler and socket tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::chat::events::{GenerationError, GenerationEvent};
    use crate::chat::generator::EventStream;
    use crate::chat::transcript::TranscriptRecord;
    use crate::chat::ChatRequest;
    use crate::locale::Language;
    use crate::speech::recognizer::testing::ScriptedFactory;
    use crate::speech::synthesis::SynthesisError;
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use std::sync::Mutex;

    /// Replays the same events for every request.
    pub struct ScriptedGenerator {
        pub events: Vec<GenerationEvent>,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _request: &ChatRequest) -> Result<EventStream, GenerationError> {
            Ok(stream::iter(self.events.clone().into_iter().map(Ok)).boxed())
        }
    }

    pub struct EchoSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for EchoSynthesizer {
        async fn synthesize(&self, text: &str, _language: Language) -> Result<Vec<u8>, SynthesisError> {
            Ok(text.as_bytes().to_vec())
        }
    }

    #[derive(Default)]
    pub struct MemoryTranscripts {
        pub records: Mutex<Vec<TranscriptRecord>>,
    }

    #[async_trait]
    impl TranscriptStore for MemoryTranscripts {
        async fn save(&self, record: &TranscriptRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    pub fn services(events: Vec<GenerationEvent>) -> Services {
        Services {
            generator: Arc::new(ScriptedGenerator { events }),
            synthesizer: Arc::new(EchoSynthesizer),
            recognizers: Arc::new(ScriptedFactory::default()),
            transcripts: Arc::new(MemoryTranscripts::default()),
        }
    }

    pub fn state(events: Vec<GenerationEvent>) -> AppState {
        AppState::new(AppConfig::default(), services(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_slots_are_capped() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 2;
        let state = AppState::new(config, testing::services(Vec::new()));

        assert!(state.try_acquire_session());
        assert!(state.try_acquire_session());
        assert!(!state.try_acquire_session());

        state.release_session();
        assert!(state.try_acquire_session());
        state.release_session();
        state.release_session();
        state.release_session();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = testing::state(Vec::new());
        state.record_endpoint_request("POST /api/v1/chat", 30, false);
        state.record_endpoint_request("POST /api/v1/chat", 10, true);

        let snapshot = state.get_metrics_snapshot();
        let chat = &snapshot.endpoint_metrics["POST /api/v1/chat"];
        assert_eq!(chat.average_duration_ms(), 20.0);
        assert_eq!(chat.error_rate(), 0.5);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let state = testing::state(Vec::new());
        let mut config = state.get_config();
        config.transcription.poll_interval_ms = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().transcription.poll_interval_ms, 100);
    }
}
