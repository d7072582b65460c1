//! # Knowledge Voice Backend - Main Application Entry Point
//!
//! Streaming front end for a knowledge-base assistant. It answers questions
//! as a stream of text or synthesized speech, and transcribes microphone
//! audio in real time.
//!
//! ## Application Architecture:
//! - **config**: Configuration layering (defaults, `config.toml`, `APP_*` env)
//! - **credentials**: API keys read from the environment, refreshed periodically
//! - **chat**: Generation events → ordered response frames (`EventMultiplexer`)
//! - **speech**: Synthesis, continuous recognition, transcription sessions
//! - **websocket**: `/ws/transcribe` actor driving a transcription session
//! - **handlers**: HTTP handlers for chat and runtime config
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and endpoint metrics
//! - **state**: Shared config, metrics and service bundle
//! - **error**: HTTP error type and JSON error bodies
//!
//! ## Routes:
//! - `POST /api/v1/chat`: NDJSON answer stream
//! - `GET  /ws/transcribe?language=en|zh`: transcription WebSocket
//! - `GET  /health`, `GET /api/v1/health`, `GET /api/v1/metrics`
//! - `GET|PUT /api/v1/config`

mod chat;
mod config;
mod credentials;
mod error;
mod handlers;
mod health;
mod locale;
mod middleware;
mod speech;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::chat::generator::OpenAiGenerator;
use crate::chat::transcript::JsonlTranscriptStore;
use crate::config::AppConfig;
use crate::credentials::ServiceCredential;
use crate::speech::segmenting::{HttpSegmentTranscriber, SegmentSettings, SegmentingRecognizerFactory};
use crate::speech::synthesis::HttpSpeechSynthesizer;
use crate::state::{AppState, Services};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let services = build_services(&config)?;
    let app_state = AppState::new(config.clone(), services);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let json_config = web::JsonConfig::default().error_handler(|err, _req| {
            error::AppError::BadRequest(err.to_string()).into()
        });

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(json_config)
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/chat", web::post().to(handlers::chat)),
            )
            .route("/ws/transcribe", web::get().to(websocket::transcribe_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Logging defaults to `knowledge_voice_backend=debug,actix_web=info`;
/// override with `RUST_LOG`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "knowledge_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Build the hosted collaborators once. Keys are read lazily, so a missing
/// key shows up as a rejected call rather than a startup failure.
fn build_services(config: &AppConfig) -> Result<Services> {
    let refresh = Duration::from_secs(config.performance.credential_refresh_secs);
    let credential = |env_var: &str| ServiceCredential::from_env(env_var, refresh);

    let generator = OpenAiGenerator::new(
        config.generation.clone(),
        credential(&config.generation.api_key_env),
        credential(&config.generation.search_key_env),
    );
    let synthesizer = HttpSpeechSynthesizer::new(&config.speech, credential(&config.speech.api_key_env));
    let transcriber = HttpSegmentTranscriber::new(
        &config.transcription,
        credential(&config.transcription.api_key_env),
    )?;
    let recognizers = SegmentingRecognizerFactory::new(
        Arc::new(transcriber),
        SegmentSettings::from_config(&config.transcription),
    );
    let transcripts = JsonlTranscriptStore::new(&config.storage.transcript_path);

    for (service, env_var) in [
        ("generation", &config.generation.api_key_env),
        ("speech", &config.speech.api_key_env),
        ("transcription", &config.transcription.api_key_env),
    ] {
        if std::env::var(env_var).is_err() {
            warn!(service, env_var = %env_var, "API key variable is not set");
        }
    }

    Ok(Services {
        generator: Arc::new(generator),
        synthesizer: Arc::new(synthesizer),
        recognizers: Arc::new(recognizers),
        transcripts: Arc::new(transcripts),
    })
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = wait_for_ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

/// Never resolves if the Ctrl+C handler cannot be installed.
async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
