//! # Transcription WebSocket
//!
//! Real-time speech-to-text over `GET /ws/transcribe?language=en|zh|ms|ta`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: capacity is checked before the upgrade (503 when full)
//! 2. **Audio**: binary frames carry 16-bit mono PCM at the configured sample
//!    rate; the first frame starts a transcription session
//! 3. **Results**: the server sends one text frame per result,
//!    `{"text": "...", "is_final": bool}` or `{"error": "..."}`
//! 4. **End**: the text message `completed` ends the audio; the server sends
//!    every remaining result, then closes with 1000. `stop` aborts at once.
//! 5. **Recognizer failure**: a canceled recognition is reported as an error
//!    frame after the results queued before it; that session then closes
//!    while the connection stays open, and the next audio frame starts a
//!    fresh session.
//!
//! ## Close codes:
//! - **1000**: normal completion (also after `stop`)
//! - **4000**: no client activity for `idle_timeout_secs`
//! - **1011**: the recognizer could not be started, or results could not be
//!   delivered within the drain timeout
//!
//! ## Actor model:
//! One actor per connection owns the receive side. The session's send loop
//! runs as a separate task and hands each result back to the actor as a
//! [`DeliverFrame`] message, so the two directions never block each other.

use crate::error::AppError;
use crate::locale::Language;
use crate::speech::queue::TranscriptionFrame;
use crate::speech::send_loop::{FrameSink, NetworkSendLoop, SinkError};
use crate::speech::session::{SessionError, SessionState, TranscriptionSession};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
pub const IDLE_TIMEOUT_CLOSE_CODE: u16 = 4000;

/// Literal text messages understood from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Completed,
    Stop,
}

impl ClientCommand {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "completed" => Some(ClientCommand::Completed),
            "stop" => Some(ClientCommand::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TranscribeQuery {
    #[serde(default)]
    pub language: Language,
}

/// One serialized result for the client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct DeliverFrame(pub String);

/// [`FrameSink`] that writes through the connection's actor.
pub struct ActorSink {
    addr: Addr<TranscriptionSocket>,
}

#[async_trait]
impl FrameSink for ActorSink {
    async fn send(&mut self, frame: &TranscriptionFrame) -> Result<(), SinkError> {
        let json = serde_json::to_string(frame).map_err(|e| SinkError::Send(e.to_string()))?;
        self.addr.send(DeliverFrame(json)).await.map_err(|_| SinkError::Closed)
    }
}

pub struct TranscriptionSocket {
    state: web::Data<AppState>,
    language: Language,
    session: Option<Arc<TranscriptionSession>>,
    idle_timeout: Duration,
    drain_timeout: Duration,
    poll_interval: Duration,
    last_activity: Instant,
    last_heartbeat: Instant,
    finishing: bool,
}

impl TranscriptionSocket {
    pub fn new(state: web::Data<AppState>, language: Language) -> Self {
        let config = state.get_config().transcription;
        Self {
            state,
            language,
            session: None,
            idle_timeout: config.idle_timeout(),
            drain_timeout: config.drain_timeout(),
            poll_interval: config.poll_interval(),
            last_activity: Instant::now(),
            last_heartbeat: Instant::now(),
            finishing: false,
        }
    }

    /// Fresh session plus its send loop task.
    fn open_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) -> Arc<TranscriptionSession> {
        let (session, consumer) = TranscriptionSession::new(
            self.language,
            self.state.services.recognizers.clone(),
            self.drain_timeout,
        );
        let session = Arc::new(session);
        let send_loop = NetworkSendLoop::new(consumer, session.clone(), self.poll_interval);
        let sink = ActorSink { addr: ctx.address() };
        let session_id = session.id().to_string();

        tokio::spawn(async move {
            let outcome = send_loop.run(sink).await;
            debug!(session_id = %session_id, outcome = ?outcome, "Send loop exited");
        });

        self.session = Some(session.clone());
        session
    }

    fn handle_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        if self.finishing {
            warn!(bytes = data.len(), "Audio received after completed, ignoring");
            return;
        }

        let session = match &self.session {
            Some(session) if !session.is_closed() => session.clone(),
            _ => self.open_session(ctx),
        };

        if session.state() == SessionState::Idle {
            if let Err(err) = session.start() {
                error!(session_id = %session.id(), error = %err, "Failed to start recognition");
                self.send_frame(&TranscriptionFrame::error(err.to_string()), ctx);
                self.close(ctx, ws::CloseCode::Error, "recognizer unavailable");
                return;
            }
        }

        if let Err(err) = session.feed(data) {
            if session.recognizer_ended() {
                // The cancellation already reached the client as an error frame.
                debug!(session_id = %session.id(), error = %err, "Recognizer ended, dropping audio");
                return;
            }
            warn!(session_id = %session.id(), error = %err, "Audio frame rejected");
            self.send_frame(&TranscriptionFrame::error(err.to_string()), ctx);
        }
    }

    fn handle_completed(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.finishing {
            return;
        }
        self.finishing = true;

        let Some(session) = self.session.clone() else {
            self.close(ctx, ws::CloseCode::Normal, "completed");
            return;
        };

        info!(session_id = %session.id(), "Client completed audio, draining results");
        let drain = async move { session.finish().await };
        ctx.spawn(drain.into_actor(self).map(|result, act, ctx| match result {
            Ok(()) => act.close(ctx, ws::CloseCode::Normal, "completed"),
            Err(SessionError::DrainTimeout) => act.close(ctx, ws::CloseCode::Error, "drain timeout"),
            Err(err) => {
                debug!(error = %err, "Session ended before draining");
                act.close(ctx, ws::CloseCode::Normal, "completed");
            }
        }));
    }

    fn abort_session(&mut self) {
        if let Some(session) = &self.session {
            session.abort();
        }
    }

    fn send_frame(&self, frame: &TranscriptionFrame, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(frame) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize transcription frame"),
        }
    }

    fn close(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: ws::CloseCode, description: &str) {
        ctx.close(Some(ws::CloseReason {
            code,
            description: Some(description.to_string()),
        }));
        ctx.stop();
    }
}

impl Actor for TranscriptionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(language = %self.language, "Transcription socket connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if act.last_heartbeat.elapsed() > CLIENT_TIMEOUT {
                warn!("Transcription socket heartbeat timeout, closing connection");
                act.abort_session();
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        let idle_check = self.idle_timeout.min(HEARTBEAT_INTERVAL);
        ctx.run_interval(idle_check, |act, ctx| {
            if act.last_activity.elapsed() >= act.idle_timeout {
                warn!(
                    idle_secs = act.last_activity.elapsed().as_secs(),
                    "Transcription socket idle, closing connection"
                );
                act.abort_session();
                act.close(ctx, ws::CloseCode::Other(IDLE_TIMEOUT_CLOSE_CODE), "idle timeout");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.abort_session();
        self.state.release_session();
        info!(language = %self.language, "Transcription socket disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranscriptionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_activity = Instant::now();
                self.handle_audio(&data, ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_activity = Instant::now();
                match ClientCommand::parse(&text) {
                    Some(ClientCommand::Completed) => self.handle_completed(ctx),
                    Some(ClientCommand::Stop) => {
                        info!("Client stopped transcription");
                        self.abort_session();
                        self.close(ctx, ws::CloseCode::Normal, "stopped");
                    }
                    None => {
                        warn!(message = %text, "Unsupported text message");
                        self.send_frame(&TranscriptionFrame::error(format!("unsupported message: {}", text)), ctx);
                    }
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "Client closed transcription socket");
                self.abort_session();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                self.abort_session();
                ctx.stop();
            }
        }
    }
}

impl Handler<DeliverFrame> for TranscriptionSocket {
    type Result = ();

    fn handle(&mut self, msg: DeliverFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// WebSocket endpoint handler.
///
/// The slot reserved here is released in [`TranscriptionSocket::stopped`], or
/// right away if the upgrade fails.
pub async fn transcribe_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<TranscribeQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    if !state.try_acquire_session() {
        warn!("Rejecting transcription socket, session limit reached");
        return Err(AppError::Unavailable("too many active transcription sessions".to_string()).into());
    }

    info!(
        peer = ?req.connection_info().peer_addr(),
        language = %query.language,
        "New transcription socket"
    );

    let socket = TranscriptionSocket::new(state.clone(), query.language);
    let response = ws::start(socket, &req, stream);
    if response.is_err() {
        state.release_session();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing;
    use actix_web::{http::StatusCode, test as actix_test, App};

    #[test]
    fn test_client_commands() {
        assert_eq!(ClientCommand::parse("completed"), Some(ClientCommand::Completed));
        assert_eq!(ClientCommand::parse(" stop\n"), Some(ClientCommand::Stop));
        assert_eq!(ClientCommand::parse("{\"type\":\"start\"}"), None);
    }

    #[test]
    fn test_query_language() {
        let query: TranscribeQuery = parse_query("language=zh");
        assert_eq!(query.language, Language::Chinese);
        let query: TranscribeQuery = parse_query("");
        assert_eq!(query.language, Language::English);
    }

    fn parse_query(query: &str) -> TranscribeQuery {
        web::Query::<TranscribeQuery>::from_query(query).unwrap().into_inner()
    }

    #[actix_web::test]
    async fn test_rejects_when_at_capacity() {
        let mut config = crate::config::AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = AppState::new(config, testing::services(Vec::new()));
        assert!(state.try_acquire_session());

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/transcribe", web::get().to(transcribe_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws/transcribe?language=en").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
    }

    #[actix_web::test]
    async fn test_failed_upgrade_releases_slot() {
        let state = testing::state(Vec::new());
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/transcribe", web::get().to(transcribe_websocket)),
        )
        .await;

        // No upgrade headers, so the handshake fails after the slot was taken.
        let req = actix_test::TestRequest::get().uri("/ws/transcribe").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }
}
