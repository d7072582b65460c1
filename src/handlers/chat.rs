//! `POST /api/v1/chat`: answer a question as a streamed NDJSON body.
//!
//! Validation failures are the only non-200 responses. Once the generator has
//! been called the response is 200 and every later failure arrives as an
//! `{"type":"error"}` line (see `chat::multiplexer`).

use crate::chat::generator::failed_stream;
use crate::chat::multiplexer::EventMultiplexer;
use crate::chat::{ChatRequest, ChatStreamError};
use crate::error::{AppError, AppResult};
use crate::middleware::RequestId;
use crate::state::AppState;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use tracing::{info, warn};

pub async fn chat(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ChatRequest>,
) -> AppResult<HttpResponse> {
    let request = body.into_inner();
    if request.query.trim().is_empty() {
        return Err(AppError::ValidationError("query must not be empty".to_string()));
    }

    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.to_string())
        .unwrap_or_default();
    info!(
        request_id = %request_id,
        conversation_id = request.conversation_id.as_deref().unwrap_or("new"),
        language = %request.language,
        voice = request.voice,
        history_turns = request.history.len(),
        "Answering question"
    );

    let services = state.services.clone();
    let upstream = match services.generator.generate(&request).await {
        Ok(events) => events,
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "Generation call rejected");
            failed_stream(err)
        }
    };
    state.increment_chat_streams();

    let frames = EventMultiplexer::new(request, services.synthesizer, services.transcripts).run(upstream);
    let body = frames.map(|item| {
        item.and_then(|frame| {
            frame
                .to_ndjson()
                .map(web::Bytes::from)
                .map_err(ChatStreamError::from)
        })
    });

    Ok(HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(body))
}
