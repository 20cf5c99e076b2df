//! Local HTTP transport for the gateway contract.
//!
//! Inbound actions are accepted and handled in the background; replies are queued in the
//! [`MemoryGateway`] outbox and drained by polling `GET /v1/chats/:chat_id/messages`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use pyhost_core::{Action, ChatId, Controller, GatewayEvent, MemoryGateway, MessageId, OutboundMessage, PrincipalId};
use serde::Deserialize;

/// Largest accepted archive upload.
const MAX_ARCHIVE_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub gateway: Arc<MemoryGateway>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chats/:chat_id/text", post(post_text))
        .route("/v1/chats/:chat_id/choice", post(post_choice))
        .route("/v1/chats/:chat_id/archive", post(post_archive))
        .route("/v1/chats/:chat_id/messages", get(get_messages))
        .layer(DefaultBodyLimit::max(MAX_ARCHIVE_BYTES))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TextBody {
    user_id: PrincipalId,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChoiceBody {
    user_id: PrincipalId,
    message_id: MessageId,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ArchiveQuery {
    user_id: PrincipalId,
    file_name: String,
}

fn dispatch(state: &AppState, event: GatewayEvent) -> StatusCode {
    let controller = Arc::clone(&state.controller);
    tokio::spawn(async move { controller.handle_event(event).await });
    StatusCode::ACCEPTED
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /v1/chats/:chat_id/text – a typed message or slash command.
async fn post_text(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Json(body): Json<TextBody>,
) -> StatusCode {
    dispatch(
        &state,
        GatewayEvent::Text {
            user_id: body.user_id,
            chat_id,
            text: body.text,
        },
    )
}

/// POST /v1/chats/:chat_id/choice – a pressed choice, identified by its token.
async fn post_choice(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Json(body): Json<ChoiceBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match Action::decode(&body.token) {
        Ok(action) => {
            let status = dispatch(
                &state,
                GatewayEvent::Choice {
                    user_id: body.user_id,
                    chat_id,
                    message_id: body.message_id,
                    action,
                },
            );
            (status, Json(serde_json::json!({ "status": "accepted" })))
        }
        Err(e) => {
            tracing::warn!(chat_id, token = %body.token, "rejected choice token");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
            )
        }
    }
}

/// POST /v1/chats/:chat_id/archive?user_id=..&file_name=app.zip – raw archive bytes.
async fn post_archive(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<ArchiveQuery>,
    body: Bytes,
) -> StatusCode {
    let file = state.gateway.stash_document(body.to_vec());
    dispatch(
        &state,
        GatewayEvent::Document {
            user_id: query.user_id,
            chat_id,
            file_name: query.file_name,
            file,
        },
    )
}

/// GET /v1/chats/:chat_id/messages – drain the chat's outbox.
async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
) -> Json<Vec<OutboundMessage>> {
    Json(state.gateway.drain(chat_id))
}
