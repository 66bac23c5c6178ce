use axum::{
    Json,
    extract::State,
    response::IntoResponse,
    response::sse::{Event, Sse},
};
use chrono::Utc;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tracing::info;

use super::super::AppState;
use crate::core::chat::HistoryEntry;

#[derive(serde::Deserialize)]
pub struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

pub async fn chat_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Json<serde_json::Value> {
    info!("Chat request received");
    let response = state.chat.respond(&payload.message, &payload.history).await;
    Json(serde_json::json!({
        "response": response,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn chat_stream_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> axum::response::Response {
    info!("Streaming chat request received");
    let (tx, rx) = tokio::sync::mpsc::channel(32);
    let chat = state.chat.clone();

    // The conversation runs to completion even if the client disconnects;
    // tool side effects (queued refreshes) are not tied to the stream.
    tokio::spawn(async move {
        chat.respond_streaming(&payload.message, &payload.history, tx)
            .await;
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(|event| {
        Ok::<_, Infallible>(
            Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
        )
    });

    Sse::new(stream).into_response()
}
