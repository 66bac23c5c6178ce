use axum::{Json, extract::State};
use chrono::Utc;

use super::super::AppState;
use crate::core::cache::SourceId;

pub async fn health_endpoint() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "deskchat",
    }))
}

pub async fn status_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let jira = state.cache.source(SourceId::Jira).status().await;
    let freshservice = state.cache.source(SourceId::Freshservice).status().await;
    let queue = state.scheduler.queue_status();
    Json(serde_json::json!({
        "jira": jira,
        "freshservice": freshservice,
        "refresh_queue": queue,
        "current_time": Utc::now().to_rfc3339(),
    }))
}
