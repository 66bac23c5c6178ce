mod handlers;
mod router;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::cache::CacheStore;
use crate::core::chat::ChatService;
use crate::core::refresh::RefreshScheduler;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) chat: Arc<ChatService>,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) scheduler: Arc<RefreshScheduler>,
}

/// Bind the HTTP API and serve until the token is cancelled.
pub async fn serve(
    host: &str,
    port: u16,
    chat: Arc<ChatService>,
    cache: Arc<CacheStore>,
    scheduler: Arc<RefreshScheduler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = AppState {
        chat,
        cache,
        scheduler,
    };
    let app = router::build_api_router(state, port);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("API server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")
}
