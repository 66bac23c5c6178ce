use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{chat, status};

/// Local development front ends plus the API's own origin.
fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [3000, 3001, 3002, api_port]
        .iter()
        .flat_map(|port| {
            [
                format!("http://127.0.0.1:{}", port),
                format!("http://localhost:{}", port),
            ]
        })
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState, api_port: u16) -> Router {
    Router::new()
        .route("/api/chat", post(chat::chat_endpoint))
        .route("/api/chat/stream", post(chat::chat_stream_endpoint))
        .route("/api/health", get(status::health_endpoint))
        .route("/api/status", get(status::status_endpoint))
        .layer(build_localhost_cors(api_port))
        .with_state(state)
}
