//! Route table for the carrier-facing HTTP listener.

use axum::Router;
use axum::routing::{get, post};

use crate::handlers::{media_ws, webhooks};
use crate::state::AppState;

/// All routes on the single TCP port: carrier webhooks, SMS, the health
/// probe, and the media-stream WebSocket upgrade.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/twiml", post(webhooks::twiml_webhook))
        .route("/sms", post(webhooks::sms_webhook))
        .route("/health", get(webhooks::health))
        .route("/media-stream", get(media_ws::media_stream_upgrade))
        .with_state(state)
}
