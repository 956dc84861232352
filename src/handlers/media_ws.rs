//! Media-stream WebSocket upgrade.
//!
//! The carrier opens `GET /media-stream?token=<wsToken>` once it starts
//! streaming. The token is minted per call and single-use: a second
//! upgrade against the same token is rejected with 401. Untokenized
//! upgrades are allowed only in tunneled deployments, where they bind to
//! the most recently created session as a best-effort compatibility path.

use std::collections::HashMap;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::auth;
use crate::errors::AuthError;
use crate::state::AppState;

/// `GET /media-stream`
pub async fn media_stream_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let session = match params.get("token") {
        Some(provided) => {
            let Some(session) = state.manager.session_by_token(provided) else {
                warn!("media upgrade with unknown token");
                return AuthError::BadToken.into_response();
            };
            if !auth::verify_ws_token(&session.ws_token, provided) {
                return AuthError::BadToken.into_response();
            }
            session
        }
        None if state.config.trust_without_signature => {
            // Best-effort compatibility path for tunnels that strip query
            // strings: bind to the newest session and say so loudly.
            let Some(session) = state.manager.latest_session() else {
                warn!("untokenized media upgrade with no active calls");
                return AuthError::BadToken.into_response();
            };
            info!(
                call_id = %session.call_id,
                "binding untokenized media upgrade to newest session (tunneled deployment)"
            );
            session
        }
        None => {
            warn!("media upgrade without token");
            return AuthError::BadToken.into_response();
        }
    };

    if !session.try_claim_media() {
        warn!(call_id = %session.call_id, "second media upgrade for this call rejected");
        return AuthError::BadToken.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        session.bind_media_socket(socket);
    })
}
