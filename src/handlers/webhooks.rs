//! Carrier webhook handlers.
//!
//! `POST /twiml` receives call progress from whichever carrier is
//! configured (the path is carrier-historical and kept for compatibility).
//! Signatures are enforced unless the operator marked the deployment as
//! tunneled, in which case every bypass is logged. Twilio gets the media
//! connect directive on ringing/in-progress; Telnyx is always acknowledged
//! immediately with a static body.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::auth;
use crate::carrier::{telnyx, twilio};
use crate::config::CarrierKind;
use crate::errors::AuthError;
use crate::state::AppState;

/// `POST /twiml`
pub async fn twiml_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state.config.carrier {
        CarrierKind::Twilio => handle_twilio(&state, &headers, &body).await,
        CarrierKind::Telnyx => handle_telnyx(&state, &headers, &body).await,
    }
}

/// `POST /sms` — inbound SMS is outside the call core; acknowledge and log.
pub async fn sms_webhook(State(_state): State<AppState>, body: Bytes) -> Response {
    debug!(bytes = body.len(), "inbound SMS webhook acknowledged");
    StatusCode::OK.into_response()
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    axum::Json(json!({
        "status": "ok",
        "activeCalls": state.manager.active_count(),
    }))
    .into_response()
}

async fn handle_twilio(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Response {
    let fields: Vec<(String, String)> = url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if let Err(rejection) = verify_twilio(state, headers, &fields) {
        return rejection.into_response();
    }

    let event = match twilio::parse_webhook(&fields) {
        Ok(Some(event)) => event,
        Ok(None) => return StatusCode::OK.into_response(),
        Err(e) => {
            warn!("unparseable webhook: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    // Serve the connect directive while the session is coming up; once
    // media is claimed, further status callbacks get an empty body.
    let directive = match state.manager.session_by_call_ref(&event.call_ref) {
        Some(session)
            if twilio::wants_connect_directive(&event.event) && session.try_claim_directive() =>
        {
            let ws_url = state.config.media_ws_url(&session.ws_token);
            Some(state.manager.carrier().media_connect_directive(&ws_url))
        }
        _ => None,
    };

    state.manager.route_webhook(event);

    match directive {
        Some(directive) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, directive.content_type)],
            directive.body,
        )
            .into_response(),
        None => StatusCode::OK.into_response(),
    }
}

async fn handle_telnyx(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Response {
    if let Err(rejection) = verify_telnyx(state, headers, body) {
        return rejection.into_response();
    }

    match telnyx::parse_webhook(body) {
        Ok(Some(event)) => {
            // Acknowledge immediately; the event itself is acted on by the
            // session's own tasks.
            state.manager.route_webhook(event);
        }
        Ok(None) => {}
        Err(e) => warn!("unparseable webhook: {e}"),
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"ok"}"#,
    )
        .into_response()
}

fn verify_twilio(
    state: &AppState,
    headers: &HeaderMap,
    fields: &[(String, String)],
) -> Result<(), AuthError> {
    let twilio_config = state.config.twilio.as_ref().expect("twilio configured");
    let signature = headers
        .get("X-Twilio-Signature")
        .and_then(|v| v.to_str().ok());

    match signature {
        Some(signature) => auth::verify_twilio_signature(
            &twilio_config.auth_token,
            signature,
            &state.config.webhook_url(),
            fields,
        ),
        None if state.config.trust_without_signature => {
            info!("accepting unsigned webhook (tunneled deployment)");
            Ok(())
        }
        None => Err(AuthError::BadSignature),
    }
}

fn verify_telnyx(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), AuthError> {
    let telnyx_config = state.config.telnyx.as_ref().expect("telnyx configured");
    let signature = headers
        .get("Telnyx-Signature-Ed25519")
        .and_then(|v| v.to_str().ok());
    let timestamp = headers
        .get("Telnyx-Timestamp")
        .and_then(|v| v.to_str().ok());

    match (signature, timestamp, telnyx_config.public_key.as_deref()) {
        (Some(signature), Some(timestamp), Some(public_key)) => auth::verify_telnyx_signature(
            public_key,
            signature,
            timestamp,
            body,
            auth::unix_now(),
        ),
        _ if state.config.trust_without_signature => {
            info!("accepting unsigned webhook (tunneled deployment)");
            Ok(())
        }
        _ => Err(AuthError::BadSignature),
    }
}
