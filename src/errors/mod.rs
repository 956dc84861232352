//! Error types shared across the bridge.
//!
//! Each component has its own error enum; `BridgeError` is the umbrella type
//! that crosses component boundaries and is rendered into short textual
//! messages for the Driver. Stack traces never cross the RPC boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Startup-only configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more required options are absent. The message enumerates them.
    #[error("missing required configuration: {0}")]
    Missing(String),

    #[error("invalid value for {name}: {detail}")]
    Invalid { name: String, detail: String },
}

/// Failures talking to the telephony carrier.
#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("failed to place outbound call: {0}")]
    PlaceFailed(String),

    #[error("failed to hang up call: {0}")]
    HangupFailed(String),

    #[error("failed to parse carrier event: {0}")]
    ParseFailed(String),
}

/// Webhook / WebSocket authentication failures.
///
/// Terminal for the request that carried them (401), never for the session.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("signature verification failed")]
    BadSignature,

    #[error("invalid or unknown stream token")]
    BadToken,

    #[error("webhook timestamp outside the accepted window")]
    StaleTimestamp,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        tracing::warn!("rejecting request: {self}");
        (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
    }
}

/// Media-socket failures.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media stream is not ready")]
    NotReady,

    #[error("media socket closed")]
    SocketClosed,
}

/// Speech-agent (unified mode) and split-pipeline failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to speech model: {0}")]
    ConnectFailed(String),

    #[error("speech stream error: {0}")]
    StreamError(String),

    #[error("speech protocol error: {0}")]
    ProtocolError(String),
}

/// A bounded wait expired.
#[derive(Debug, Error)]
#[error("timed out waiting for {what}")]
pub struct TimeoutError {
    pub what: &'static str,
}

impl TimeoutError {
    pub fn new(what: &'static str) -> Self {
        Self { what }
    }
}

/// The remote party (or the carrier) ended the call while we were waiting.
#[derive(Debug, Error)]
#[error("call was hung up")]
pub struct HangupError;

/// A tool executor failed or exceeded its deadline.
#[derive(Debug, Error)]
#[error("tool '{name}' failed: {cause}")]
pub struct ToolError {
    pub name: String,
    pub cause: String,
}

/// Umbrella error for operations that cross component boundaries.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Carrier(#[from] CarrierError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Hangup(#[from] HangupError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("no active call with id {0}")]
    SessionNotFound(String),
}

impl BridgeError {
    /// Short, user-facing explanation returned over the Driver RPC.
    pub fn driver_message(&self) -> String {
        match self {
            BridgeError::Hangup(_) => "Call was hung up by user".to_string(),
            BridgeError::Timeout(t) => format!("Timed out waiting for {}", t.what),
            BridgeError::SessionNotFound(id) => format!("No active call with id {id}"),
            BridgeError::Carrier(e) => e.to_string(),
            BridgeError::Agent(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}
