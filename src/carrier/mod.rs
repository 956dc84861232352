//! Telephony carrier abstraction.
//!
//! A [`CarrierPort`] places the outbound leg, tears it down, and produces
//! the directive that tells the carrier to open its media WebSocket toward
//! us. Webhook payloads are parsed by the carrier-specific modules into a
//! uniform `(call_ref, event)` shape; unknown events are logged and
//! ignored by the caller.

use async_trait::async_trait;

use crate::errors::CarrierError;

pub mod telnyx;
pub mod twilio;

pub use telnyx::TelnyxCarrier;
pub use twilio::TwilioCarrier;

/// Call lifecycle events the bridge reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierEvent {
    /// Outbound leg accepted by the carrier.
    Placed,
    /// The user's phone is ringing.
    Ringing,
    /// The user answered.
    Answered,
    /// The call ended, whatever the reason.
    HungUp,
    /// The carrier acknowledged media streaming.
    StreamReady,
    StreamStopped,
    /// Answering-machine detection verdict (Telnyx only).
    MachineDetection { result: String },
}

/// One parsed webhook, correlated to a carrier call reference.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub call_ref: String,
    pub event: CarrierEvent,
}

/// Response body that instructs the carrier to open the media stream.
#[derive(Debug, Clone)]
pub struct MediaConnectDirective {
    pub content_type: &'static str,
    pub body: String,
}

#[async_trait]
pub trait CarrierPort: Send + Sync {
    /// Originate a call. Subsequent events for this call are posted to
    /// `webhook_url`. Returns the carrier-side call reference.
    async fn place_outbound(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> Result<String, CarrierError>;

    /// Ask the carrier to open its media WebSocket toward `ws_url`.
    ///
    /// Twilio starts streaming through the connect directive instead, so
    /// its implementation is a no-op.
    async fn start_media_stream(&self, call_ref: &str, ws_url: &str) -> Result<(), CarrierError>;

    async fn hangup(&self, call_ref: &str) -> Result<(), CarrierError>;

    /// Webhook response body that opens the media stream at `ws_url`.
    fn media_connect_directive(&self, ws_url: &str) -> MediaConnectDirective;
}
