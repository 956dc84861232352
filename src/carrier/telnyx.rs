//! Telnyx call control.
//!
//! Calls are placed and controlled over the v2 Call Control REST API with
//! bearer auth. Unlike Twilio, media streaming is started explicitly with
//! a `streaming_start` action once the call is answered; webhooks arrive
//! as JSON envelopes under `data.event_type`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{CarrierEvent, CarrierPort, MediaConnectDirective, WebhookEvent};
use crate::config::TelnyxConfig;
use crate::errors::CarrierError;

const API_BASE: &str = "https://api.telnyx.com/v2";

pub struct TelnyxCarrier {
    config: TelnyxConfig,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CallRequest<'a> {
    connection_id: &'a str,
    to: &'a str,
    from: &'a str,
    webhook_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    data: CallData,
}

#[derive(Debug, Deserialize)]
struct CallData {
    call_control_id: String,
}

/// Webhook envelope: `{data: {event_type, payload: {...}}}`.
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub event_type: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub call_control_id: Option<String>,
    pub result: Option<String>,
}

impl TelnyxCarrier {
    pub fn new(config: TelnyxConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    async fn call_action(
        &self,
        call_ref: &str,
        action: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.http
            .post(format!("{API_BASE}/calls/{call_ref}/actions/{action}"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
    }
}

#[async_trait]
impl CarrierPort for TelnyxCarrier {
    async fn place_outbound(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> Result<String, CarrierError> {
        let request = CallRequest {
            connection_id: &self.config.connection_id,
            to,
            from,
            webhook_url,
        };

        let response = self
            .http
            .post(format!("{API_BASE}/calls"))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| CarrierError::PlaceFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CarrierError::PlaceFailed(format!("{status}: {body}")));
        }

        let call: CallResponse = response
            .json()
            .await
            .map_err(|e| CarrierError::PlaceFailed(e.to_string()))?;
        debug!(call_control_id = %call.data.call_control_id, "outbound call placed");
        Ok(call.data.call_control_id)
    }

    async fn start_media_stream(&self, call_ref: &str, ws_url: &str) -> Result<(), CarrierError> {
        let body = json!({
            "stream_url": ws_url,
            "stream_track": "inbound_track",
        });
        let response = self
            .call_action(call_ref, "streaming_start", body)
            .await
            .map_err(|e| CarrierError::PlaceFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CarrierError::PlaceFailed(format!(
                "streaming_start {status}: {text}"
            )));
        }
        Ok(())
    }

    async fn hangup(&self, call_ref: &str) -> Result<(), CarrierError> {
        let response = self
            .call_action(call_ref, "hangup", json!({}))
            .await
            .map_err(|e| CarrierError::HangupFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CarrierError::HangupFailed(format!("{status}: {text}")));
        }
        Ok(())
    }

    fn media_connect_directive(&self, _ws_url: &str) -> MediaConnectDirective {
        // Telnyx webhooks are acknowledged immediately; streaming is
        // started with an explicit action instead of a response body.
        MediaConnectDirective {
            content_type: "application/json",
            body: r#"{"status":"ok"}"#.to_string(),
        }
    }
}

/// Parse a JSON webhook body into a lifecycle event.
///
/// Returns `Ok(None)` for event types the bridge does not act on.
pub fn parse_webhook(body: &[u8]) -> Result<Option<WebhookEvent>, CarrierError> {
    let envelope: WebhookEnvelope =
        serde_json::from_slice(body).map_err(|e| CarrierError::ParseFailed(e.to_string()))?;

    let call_ref = match envelope.data.payload.call_control_id {
        Some(id) => id,
        None => {
            debug!(
                event_type = %envelope.data.event_type,
                "webhook has no call_control_id, ignoring"
            );
            return Ok(None);
        }
    };

    let event = match envelope.data.event_type.as_str() {
        "call.initiated" => CarrierEvent::Ringing,
        "call.answered" => CarrierEvent::Answered,
        "call.hangup" => CarrierEvent::HungUp,
        "streaming.started" => CarrierEvent::StreamReady,
        "streaming.stopped" => CarrierEvent::StreamStopped,
        "call.machine.detection.ended" | "machine.detection.ended" => {
            CarrierEvent::MachineDetection {
                result: envelope.data.payload.result.unwrap_or_default(),
            }
        }
        other => {
            debug!(event_type = other, "ignoring unrecognized webhook event");
            return Ok(None);
        }
    };

    Ok(Some(WebhookEvent { call_ref, event }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lifecycle_events() {
        let cases = [
            ("call.initiated", CarrierEvent::Ringing),
            ("call.answered", CarrierEvent::Answered),
            ("call.hangup", CarrierEvent::HungUp),
            ("streaming.started", CarrierEvent::StreamReady),
            ("streaming.stopped", CarrierEvent::StreamStopped),
        ];
        for (event_type, expected) in cases {
            let body = format!(
                r#"{{"data":{{"event_type":"{event_type}","payload":{{"call_control_id":"cc-1"}}}}}}"#
            );
            let event = parse_webhook(body.as_bytes()).unwrap().unwrap();
            assert_eq!(event.call_ref, "cc-1");
            assert_eq!(event.event, expected, "for {event_type}");
        }
    }

    #[test]
    fn machine_detection_carries_result() {
        let body = r#"{"data":{"event_type":"call.machine.detection.ended",
            "payload":{"call_control_id":"cc-1","result":"machine"}}}"#;
        let event = parse_webhook(body.as_bytes()).unwrap().unwrap();
        assert_eq!(
            event.event,
            CarrierEvent::MachineDetection {
                result: "machine".into()
            }
        );
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let body = r#"{"data":{"event_type":"call.bridged","payload":{"call_control_id":"cc-1"}}}"#;
        assert!(parse_webhook(body.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        assert!(matches!(
            parse_webhook(b"not json").unwrap_err(),
            CarrierError::ParseFailed(_)
        ));
    }

    #[test]
    fn ack_body_is_static_json() {
        let carrier = TelnyxCarrier::new(
            TelnyxConfig {
                api_key: "k".into(),
                connection_id: "c".into(),
                public_key: None,
            },
            reqwest::Client::new(),
        );
        let directive = carrier.media_connect_directive("wss://ignored");
        assert_eq!(directive.content_type, "application/json");
        assert_eq!(directive.body, r#"{"status":"ok"}"#);
    }
}
