//! Twilio call control.
//!
//! Outbound calls go through the Calls REST resource with basic auth; call
//! progress arrives as form-encoded webhooks, and media streaming starts
//! via a TwiML `<Connect><Stream>` directive served from the webhook
//! response. Connect streams are bidirectional and carry the caller's
//! inbound track; inbound frames are additionally filtered by track name
//! when they arrive on the socket.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{CarrierEvent, CarrierPort, MediaConnectDirective, WebhookEvent};
use crate::config::TwilioConfig;
use crate::errors::CarrierError;

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

pub struct TwilioCarrier {
    config: TwilioConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
}

impl TwilioCarrier {
    pub fn new(config: TwilioConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn calls_url(&self) -> String {
        format!("{API_BASE}/Accounts/{}/Calls.json", self.config.account_sid)
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{API_BASE}/Accounts/{}/Calls/{call_sid}.json",
            self.config.account_sid
        )
    }
}

#[async_trait]
impl CarrierPort for TwilioCarrier {
    async fn place_outbound(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
    ) -> Result<String, CarrierError> {
        let response = self
            .http
            .post(self.calls_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", to),
                ("From", from),
                ("Url", webhook_url),
                ("Method", "POST"),
                ("StatusCallback", webhook_url),
                ("StatusCallbackMethod", "POST"),
            ])
            .send()
            .await
            .map_err(|e| CarrierError::PlaceFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CarrierError::PlaceFailed(format!("{status}: {body}")));
        }

        let call: CallResource = response
            .json()
            .await
            .map_err(|e| CarrierError::PlaceFailed(e.to_string()))?;
        debug!(call_sid = %call.sid, "outbound call placed");
        Ok(call.sid)
    }

    async fn start_media_stream(&self, _call_ref: &str, _ws_url: &str) -> Result<(), CarrierError> {
        // Streaming starts via the connect directive.
        Ok(())
    }

    async fn hangup(&self, call_ref: &str) -> Result<(), CarrierError> {
        let response = self
            .http
            .post(self.call_url(call_ref))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|e| CarrierError::HangupFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CarrierError::HangupFailed(format!("{status}: {body}")));
        }
        Ok(())
    }

    fn media_connect_directive(&self, ws_url: &str) -> MediaConnectDirective {
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
  <Connect>
    <Stream url="{}" />
  </Connect>
  <Pause length="3600"/>
</Response>"#,
            xml_escape(ws_url)
        );
        MediaConnectDirective {
            content_type: "text/xml",
            body,
        }
    }
}

/// Parse a form-encoded webhook into a lifecycle event.
///
/// Returns `Ok(None)` for statuses the bridge does not act on.
pub fn parse_webhook(fields: &[(String, String)]) -> Result<Option<WebhookEvent>, CarrierError> {
    let get = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let call_ref = get("CallSid")
        .ok_or_else(|| CarrierError::ParseFailed("webhook is missing CallSid".into()))?
        .to_string();
    let status = get("CallStatus")
        .ok_or_else(|| CarrierError::ParseFailed("webhook is missing CallStatus".into()))?;

    let event = match status {
        "queued" | "initiated" => CarrierEvent::Placed,
        "ringing" => CarrierEvent::Ringing,
        "in-progress" => CarrierEvent::Answered,
        "completed" | "busy" | "no-answer" | "failed" | "canceled" => CarrierEvent::HungUp,
        other => {
            debug!(status = other, "ignoring unrecognized call status");
            return Ok(None);
        }
    };

    Ok(Some(WebhookEvent { call_ref, event }))
}

/// Whether serving the connect directive is the right response to this
/// status. Twilio fetches TwiML on `ringing` and `in-progress`.
pub fn wants_connect_directive(event: &CarrierEvent) -> bool {
    matches!(event, CarrierEvent::Ringing | CarrierEvent::Answered)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_ringing() {
        let event = parse_webhook(&fields(&[
            ("CallSid", "CA1"),
            ("CallStatus", "ringing"),
            ("From", "+15550001111"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(event.call_ref, "CA1");
        assert_eq!(event.event, CarrierEvent::Ringing);
        assert!(wants_connect_directive(&event.event));
    }

    #[test]
    fn terminal_statuses_map_to_hangup() {
        for status in ["completed", "busy", "no-answer", "failed"] {
            let event = parse_webhook(&fields(&[("CallSid", "CA1"), ("CallStatus", status)]))
                .unwrap()
                .unwrap();
            assert_eq!(event.event, CarrierEvent::HungUp, "status {status}");
            assert!(!wants_connect_directive(&event.event));
        }
    }

    #[test]
    fn unknown_status_is_ignored() {
        let parsed =
            parse_webhook(&fields(&[("CallSid", "CA1"), ("CallStatus", "on-hold")])).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn missing_call_sid_is_a_parse_error() {
        let err = parse_webhook(&fields(&[("CallStatus", "ringing")])).unwrap_err();
        assert!(matches!(err, CarrierError::ParseFailed(_)));
    }

    #[test]
    fn connect_directive_carries_stream_url() {
        let carrier = TwilioCarrier::new(
            TwilioConfig {
                account_sid: "AC1".into(),
                auth_token: "t".into(),
            },
            reqwest::Client::new(),
        );
        let directive =
            carrier.media_connect_directive("wss://bridge.example/media-stream?token=abc");
        assert_eq!(directive.content_type, "text/xml");
        assert!(directive.body.contains("<Connect>"));
        assert!(
            directive
                .body
                .contains(r#"<Stream url="wss://bridge.example/media-stream?token=abc" />"#)
        );
    }
}
