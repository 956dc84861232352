//! Webhook signature verification and per-call stream tokens.
//!
//! Two carrier schemes are supported: Twilio signs form-encoded webhooks
//! with HMAC-SHA1 over the URL and the sorted field pairs; Telnyx signs the
//! raw body with Ed25519 over `timestamp|body` and rejects stale
//! timestamps. Media-stream WebSocket upgrades are authenticated with a
//! single-use random token minted per call.
//!
//! Verification may be bypassed when the operator runs behind a tunnel
//! that strips or rewrites signatures; the bypass is never silent — every
//! skipped check is logged by the caller.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{ED25519, UnparsedPublicKey};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::AuthError;

type HmacSha1 = Hmac<Sha1>;

/// Maximum accepted clock skew for timestamped signatures.
const MAX_TIMESTAMP_SKEW_SECS: i64 = 5 * 60;

/// Length of a freshly minted stream token, in raw bytes.
const WS_TOKEN_BYTES: usize = 32;

/// Verify a Twilio webhook signature.
///
/// The signed message is the full webhook URL followed by every POST field
/// as `key` then `value`, with the fields sorted by key. The header carries
/// the base64 HMAC-SHA1 digest under the account auth token.
pub fn verify_twilio_signature(
    auth_token: &str,
    signature_header: &str,
    url: &str,
    fields: &[(String, String)],
) -> Result<(), AuthError> {
    let mut sorted: Vec<&(String, String)> = fields.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut message = String::from(url);
    for (key, value) in sorted {
        message.push_str(key);
        message.push_str(value);
    }

    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).map_err(|_| AuthError::BadSignature)?;
    mac.update(message.as_bytes());
    let expected = mac.finalize().into_bytes();

    let provided = STANDARD
        .decode(signature_header)
        .map_err(|_| AuthError::BadSignature)?;

    constant_time_eq(&expected, &provided)
        .then_some(())
        .ok_or(AuthError::BadSignature)
}

/// Verify a Telnyx webhook signature.
///
/// Ed25519 over `timestamp | "|" | raw_body`, with the public key and
/// signature both base64. Timestamps more than five minutes away from
/// `now_unix` are rejected before any crypto runs.
pub fn verify_telnyx_signature(
    public_key_b64: &str,
    signature_b64: &str,
    timestamp: &str,
    raw_body: &[u8],
    now_unix: i64,
) -> Result<(), AuthError> {
    let ts: i64 = timestamp.parse().map_err(|_| AuthError::StaleTimestamp)?;
    if (now_unix - ts).abs() > MAX_TIMESTAMP_SKEW_SECS {
        return Err(AuthError::StaleTimestamp);
    }

    let key_bytes = STANDARD
        .decode(public_key_b64)
        .map_err(|_| AuthError::BadSignature)?;
    let signature = STANDARD
        .decode(signature_b64)
        .map_err(|_| AuthError::BadSignature)?;

    let mut message = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'|');
    message.extend_from_slice(raw_body);

    UnparsedPublicKey::new(&ED25519, key_bytes)
        .verify(&message, &signature)
        .map_err(|_| AuthError::BadSignature)
}

/// Current unix time, for callers of [`verify_telnyx_signature`].
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Mint a fresh single-use stream token: 32 random bytes, URL-safe base64
/// without padding.
pub fn new_ws_token() -> String {
    let mut bytes = [0u8; WS_TOKEN_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .expect("system RNG unavailable");
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare a provided stream token against the expected one in constant
/// time. Differing lengths compare unequal.
pub fn verify_ws_token(expected: &str, provided: &str) -> bool {
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn sign_twilio(auth_token: &str, url: &str, fields: &[(String, String)]) -> String {
        let mut sorted: Vec<&(String, String)> = fields.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut message = String::from(url);
        for (k, v) in sorted {
            message.push_str(k);
            message.push_str(v);
        }
        let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).unwrap();
        mac.update(message.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    fn form(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn twilio_signature_accepts_valid() {
        let fields = form(&[("CallSid", "CA123"), ("CallStatus", "ringing")]);
        let sig = sign_twilio("tok", "https://host/twiml", &fields);
        assert!(verify_twilio_signature("tok", &sig, "https://host/twiml", &fields).is_ok());
    }

    #[test]
    fn twilio_signature_is_field_order_independent() {
        let a = form(&[("B", "2"), ("A", "1")]);
        let b = form(&[("A", "1"), ("B", "2")]);
        let sig = sign_twilio("tok", "https://host/twiml", &a);
        assert!(verify_twilio_signature("tok", &sig, "https://host/twiml", &b).is_ok());
    }

    #[test]
    fn twilio_signature_rejects_tampered_fields() {
        let fields = form(&[("CallSid", "CA123"), ("CallStatus", "ringing")]);
        let sig = sign_twilio("tok", "https://host/twiml", &fields);
        let tampered = form(&[("CallSid", "CA999"), ("CallStatus", "ringing")]);
        assert!(verify_twilio_signature("tok", &sig, "https://host/twiml", &tampered).is_err());
    }

    #[test]
    fn twilio_signature_rejects_garbage_header() {
        let fields = form(&[("CallSid", "CA123")]);
        assert!(verify_twilio_signature("tok", "!!!", "https://host/twiml", &fields).is_err());
    }

    #[test]
    fn telnyx_signature_round_trip() {
        let doc = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        let key = Ed25519KeyPair::from_pkcs8(doc.as_ref()).unwrap();
        let public = STANDARD.encode(key.public_key().as_ref());

        let body = br#"{"data":{"event_type":"call.answered"}}"#;
        let ts = "1700000000";
        let mut message = Vec::new();
        message.extend_from_slice(ts.as_bytes());
        message.push(b'|');
        message.extend_from_slice(body);
        let sig = STANDARD.encode(key.sign(&message).as_ref());

        assert!(verify_telnyx_signature(&public, &sig, ts, body, 1_700_000_100).is_ok());
        // Tampered body fails.
        assert!(verify_telnyx_signature(&public, &sig, ts, b"{}", 1_700_000_100).is_err());
    }

    #[test]
    fn telnyx_signature_rejects_stale_timestamp() {
        let doc = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        let key = Ed25519KeyPair::from_pkcs8(doc.as_ref()).unwrap();
        let public = STANDARD.encode(key.public_key().as_ref());

        let err = verify_telnyx_signature(&public, "AAAA", "1700000000", b"x", 1_700_000_000 + 301)
            .unwrap_err();
        assert!(matches!(err, AuthError::StaleTimestamp));
    }

    #[test]
    fn ws_tokens_are_unique_and_url_safe() {
        let a = new_ws_token();
        let b = new_ws_token();
        assert_ne!(a, b);
        // 32 bytes -> 43 base64 chars, no padding.
        assert_eq!(a.len(), 43);
        assert!(!a.contains('=') && !a.contains('+') && !a.contains('/'));
    }

    #[test]
    fn ws_token_verification() {
        let token = new_ws_token();
        assert!(verify_ws_token(&token, &token));
        assert!(!verify_ws_token(&token, &new_ws_token()));
        assert!(!verify_ws_token(&token, &token[..20]));
        assert!(!verify_ws_token(&token, ""));
    }
}
