//! Carrier media-socket framing and the per-session egress writer.
//!
//! The carrier speaks JSON text frames over its WebSocket. Inbound frames
//! of interest: `start` (carries the stream id), `media` (base64 µ-law,
//! filtered to the caller's inbound track), and `stop`. Outbound audio is
//! wrapped in `{event:"media", streamSid, media:{payload}}` envelopes in
//! 160-byte chunks; barge-in emits `{event:"clear", streamSid}`.
//!
//! Exactly one writer task serializes all egress for a session. Audio is
//! paced at one 20 ms frame per 20 ms of wall clock; control directives
//! jump the queue and go out unpaced.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Bound on queued audio frames (~2 s); overflow drops the oldest frame.
const MAX_AUDIO_FRAMES: usize = 100;

/// Wall-clock pace between audio frames.
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

// =============================================================================
// Wire shapes
// =============================================================================

/// Inbound frame from the carrier socket.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub start: Option<StartInfo>,
    #[serde(default)]
    pub media: Option<InboundMedia>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    pub stream_sid: String,
}

#[derive(Debug, Deserialize)]
pub struct InboundMedia {
    #[serde(default)]
    pub track: Option<String>,
    pub payload: String,
}

impl InboundFrame {
    /// Caller audio, if this is a media frame on the inbound track.
    pub fn inbound_payload(&self) -> Option<Vec<u8>> {
        if self.event != "media" {
            return None;
        }
        let media = self.media.as_ref()?;
        match media.track.as_deref() {
            Some("inbound") | Some("inbound_track") | None => {}
            _ => return None,
        }
        BASE64.decode(&media.payload).ok()
    }
}

#[derive(Debug, Serialize)]
struct OutboundMediaFrame<'a> {
    event: &'static str,
    #[serde(rename = "streamSid")]
    stream_sid: &'a str,
    media: OutboundPayload,
}

#[derive(Debug, Serialize)]
struct OutboundPayload {
    payload: String,
}

#[derive(Debug, Serialize)]
struct ClearFrame<'a> {
    event: &'static str,
    #[serde(rename = "streamSid")]
    stream_sid: &'a str,
}

/// Serialize one outbound audio envelope.
pub fn media_frame_json(stream_sid: &str, mulaw: &[u8]) -> String {
    serde_json::to_string(&OutboundMediaFrame {
        event: "media",
        stream_sid,
        media: OutboundPayload {
            payload: BASE64.encode(mulaw),
        },
    })
    .expect("media frame serializes")
}

/// Serialize the clear-outbound-audio directive.
pub fn clear_frame_json(stream_sid: &str) -> String {
    serde_json::to_string(&ClearFrame {
        event: "clear",
        stream_sid,
    })
    .expect("clear frame serializes")
}

// =============================================================================
// Egress queue
// =============================================================================

/// Control directives; these are never dropped and never paced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressControl {
    /// Tell the carrier to flush its outbound audio buffer.
    Clear,
}

#[derive(Debug, PartialEq)]
pub enum EgressItem {
    Control(EgressControl),
    Audio(Vec<u8>),
}

#[derive(Default)]
struct EgressInner {
    control: VecDeque<EgressControl>,
    audio: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Bounded producer queue feeding the writer task. Control beats audio;
/// audio overflow drops the oldest frame and logs.
#[derive(Default)]
pub struct EgressQueue {
    inner: Mutex<EgressInner>,
    notify: Notify,
}

impl EgressQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_audio(&self, frame: Vec<u8>) {
        {
            let mut inner = self.inner.lock().expect("egress lock poisoned");
            if inner.closed {
                return;
            }
            if inner.audio.len() >= MAX_AUDIO_FRAMES {
                inner.audio.pop_front();
                warn!("egress audio queue full, dropping oldest frame");
            }
            inner.audio.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub fn push_control(&self, control: EgressControl) {
        {
            let mut inner = self.inner.lock().expect("egress lock poisoned");
            if inner.closed {
                return;
            }
            inner.control.push_back(control);
        }
        self.notify.notify_one();
    }

    /// Drop all pending audio (barge-in) without touching control.
    pub fn clear_audio(&self) {
        self.inner.lock().expect("egress lock poisoned").audio.clear();
    }

    pub fn close(&self) {
        self.inner.lock().expect("egress lock poisoned").closed = true;
        self.notify.notify_one();
    }

    pub async fn next(&self) -> Option<EgressItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("egress lock poisoned");
                if let Some(control) = inner.control.pop_front() {
                    return Some(EgressItem::Control(control));
                }
                if let Some(frame) = inner.audio.pop_front() {
                    return Some(EgressItem::Audio(frame));
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn is_idle(&self) -> bool {
        let inner = self.inner.lock().expect("egress lock poisoned");
        inner.audio.is_empty() && inner.control.is_empty()
    }

    /// Wait until the queue has drained or the deadline passes. Used for
    /// the bounded drain before hangup.
    pub async fn wait_idle(&self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, async {
            while !self.is_idle() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
    }
}

/// Drive the egress queue onto the carrier socket until the queue closes
/// or the socket dies. This is the session's single writer task.
pub async fn run_writer(
    queue: &EgressQueue,
    stream_sid: &str,
    sink: &mut SplitSink<WebSocket, Message>,
) {
    while let Some(item) = queue.next().await {
        let (json, paced) = match &item {
            EgressItem::Control(EgressControl::Clear) => (clear_frame_json(stream_sid), false),
            EgressItem::Audio(frame) => (media_frame_json(stream_sid, frame), true),
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!("media socket write failed: {e}");
            break;
        }
        if paced {
            tokio::time::sleep(FRAME_INTERVAL).await;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_frame_shape() {
        let json = media_frame_json("MZ123", &[0xff; 4]);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ123");
        assert_eq!(value["media"]["payload"], BASE64.encode([0xffu8; 4]));
    }

    #[test]
    fn clear_frame_shape() {
        let json = clear_frame_json("MZ123");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, serde_json::json!({"event": "clear", "streamSid": "MZ123"}));
    }

    #[test]
    fn start_frame_parses_stream_sid() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"event":"start","start":{"streamSid":"MZ9","accountSid":"AC1"}}"#,
        )
        .unwrap();
        assert_eq!(frame.event, "start");
        assert_eq!(frame.start.unwrap().stream_sid, "MZ9");
    }

    #[test]
    fn inbound_track_filter() {
        let payload = BASE64.encode([1u8, 2, 3]);
        let inbound: InboundFrame = serde_json::from_str(&format!(
            r#"{{"event":"media","media":{{"track":"inbound","payload":"{payload}"}}}}"#
        ))
        .unwrap();
        assert_eq!(inbound.inbound_payload(), Some(vec![1, 2, 3]));

        let outbound: InboundFrame = serde_json::from_str(&format!(
            r#"{{"event":"media","media":{{"track":"outbound","payload":"{payload}"}}}}"#
        ))
        .unwrap();
        assert_eq!(outbound.inbound_payload(), None);

        // No track attribute at all: accepted (some carriers omit it).
        let untagged: InboundFrame = serde_json::from_str(&format!(
            r#"{{"event":"media","media":{{"payload":"{payload}"}}}}"#
        ))
        .unwrap();
        assert_eq!(untagged.inbound_payload(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn control_jumps_the_audio_queue() {
        let queue = EgressQueue::new();
        queue.push_audio(vec![1; 160]);
        queue.push_audio(vec![2; 160]);
        queue.push_control(EgressControl::Clear);

        assert_eq!(
            queue.next().await,
            Some(EgressItem::Control(EgressControl::Clear))
        );
        assert_eq!(queue.next().await, Some(EgressItem::Audio(vec![1; 160])));
    }

    #[tokio::test]
    async fn clear_audio_discards_pending_frames() {
        let queue = EgressQueue::new();
        queue.push_audio(vec![1; 160]);
        queue.push_audio(vec![2; 160]);
        queue.clear_audio();
        queue.push_audio(vec![3; 160]);

        assert_eq!(queue.next().await, Some(EgressItem::Audio(vec![3; 160])));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let queue = EgressQueue::new();
        for n in 0..(MAX_AUDIO_FRAMES + 5) {
            queue.push_audio(vec![n as u8; 160]);
        }
        // First five were dropped.
        assert_eq!(queue.next().await, Some(EgressItem::Audio(vec![5; 160])));
    }

    #[tokio::test]
    async fn close_terminates_consumer() {
        let queue = EgressQueue::new();
        queue.push_audio(vec![1; 160]);
        queue.close();
        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_returns_when_drained() {
        let queue = std::sync::Arc::new(EgressQueue::new());
        queue.push_audio(vec![1; 160]);

        let drainer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                while queue.next().await.is_some() {}
            })
        };
        queue.wait_idle(Duration::from_secs(3)).await;
        assert!(queue.is_idle());
        queue.close();
        let _ = drainer.await;
    }
}
