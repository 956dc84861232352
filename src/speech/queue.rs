//! Outbound event queue for the speech stream.
//!
//! Two queues feed one consumer: control events (session/prompt/content
//! lifecycle, text, tool results) and audio events. Control has strict
//! priority. Audio is withheld while the model is speaking, so the user's
//! audio buffers here until the model yields; when an interruption flips
//! the flag the queue resumes and the model perceives the barge-in.
//!
//! The consumer is woken whenever an event arrives on either queue or the
//! speaking flag flips.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

use super::events::ClientEvent;

/// Upper bound on buffered audio events; overflow drops the oldest frame.
/// Control events are never dropped.
const MAX_AUDIO_EVENTS: usize = 500;

#[derive(Default)]
struct Inner {
    control: VecDeque<ClientEvent>,
    audio: VecDeque<ClientEvent>,
    model_speaking: bool,
    closing: bool,
}

/// Priority queue pair with a `model_speaking` gate on the audio side.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_control(&self, event: ClientEvent) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.closing {
                return;
            }
            inner.control.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn push_audio(&self, event: ClientEvent) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.closing {
                return;
            }
            if inner.audio.len() >= MAX_AUDIO_EVENTS {
                inner.audio.pop_front();
                warn!("speech audio queue full, dropping oldest frame");
            }
            inner.audio.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Flip the speaking gate. Clearing it wakes the consumer so buffered
    /// audio resumes immediately.
    pub fn set_model_speaking(&self, speaking: bool) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.model_speaking == speaking {
                return;
            }
            inner.model_speaking = speaking;
        }
        self.notify.notify_one();
    }

    pub fn model_speaking(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").model_speaking
    }

    /// Stop accepting events. Control already queued still drains; audio
    /// is discarded.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.closing = true;
            inner.audio.clear();
        }
        self.notify.notify_one();
    }

    /// Next event to put on the wire. Control first, then audio when the
    /// model is not speaking. Returns `None` once closed and drained.
    pub async fn next(&self) -> Option<ClientEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(event) = inner.control.pop_front() {
                    return Some(event);
                }
                if inner.closing {
                    return None;
                }
                if !inner.model_speaking
                    && let Some(event) = inner.audio.pop_front()
                {
                    return Some(event);
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn audio_len(&self) -> usize {
        self.inner.lock().unwrap().audio.len()
    }
}
