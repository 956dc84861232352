//! Speech-to-text over a batch REST endpoint.
//!
//! Completed utterances are decoded from µ-law, wrapped in an 8 kHz mono
//! WAV, and posted as multipart form data. A `transcribing` flag prevents
//! overlapping posts: a new utterance arriving while one is in flight is
//! dropped with a log line rather than queued behind stale audio.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::audio;
use crate::config::SttConfig;
use crate::errors::AgentError;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct SttClient {
    config: SttConfig,
    http: reqwest::Client,
    transcribing: Arc<AtomicBool>,
}

impl SttClient {
    pub fn new(config: SttConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            transcribing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Transcribe one µ-law utterance. Returns `Ok(None)` when a post is
    /// already in flight or when the endpoint heard nothing.
    pub async fn transcribe(&self, mulaw: &[u8]) -> Result<Option<String>, AgentError> {
        if self.transcribing.swap(true, Ordering::SeqCst) {
            warn!("transcription already in flight, dropping utterance");
            return Ok(None);
        }
        let result = self.post_utterance(mulaw).await;
        self.transcribing.store(false, Ordering::SeqCst);
        result
    }

    async fn post_utterance(&self, mulaw: &[u8]) -> Result<Option<String>, AgentError> {
        let samples = audio::mulaw_decode_buf(mulaw);
        let wav = audio::wav::from_samples(&samples, 8000);
        debug!(bytes = wav.len(), "posting utterance to STT");

        let part = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| AgentError::StreamError(e.to_string()))?;
        let form = Form::new().part("file", part);

        let mut request = self.http.post(&self.config.url).multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::StreamError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::StreamError(format!("STT {status}: {body}")));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| AgentError::StreamError(e.to_string()))?;

        let text = parsed.text.trim().to_string();
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }
}
