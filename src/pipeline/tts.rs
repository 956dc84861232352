//! Streaming text-to-speech with a jitter buffer.
//!
//! The endpoint streams raw PCM16 at 24 kHz. Chunks arrive in bursts, so
//! playback goes through a jitter buffer that withholds output until
//! 100 ms of µ-law has accumulated, then drains in 160-byte (20 ms)
//! frames; any sub-frame tail is flushed at end of stream.

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::json;

use crate::audio;
use crate::config::TtsConfig;
use crate::errors::AgentError;

/// µ-law bytes withheld before playback begins (100 ms at 8 kHz).
const PRIME_BYTES: usize = 800;

pub struct TtsClient {
    config: TtsConfig,
    http: reqwest::Client,
}

impl TtsClient {
    pub fn new(config: TtsConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    /// Start synthesis; returns the raw byte stream of PCM16 at 24 kHz.
    pub async fn stream(
        &self,
        text: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, reqwest::Error>>, AgentError> {
        let body = json!({
            "text": text,
            "voice": self.config.voice,
            "model": self.config.model,
            "output_format": "pcm",
            "sample_rate": 24_000,
        });

        let mut request = self.http.post(&self.config.url).json(&body);
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
            return Err(AgentError::StreamError(format!("TTS {status}: {body}")));
        }

        Ok(response.bytes_stream().boxed())
    }
}

/// Converts the 24 kHz PCM byte stream to paced µ-law frames.
///
/// Holds the odd PCM byte between chunks, downsamples, encodes, and
/// applies the priming threshold before any frame is released.
pub struct PlaybackBuffer {
    /// Carried-over PCM byte when a chunk splits a sample.
    pcm_remainder: Vec<u8>,
    mulaw: Vec<u8>,
    primed: bool,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self {
            pcm_remainder: Vec::new(),
            mulaw: Vec::new(),
            primed: false,
        }
    }

    /// Feed a PCM chunk; returns zero or more complete 160-byte frames.
    pub fn push_pcm(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut data = std::mem::take(&mut self.pcm_remainder);
        data.extend_from_slice(chunk);
        if data.len() % 2 == 1 {
            self.pcm_remainder = vec![data.pop().expect("non-empty after parity check")];
        }

        let samples = audio::pcm_bytes_to_samples(&data);
        let narrow = audio::downsample_24k_to_8k(&samples);
        self.mulaw.extend(audio::mulaw_encode_buf(&narrow));

        if !self.primed {
            if self.mulaw.len() < PRIME_BYTES {
                return Vec::new();
            }
            self.primed = true;
        }
        self.drain_frames()
    }

    /// End of stream: every whole frame plus the unpadded tail.
    pub fn flush(&mut self) -> Vec<Vec<u8>> {
        self.primed = true;
        let mut frames = self.drain_frames();
        if !self.mulaw.is_empty() {
            frames.push(std::mem::take(&mut self.mulaw));
        }
        self.pcm_remainder.clear();
        frames
    }

    fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while self.mulaw.len() >= audio::FRAME_BYTES {
            let rest = self.mulaw.split_off(audio::FRAME_BYTES);
            frames.push(std::mem::replace(&mut self.mulaw, rest));
        }
        frames
    }
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// PCM16 bytes for `ms` milliseconds of DC signal at 24 kHz.
    fn pcm_ms(ms: usize, value: i16) -> Vec<u8> {
        audio::samples_to_pcm_bytes(&vec![value; ms * 24])
    }

    #[test]
    fn withholds_output_until_primed() {
        let mut buffer = PlaybackBuffer::new();
        // 60 ms of audio -> 60 ms of µ-law (480 bytes), below the 100 ms
        // priming threshold.
        assert!(buffer.push_pcm(&pcm_ms(60, 1000)).is_empty());
        // 60 more ms crosses the threshold; 120 ms drains as six frames.
        let frames = buffer.push_pcm(&pcm_ms(60, 1000));
        assert_eq!(frames.len(), 6);
        assert!(frames.iter().all(|f| f.len() == audio::FRAME_BYTES));
    }

    #[test]
    fn steady_state_drains_whole_frames_only() {
        let mut buffer = PlaybackBuffer::new();
        buffer.push_pcm(&pcm_ms(120, 1000));
        // 30 ms in -> one full frame out, 10 ms retained.
        let frames = buffer.push_pcm(&pcm_ms(30, 1000));
        assert_eq!(frames.len(), 1);
        let tail = buffer.flush();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].len(), 80); // the retained 10 ms
    }

    #[test]
    fn flush_emits_tail_even_before_priming() {
        let mut buffer = PlaybackBuffer::new();
        assert!(buffer.push_pcm(&pcm_ms(30, 500)).is_empty());
        let frames = buffer.flush();
        // 30 ms = 240 µ-law bytes: one full frame plus an 80-byte tail.
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 160);
        assert_eq!(frames[1].len(), 80);
    }

    #[test]
    fn odd_byte_chunks_are_carried_over() {
        let mut buffer = PlaybackBuffer::new();
        let pcm = pcm_ms(200, 1000);
        // Split at an odd offset; no sample may be lost or torn.
        let frames_a = buffer.push_pcm(&pcm[..101]);
        let frames_b = buffer.push_pcm(&pcm[101..]);
        let tail = buffer.flush();
        let total: usize = frames_a
            .iter()
            .chain(frames_b.iter())
            .chain(tail.iter())
            .map(|f| f.len())
            .sum();
        // 200 ms at 24 kHz -> 4800 samples -> 1600 at 8 kHz.
        assert_eq!(total, 1600);
    }

    #[test]
    fn dc_signal_survives_the_whole_path() {
        let mut buffer = PlaybackBuffer::new();
        let mut frames = buffer.push_pcm(&pcm_ms(200, 1000));
        frames.extend(buffer.flush());
        let expected = audio::mulaw_encode(1000);
        for frame in frames {
            assert!(frame.iter().all(|&b| b == expected));
        }
    }
}
