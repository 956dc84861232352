//! Energy-based utterance segmentation.
//!
//! µ-law chunks from the carrier are classified by RMS energy over the
//! decoded samples. An utterance is speech that lasted at least
//! `MIN_SPEECH_MS` followed by silence that persisted for the configured
//! silence window; the detector then hands back the accumulated µ-law
//! bytes and resets.

use tracing::debug;

use crate::audio;
use crate::config::VadSettings;

/// Minimum sustained speech before an utterance can begin.
pub const MIN_SPEECH_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Silence,
    /// Energy rose but has not yet persisted long enough.
    PotentialSpeech,
    Speech,
}

pub struct UtteranceDetector {
    settings: VadSettings,
    state: VadState,
    /// Accumulated µ-law for the utterance in progress.
    buffer: Vec<u8>,
    speech_ms: u64,
    silence_ms: u64,
}

impl UtteranceDetector {
    pub fn new(settings: VadSettings) -> Self {
        Self {
            settings,
            state: VadState::Silence,
            buffer: Vec::new(),
            speech_ms: 0,
            silence_ms: 0,
        }
    }

    /// Feed one µ-law chunk. Returns the complete utterance when the
    /// closing silence window elapses.
    pub fn push(&mut self, mulaw: &[u8]) -> Option<Vec<u8>> {
        if mulaw.is_empty() {
            return None;
        }
        let chunk_ms = (mulaw.len() / audio::CARRIER_SAMPLES_PER_MS).max(1) as u64;
        let loud = self.energy_of(mulaw) >= self.settings.energy_threshold;

        match self.state {
            VadState::Silence => {
                if loud {
                    self.state = VadState::PotentialSpeech;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(mulaw);
                    self.speech_ms = chunk_ms;
                    self.promote_if_sustained();
                }
            }
            VadState::PotentialSpeech => {
                if loud {
                    self.buffer.extend_from_slice(mulaw);
                    self.speech_ms += chunk_ms;
                    self.promote_if_sustained();
                } else {
                    // Too short to be speech; discard.
                    self.reset();
                }
            }
            VadState::Speech => {
                self.buffer.extend_from_slice(mulaw);
                if loud {
                    self.silence_ms = 0;
                } else {
                    self.silence_ms += chunk_ms;
                    if self.silence_ms >= self.settings.silence_ms {
                        let utterance = std::mem::take(&mut self.buffer);
                        debug!(
                            ms = utterance.len() / audio::CARRIER_SAMPLES_PER_MS,
                            "utterance complete"
                        );
                        self.reset();
                        return Some(utterance);
                    }
                }
            }
        }
        None
    }

    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.buffer.clear();
        self.speech_ms = 0;
        self.silence_ms = 0;
    }

    fn promote_if_sustained(&mut self) {
        if self.speech_ms >= MIN_SPEECH_MS {
            debug!("speech started");
            self.state = VadState::Speech;
            self.silence_ms = 0;
        }
    }

    fn energy_of(&self, mulaw: &[u8]) -> f64 {
        let samples = audio::mulaw_decode_buf(mulaw);
        let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum_sq / samples.len() as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK_MS: usize = 20;

    fn settings() -> VadSettings {
        VadSettings {
            silence_ms: 800,
            energy_threshold: 300.0,
        }
    }

    /// A 20 ms µ-law chunk of the given linear amplitude.
    fn chunk(amplitude: i16) -> Vec<u8> {
        let samples = vec![amplitude; CHUNK_MS * audio::CARRIER_SAMPLES_PER_MS];
        audio::mulaw_encode_buf(&samples)
    }

    fn feed(detector: &mut UtteranceDetector, amplitude: i16, ms: usize) -> Option<Vec<u8>> {
        for _ in 0..(ms / CHUNK_MS) {
            if let Some(utterance) = detector.push(&chunk(amplitude)) {
                return Some(utterance);
            }
        }
        None
    }

    #[test]
    fn speech_then_silence_yields_utterance() {
        let mut detector = UtteranceDetector::new(settings());
        assert!(feed(&mut detector, 8000, 2400).is_none());
        let utterance = feed(&mut detector, 0, 800).expect("utterance after silence window");
        // 2.4 s of speech plus the closing silence, minus nothing dropped.
        let total_ms = utterance.len() / audio::CARRIER_SAMPLES_PER_MS;
        assert!(total_ms >= 2400, "got {total_ms} ms");
    }

    #[test]
    fn short_blip_is_not_speech() {
        let mut detector = UtteranceDetector::new(settings());
        // 100 ms burst, below MIN_SPEECH_MS.
        assert!(feed(&mut detector, 8000, 100).is_none());
        // Silence resets; nothing ever comes out.
        assert!(feed(&mut detector, 0, 2000).is_none());
    }

    #[test]
    fn brief_pause_does_not_split_an_utterance() {
        let mut detector = UtteranceDetector::new(settings());
        assert!(feed(&mut detector, 8000, 600).is_none());
        // 400 ms pause, shorter than the 800 ms window.
        assert!(feed(&mut detector, 0, 400).is_none());
        assert!(feed(&mut detector, 8000, 600).is_none());
        assert!(feed(&mut detector, 0, 800).is_some());
    }

    #[test]
    fn silence_alone_never_triggers() {
        let mut detector = UtteranceDetector::new(settings());
        assert!(feed(&mut detector, 0, 5000).is_none());
    }

    #[test]
    fn custom_silence_window_is_honored() {
        let mut detector = UtteranceDetector::new(VadSettings {
            silence_ms: 400,
            energy_threshold: 300.0,
        });
        assert!(feed(&mut detector, 8000, 600).is_none());
        assert!(feed(&mut detector, 0, 400).is_some());
    }
}
