//! Split-brain pipeline: VAD-gated STT, an LLM with a tool loop, and
//! streaming TTS. The call session composes these stages and runs the
//! conversation loop; this module supplies the stages and the loop's
//! retry policy.

pub mod brain;
pub mod stt;
pub mod tts;
pub mod vad;

pub use brain::{BrainResponse, BrainToolUse, LlmBrain, StopReason};
pub use stt::SttClient;
pub use tts::{PlaybackBuffer, TtsClient};
pub use vad::UtteranceDetector;

use std::time::Duration;

use crate::errors::AgentError;

/// What to do with a failed conversation-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    End,
}

/// Explicit retry policy for the split-mode conversation loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Classify an error after `attempt` consecutive failures.
    ///
    /// Stream errors against remote stages are transient and retried with
    /// linear backoff until the budget runs out; protocol and connect
    /// failures end the loop.
    pub fn classify(&self, error: &AgentError, attempt: u32) -> RetryDecision {
        match error {
            AgentError::StreamError(_) if attempt < self.max_attempts => {
                RetryDecision::Retry(self.backoff * attempt.max(1))
            }
            _ => RetryDecision::End,
        }
    }
}
