//! Wire events for the bidirectional speech-model stream.
//!
//! Every frame is a JSON envelope with a single `event` object whose one
//! key names the event. Both directions are closed sum types: frames that
//! fail to parse are logged and dropped by the reader, which also covers
//! event kinds this bridge does not know about.

use serde::{Deserialize, Serialize};

/// Who a content block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// What a content block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentKind {
    Audio,
    Text,
    Tool,
}

/// Stop reason signalling the model was cut off by the user.
pub const STOP_REASON_INTERRUPTED: &str = "INTERRUPTED";

// =============================================================================
// Client -> model
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutputConfig {
    pub media_type: &'static str,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u32,
    pub channel_count: u32,
    pub voice_id: String,
    pub encoding: &'static str,
    pub audio_type: &'static str,
}

impl AudioOutputConfig {
    /// Speech output: base64 16-bit LPCM mono at 24 kHz.
    pub fn speech(voice_id: &str) -> Self {
        Self {
            media_type: "audio/lpcm",
            sample_rate_hertz: 24_000,
            sample_size_bits: 16,
            channel_count: 1,
            voice_id: voice_id.to_string(),
            encoding: "base64",
            audio_type: "SPEECH",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInputConfig {
    pub media_type: &'static str,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u32,
    pub channel_count: u32,
    pub encoding: &'static str,
    pub audio_type: &'static str,
}

impl AudioInputConfig {
    /// Microphone-side input: base64 16-bit LPCM mono at 16 kHz.
    pub fn speech() -> Self {
        Self {
            media_type: "audio/lpcm",
            sample_rate_hertz: 16_000,
            sample_size_bits: 16,
            channel_count: 1,
            encoding: "base64",
            audio_type: "SPEECH",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOutputConfig {
    pub media_type: &'static str,
}

impl Default for TextOutputConfig {
    fn default() -> Self {
        Self {
            media_type: "text/plain",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecEntry {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfiguration {
    pub tools: Vec<ToolSpecEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultInputConfig {
    pub tool_use_id: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub text_input_configuration: TextOutputConfig,
}

/// Events sent to the model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    SessionStart { inference_configuration: InferenceConfig },

    #[serde(rename_all = "camelCase")]
    PromptStart {
        prompt_name: String,
        audio_output_configuration: AudioOutputConfig,
        text_output_configuration: TextOutputConfig,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_configuration: Option<ToolConfiguration>,
    },

    #[serde(rename_all = "camelCase")]
    ContentStart {
        prompt_name: String,
        content_name: String,
        #[serde(rename = "type")]
        kind: ContentKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        interactive: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_input_configuration: Option<AudioInputConfig>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text_input_configuration: Option<TextOutputConfig>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_result_input_configuration: Option<ToolResultInputConfig>,
    },

    #[serde(rename_all = "camelCase")]
    TextInput {
        prompt_name: String,
        content_name: String,
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    AudioInput {
        prompt_name: String,
        content_name: String,
        /// Base64 PCM16 at 16 kHz.
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    ToolResult {
        prompt_name: String,
        content_name: String,
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    ContentEnd {
        prompt_name: String,
        content_name: String,
    },

    #[serde(rename_all = "camelCase")]
    PromptEnd { prompt_name: String },

    SessionEnd {},
}

impl ClientEvent {
    pub fn is_audio(&self) -> bool {
        matches!(self, ClientEvent::AudioInput { .. })
    }
}

/// Envelope wrapping every outbound frame.
#[derive(Debug, Clone, Serialize)]
pub struct ClientEnvelope {
    pub event: ClientEvent,
}

// =============================================================================
// Model -> client
// =============================================================================

/// Events received from the model.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    ContentStart {
        #[serde(default)]
        content_id: Option<String>,
        #[serde(default)]
        role: Option<Role>,
        #[serde(rename = "type", default)]
        kind: Option<ContentKind>,
    },

    #[serde(rename_all = "camelCase")]
    AudioOutput {
        /// Base64 PCM16 at 24 kHz.
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    TextOutput {
        #[serde(default)]
        role: Option<Role>,
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    ToolUse {
        #[serde(default)]
        content_id: Option<String>,
        tool_use_id: String,
        tool_name: String,
        #[serde(default)]
        content: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ContentEnd {
        #[serde(default)]
        content_id: Option<String>,
        #[serde(rename = "type", default)]
        kind: Option<ContentKind>,
        /// Open vocabulary; only `INTERRUPTED` is acted on, the rest are
        /// ignored without failing.
        #[serde(default)]
        stop_reason: Option<String>,
    },

    CompletionEnd {},

    #[serde(rename_all = "camelCase")]
    UsageEvent {
        #[serde(default)]
        total_input_tokens: Option<u64>,
        #[serde(default)]
        total_output_tokens: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    ModelStreamError {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    InternalServerError {
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEnvelope {
    pub event: ServerEvent,
}
