//! Bridge configuration.
//!
//! Configuration is environment-first: `.env` values are loaded by the
//! binary before [`BridgeConfig::from_env`] runs, and every recognized
//! option maps to one variable. Required options depend on the selected
//! carrier and voice backend; all of the missing ones are reported in a
//! single enumerated startup error rather than one at a time.

use std::env;
use std::time::Duration;

use crate::errors::ConfigError;

/// Which telephony carrier places and controls calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierKind {
    Twilio,
    Telnyx,
}

/// Which conversational backend drives the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceBackend {
    /// One bidirectional speech-to-speech model stream.
    Unified,
    /// Separate STT -> LLM -> TTS stages.
    SplitBrain,
    /// STT and TTS only; the Driver supplies every spoken line.
    SplitSttTts,
}

impl VoiceBackend {
    pub fn is_split(self) -> bool {
        !matches!(self, VoiceBackend::Unified)
    }
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
}

#[derive(Debug, Clone)]
pub struct TelnyxConfig {
    pub api_key: String,
    pub connection_id: String,
    /// Base64 Ed25519 public key for webhook verification. Optional only
    /// when the deployment is marked as tunneled.
    pub public_key: Option<String>,
}

/// Unified speech-model settings.
#[derive(Debug, Clone)]
pub struct UnifiedConfig {
    pub ws_url: String,
    pub api_key: String,
    pub model_id: String,
    pub voice_id: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

/// Split-mode LLM brain settings.
#[derive(Debug, Clone)]
pub struct BrainConfig {
    pub api_key: String,
    pub model_id: String,
    pub system_prompt: String,
    /// Template applied to out-of-band context injections; `{}` is replaced
    /// with the injected text.
    pub context_template: String,
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub voice: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct VadSettings {
    /// Silence that closes an utterance, in milliseconds.
    pub silence_ms: u64,
    /// RMS energy threshold on decoded 16-bit samples.
    pub energy_threshold: f64,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            silence_ms: 800,
            energy_threshold: 300.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub carrier: CarrierKind,
    pub twilio: Option<TwilioConfig>,
    pub telnyx: Option<TelnyxConfig>,

    /// Number calls are placed from, E.164.
    pub from_number: String,
    /// The human's number, E.164.
    pub user_number: String,

    pub backend: VoiceBackend,
    pub unified: Option<UnifiedConfig>,
    pub brain: Option<BrainConfig>,
    pub stt: Option<SttConfig>,
    pub tts: Option<TtsConfig>,
    pub vad: VadSettings,

    /// How long a Driver command waits for the next user turn.
    pub turn_timeout: Duration,
    /// How long call setup waits for the media stream to come up.
    pub media_ready_timeout: Duration,

    /// Public base URL the carrier posts webhooks to.
    pub public_url: String,
    /// Public WebSocket base URL, when a tunnel serves WS separately.
    pub ws_url: Option<String>,
    pub port: u16,

    /// Tunneled deployment: accept unsigned webhooks and untokenized
    /// stream upgrades. Every bypass is logged.
    pub trust_without_signature: bool,
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut missing: Vec<&'static str> = Vec::new();

        let carrier = match env::var("CARRIER").ok().as_deref() {
            Some("twilio") | None => CarrierKind::Twilio,
            Some("telnyx") => CarrierKind::Telnyx,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "CARRIER".into(),
                    detail: format!("expected 'twilio' or 'telnyx', got '{other}'"),
                });
            }
        };

        let backend = match env::var("VOICE_BACKEND").ok().as_deref() {
            Some("unified") | None => VoiceBackend::Unified,
            Some("split") | Some("split-brain") => VoiceBackend::SplitBrain,
            Some("split-stt-tts") => VoiceBackend::SplitSttTts,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "VOICE_BACKEND".into(),
                    detail: format!("expected 'unified', 'split' or 'split-stt-tts', got '{other}'"),
                });
            }
        };

        let trust_without_signature = env_flag("TRUST_WITHOUT_SIGNATURE");

        let twilio = if carrier == CarrierKind::Twilio {
            Some(TwilioConfig {
                account_sid: require(&mut missing, "TWILIO_ACCOUNT_SID"),
                auth_token: require(&mut missing, "TWILIO_AUTH_TOKEN"),
            })
        } else {
            None
        };

        let telnyx = if carrier == CarrierKind::Telnyx {
            let public_key = env::var("TELNYX_PUBLIC_KEY").ok();
            if public_key.is_none() && !trust_without_signature {
                missing.push("TELNYX_PUBLIC_KEY");
            }
            Some(TelnyxConfig {
                api_key: require(&mut missing, "TELNYX_API_KEY"),
                connection_id: require(&mut missing, "TELNYX_CONNECTION_ID"),
                public_key,
            })
        } else {
            None
        };

        let unified = if backend == VoiceBackend::Unified {
            Some(UnifiedConfig {
                ws_url: require(&mut missing, "SPEECH_WS_URL"),
                api_key: require(&mut missing, "SPEECH_API_KEY"),
                model_id: env::var("SPEECH_MODEL_ID").unwrap_or_else(|_| "sonic-voice-1".into()),
                voice_id: env::var("SPEECH_VOICE_ID").unwrap_or_else(|_| "matthew".into()),
                system_prompt: env::var("AGENT_SYSTEM_PROMPT").unwrap_or_else(|_| {
                    "You are a helpful assistant on a phone call. Keep replies short and \
                     conversational."
                        .into()
                }),
                max_tokens: env_parsed("SPEECH_MAX_TOKENS", 1024)?,
                temperature: env_parsed("SPEECH_TEMPERATURE", 0.7)?,
                top_p: env_parsed("SPEECH_TOP_P", 0.9)?,
            })
        } else {
            None
        };

        let brain = if backend == VoiceBackend::SplitBrain {
            Some(BrainConfig {
                api_key: require(&mut missing, "ANTHROPIC_API_KEY"),
                model_id: env::var("BRAIN_MODEL_ID")
                    .unwrap_or_else(|_| "claude-3-5-haiku-latest".into()),
                system_prompt: env::var("AGENT_SYSTEM_PROMPT").unwrap_or_else(|_| {
                    "You are a helpful assistant on a phone call. Keep replies short and \
                     conversational."
                        .into()
                }),
                context_template: env::var("BRAIN_CONTEXT_TEMPLATE")
                    .unwrap_or_else(|_| "[System: {}]".into()),
            })
        } else {
            None
        };

        let (stt, tts) = if backend.is_split() {
            (
                Some(SttConfig {
                    url: require(&mut missing, "STT_URL"),
                    api_key: env::var("STT_API_KEY").ok(),
                }),
                Some(TtsConfig {
                    url: require(&mut missing, "TTS_URL"),
                    api_key: env::var("TTS_API_KEY").ok(),
                    voice: env::var("TTS_VOICE").unwrap_or_else(|_| "default".into()),
                    model: env::var("TTS_MODEL").unwrap_or_else(|_| "default".into()),
                }),
            )
        } else {
            (None, None)
        };

        let vad = VadSettings {
            silence_ms: env_parsed("VAD_SILENCE_MS", 800u64)?,
            energy_threshold: env_parsed("VAD_ENERGY_THRESHOLD", 300.0f64)?,
        };

        let config = BridgeConfig {
            carrier,
            twilio,
            telnyx,
            from_number: require(&mut missing, "FROM_NUMBER"),
            user_number: require(&mut missing, "USER_NUMBER"),
            backend,
            unified,
            brain,
            stt,
            tts,
            vad,
            turn_timeout: Duration::from_millis(env_parsed("TURN_TIMEOUT_MS", 180_000u64)?),
            media_ready_timeout: Duration::from_millis(env_parsed(
                "MEDIA_READY_TIMEOUT_MS",
                15_000u64,
            )?),
            public_url: require(&mut missing, "PUBLIC_URL"),
            ws_url: env::var("WS_PUBLIC_URL").ok(),
            port: env_parsed("PORT", 8080u16)?,
            trust_without_signature,
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing.join(", ")));
        }
        Ok(config)
    }

    /// Webhook URL the carrier posts call events to.
    pub fn webhook_url(&self) -> String {
        format!("{}/twiml", self.public_url.trim_end_matches('/'))
    }

    /// Base wss:// URL for the media stream, derived from the public URL
    /// unless the operator points WS at a separate tunnel.
    pub fn media_ws_base(&self) -> String {
        let base = self.ws_url.as_deref().unwrap_or(&self.public_url);
        let base = base.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        }
    }

    /// Full media-stream URL for one call, carrying its stream token.
    pub fn media_ws_url(&self, token: &str) -> String {
        format!("{}/media-stream?token={token}", self.media_ws_base())
    }
}

fn require(missing: &mut Vec<&'static str>, name: &'static str) -> String {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn env_parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name: name.into(),
            detail: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

/// Build a config directly, bypassing the environment. Used across the
/// crate's tests.
#[cfg(test)]
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        carrier: CarrierKind::Twilio,
        twilio: Some(TwilioConfig {
            account_sid: "ACtest".into(),
            auth_token: "token".into(),
        }),
        telnyx: None,
        from_number: "+15550001111".into(),
        user_number: "+15550002222".into(),
        backend: VoiceBackend::Unified,
        unified: Some(UnifiedConfig {
            ws_url: "wss://speech.example/stream".into(),
            api_key: "key".into(),
            model_id: "sonic-voice-1".into(),
            voice_id: "matthew".into(),
            system_prompt: "You are a test agent.".into(),
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
        }),
        brain: None,
        stt: None,
        tts: None,
        vad: VadSettings::default(),
        turn_timeout: Duration::from_millis(180_000),
        media_ready_timeout: Duration::from_millis(15_000),
        public_url: "https://bridge.example".into(),
        ws_url: None,
        port: 8080,
        trust_without_signature: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_base_derives_from_public_url() {
        let config = test_config();
        assert_eq!(config.media_ws_base(), "wss://bridge.example");
        assert_eq!(
            config.media_ws_url("tok123"),
            "wss://bridge.example/media-stream?token=tok123"
        );
    }

    #[test]
    fn ws_base_prefers_dedicated_tunnel() {
        let mut config = test_config();
        config.ws_url = Some("https://ws-tunnel.example/".into());
        assert_eq!(config.media_ws_base(), "wss://ws-tunnel.example");
    }

    #[test]
    fn webhook_url_appends_twiml_path() {
        assert_eq!(test_config().webhook_url(), "https://bridge.example/twiml");
    }
}
