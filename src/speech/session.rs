//! Bidirectional speech-model session.
//!
//! One session maps to one telephone call. `connect` opens the stream,
//! emits the fixed setup sequence, and spawns a reader and a writer task;
//! the writer consumes the priority [`EventQueue`] and, on close, walks an
//! ordered teardown state machine (content-end, prompt-end, session-end)
//! before the sink is dropped.
//!
//! Callbacks are required at construction. A session with nothing wired to
//! it is a programmer error, not a runtime surprise.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{
    AudioInputConfig, AudioOutputConfig, ClientEnvelope, ClientEvent, ContentKind, InferenceConfig,
    Role, STOP_REASON_INTERRUPTED, ServerEnvelope, ServerEvent, TextOutputConfig,
    ToolConfiguration, ToolResultInputConfig, ToolSpecEntry,
};
use super::queue::EventQueue;
use crate::audio;
use crate::config::UnifiedConfig;
use crate::errors::AgentError;
use crate::tools::ToolSpec;

/// How long `close` waits for the writer to drain the teardown sequence.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A completed tool-use request, assembled from one or more partial events.
#[derive(Debug, Clone)]
pub struct ToolUseRequest {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

/// Callbacks the owning call session must provide.
///
/// All of them are invoked from the reader task; implementations forward
/// into channels and return quickly.
pub struct AgentCallbacks {
    /// PCM16 samples at 24 kHz, already decoded from the wire.
    pub on_audio: Arc<dyn Fn(Vec<i16>) + Send + Sync>,
    pub on_text: Arc<dyn Fn(Role, String) + Send + Sync>,
    pub on_tool_use: Arc<dyn Fn(ToolUseRequest) + Send + Sync>,
    /// Fires on completion end with the user text accumulated this turn.
    pub on_turn_complete: Arc<dyn Fn(String) + Send + Sync>,
    /// The user barged in while the model was speaking.
    pub on_interruption: Arc<dyn Fn() + Send + Sync>,
    /// The stream died or the model reported a fatal error.
    pub on_stream_error: Arc<dyn Fn(String) + Send + Sync>,
}

struct PendingToolUse {
    tool_use_id: String,
    tool_name: String,
    content: String,
}

/// Reader-side state. Separate from the session handle so the reader task
/// owns it without locking.
struct ReaderState {
    callbacks: AgentCallbacks,
    queue: Arc<EventQueue>,
    /// Content ids the model is currently speaking on.
    speaking_contents: Vec<String>,
    /// Tool-use accumulators keyed by content id, so concurrent tool calls
    /// assemble independently.
    pending_tools: HashMap<String, PendingToolUse>,
    user_turn_text: String,
}

pub struct SpeechAgentSession {
    queue: Arc<EventQueue>,
    prompt_name: String,
    audio_content_name: String,
    connected: Arc<AtomicBool>,
    writer_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    reader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SpeechAgentSession {
    /// Open the stream and emit the setup sequence:
    ///
    /// 1. session-start with inference parameters;
    /// 2. prompt-start carrying audio/text output configs and the tool set;
    /// 3. a non-interactive SYSTEM text block with the system prompt;
    /// 4. an interactive USER audio block that stays open for the call.
    pub async fn connect(
        config: &UnifiedConfig,
        tools: &[ToolSpec],
        callbacks: AgentCallbacks,
    ) -> Result<Self, AgentError> {
        let request = http::Request::builder()
            .uri(&config.ws_url)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("X-Model-Id", &config.model_id)
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host_of(&config.ws_url))
            .body(())
            .map_err(|e| AgentError::ConnectFailed(e.to_string()))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AgentError::ConnectFailed(e.to_string()))?;
        info!(model = %config.model_id, "connected to speech model");

        let (mut ws_sink, mut ws_read) = ws_stream.split();

        let queue = Arc::new(EventQueue::new());
        let prompt_name = Uuid::new_v4().to_string();
        let audio_content_name = Uuid::new_v4().to_string();
        let connected = Arc::new(AtomicBool::new(true));

        // Writer: pull from the priority queue until it closes, then walk
        // the teardown sequence in order.
        let writer_queue = queue.clone();
        let writer_connected = connected.clone();
        let teardown = [
            ClientEvent::ContentEnd {
                prompt_name: prompt_name.clone(),
                content_name: audio_content_name.clone(),
            },
            ClientEvent::PromptEnd {
                prompt_name: prompt_name.clone(),
            },
            ClientEvent::SessionEnd {},
        ];
        let writer_handle = tokio::spawn(async move {
            while let Some(event) = writer_queue.next().await {
                if let Err(e) = send_event(&mut ws_sink, event).await {
                    error!("speech stream write failed: {e}");
                    writer_connected.store(false, Ordering::SeqCst);
                    return;
                }
            }
            for event in teardown {
                if let Err(e) = send_event(&mut ws_sink, event).await {
                    debug!("teardown write failed: {e}");
                    break;
                }
            }
            let _ = ws_sink.send(Message::Close(None)).await;
            writer_connected.store(false, Ordering::SeqCst);
        });

        // Reader: parse frames, track speaking state and tool accumulation,
        // dispatch callbacks. Frames that fail to parse are dropped.
        let mut state = ReaderState {
            callbacks,
            queue: queue.clone(),
            speaking_contents: Vec::new(),
            pending_tools: HashMap::new(),
            user_turn_text: String::new(),
        };
        let reader_connected = connected.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEnvelope>(&text)
                    {
                        Ok(envelope) => handle_server_event(&mut state, envelope.event),
                        Err(e) => {
                            warn!("dropping unparseable model frame: {e}");
                        }
                    },
                    Ok(Message::Close(_)) => {
                        info!("speech stream closed by model");
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(_) => {}
                    Err(e) => {
                        (state.callbacks.on_stream_error)(e.to_string());
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        let session = Self {
            queue,
            prompt_name,
            audio_content_name,
            connected,
            writer_handle: std::sync::Mutex::new(Some(writer_handle)),
            reader_handle: std::sync::Mutex::new(Some(reader_handle)),
        };
        session.emit_setup(config, tools);
        Ok(session)
    }

    fn emit_setup(&self, config: &UnifiedConfig, tools: &[ToolSpec]) {
        self.queue.push_control(ClientEvent::SessionStart {
            inference_configuration: InferenceConfig {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                top_p: config.top_p,
            },
        });

        let tool_configuration = (!tools.is_empty()).then(|| ToolConfiguration {
            tools: tools
                .iter()
                .map(|t| ToolSpecEntry {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect(),
        });
        self.queue.push_control(ClientEvent::PromptStart {
            prompt_name: self.prompt_name.clone(),
            audio_output_configuration: AudioOutputConfig::speech(&config.voice_id),
            text_output_configuration: TextOutputConfig::default(),
            tool_configuration,
        });

        // System prompt: a closed, non-interactive text block.
        let system_content = Uuid::new_v4().to_string();
        self.queue.push_control(ClientEvent::ContentStart {
            prompt_name: self.prompt_name.clone(),
            content_name: system_content.clone(),
            kind: ContentKind::Text,
            role: Some(Role::System),
            interactive: false,
            audio_input_configuration: None,
            text_input_configuration: Some(TextOutputConfig::default()),
            tool_result_input_configuration: None,
        });
        self.queue.push_control(ClientEvent::TextInput {
            prompt_name: self.prompt_name.clone(),
            content_name: system_content.clone(),
            content: config.system_prompt.clone(),
        });
        self.queue.push_control(ClientEvent::ContentEnd {
            prompt_name: self.prompt_name.clone(),
            content_name: system_content,
        });

        // The user audio block stays open for the whole call.
        self.queue.push_control(ClientEvent::ContentStart {
            prompt_name: self.prompt_name.clone(),
            content_name: self.audio_content_name.clone(),
            kind: ContentKind::Audio,
            role: Some(Role::User),
            interactive: true,
            audio_input_configuration: Some(AudioInputConfig::speech()),
            text_input_configuration: None,
            tool_result_input_configuration: None,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Enqueue caller audio (PCM16 at 16 kHz). Buffered, and withheld from
    /// the wire while the model is speaking.
    pub fn send_audio(&self, pcm16k: &[i16]) {
        let content = BASE64.encode(audio::samples_to_pcm_bytes(pcm16k));
        self.queue.push_audio(ClientEvent::AudioInput {
            prompt_name: self.prompt_name.clone(),
            content_name: self.audio_content_name.clone(),
            content,
        });
    }

    /// Inject out-of-band text (Driver messages during a call).
    pub fn send_text(&self, text: &str, role: Role) {
        let content_name = Uuid::new_v4().to_string();
        self.queue.push_control(ClientEvent::ContentStart {
            prompt_name: self.prompt_name.clone(),
            content_name: content_name.clone(),
            kind: ContentKind::Text,
            role: Some(role),
            interactive: true,
            audio_input_configuration: None,
            text_input_configuration: Some(TextOutputConfig::default()),
            tool_result_input_configuration: None,
        });
        self.queue.push_control(ClientEvent::TextInput {
            prompt_name: self.prompt_name.clone(),
            content_name: content_name.clone(),
            content: text.to_string(),
        });
        self.queue.push_control(ClientEvent::ContentEnd {
            prompt_name: self.prompt_name.clone(),
            content_name,
        });
    }

    /// Feed a tool outcome back: content-start(TOOL) -> tool-result ->
    /// content-end, all as control events.
    pub fn send_tool_result(&self, tool_use_id: &str, result: &str) {
        let content_name = Uuid::new_v4().to_string();
        self.queue.push_control(ClientEvent::ContentStart {
            prompt_name: self.prompt_name.clone(),
            content_name: content_name.clone(),
            kind: ContentKind::Tool,
            role: Some(Role::Tool),
            interactive: false,
            audio_input_configuration: None,
            text_input_configuration: None,
            tool_result_input_configuration: Some(ToolResultInputConfig {
                tool_use_id: tool_use_id.to_string(),
                kind: ContentKind::Text,
                text_input_configuration: TextOutputConfig::default(),
            }),
        });
        self.queue.push_control(ClientEvent::ToolResult {
            prompt_name: self.prompt_name.clone(),
            content_name: content_name.clone(),
            content: result.to_string(),
        });
        self.queue.push_control(ClientEvent::ContentEnd {
            prompt_name: self.prompt_name.clone(),
            content_name,
        });
    }

    /// Ordered teardown. The queue stops accepting events and drains its
    /// control backlog; the writer then emits content-end, prompt-end and
    /// session-end. Reports disconnected after a bounded drain.
    pub async fn close(&self) {
        self.queue.close();
        let writer = self.writer_handle.lock().expect("handle lock").take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
                debug!("speech writer did not drain in time, aborting");
                writer.abort();
            }
        }
        if let Some(reader) = self.reader_handle.lock().expect("handle lock").take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

async fn send_event<S>(sink: &mut S, event: ClientEvent) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(&ClientEnvelope { event }).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Dispatch one inbound event against the reader state.
fn handle_server_event(state: &mut ReaderState, event: ServerEvent) {
    match event {
        ServerEvent::ContentStart {
            content_id,
            role,
            kind,
        } => {
            let speaking = role == Some(Role::Assistant) || kind == Some(ContentKind::Audio);
            if speaking {
                state
                    .speaking_contents
                    .push(content_id.unwrap_or_default());
                state.queue.set_model_speaking(true);
            }
        }

        ServerEvent::AudioOutput { content } => match BASE64.decode(&content) {
            Ok(bytes) => {
                (state.callbacks.on_audio)(audio::pcm_bytes_to_samples(&bytes));
            }
            Err(e) => warn!("dropping undecodable audio frame: {e}"),
        },

        ServerEvent::TextOutput { role, content } => {
            let role = role.unwrap_or(Role::Assistant);
            if role == Role::User {
                state.user_turn_text = content.clone();
            }
            (state.callbacks.on_text)(role, content);
        }

        ServerEvent::ToolUse {
            content_id,
            tool_use_id,
            tool_name,
            content,
        } => {
            let key = content_id.unwrap_or_else(|| tool_use_id.clone());
            let pending = state
                .pending_tools
                .entry(key)
                .or_insert_with(|| PendingToolUse {
                    tool_use_id,
                    tool_name,
                    content: String::new(),
                });
            if let Some(chunk) = content {
                pending.content.push_str(&chunk);
            }
        }

        ServerEvent::ContentEnd {
            content_id,
            kind,
            stop_reason,
        } => {
            if stop_reason.as_deref() == Some(STOP_REASON_INTERRUPTED) {
                debug!("model interrupted by caller");
                state.speaking_contents.clear();
                state.queue.set_model_speaking(false);
                (state.callbacks.on_interruption)();
                return;
            }

            if kind == Some(ContentKind::Tool) {
                let key = content_id.clone().unwrap_or_default();
                let pending = state
                    .pending_tools
                    .remove(&key)
                    .or_else(|| take_single_pending(&mut state.pending_tools));
                if let Some(pending) = pending {
                    let input = serde_json::from_str(&pending.content)
                        .unwrap_or(serde_json::Value::String(pending.content));
                    (state.callbacks.on_tool_use)(ToolUseRequest {
                        tool_use_id: pending.tool_use_id,
                        tool_name: pending.tool_name,
                        input,
                    });
                }
                return;
            }

            if let Some(id) = content_id {
                state.speaking_contents.retain(|c| c != &id);
            } else {
                state.speaking_contents.pop();
            }
            if state.speaking_contents.is_empty() {
                state.queue.set_model_speaking(false);
            }
        }

        ServerEvent::CompletionEnd {} => {
            let text = std::mem::take(&mut state.user_turn_text);
            (state.callbacks.on_turn_complete)(text);
        }

        ServerEvent::UsageEvent {
            total_input_tokens,
            total_output_tokens,
        } => {
            debug!(
                input = total_input_tokens.unwrap_or(0),
                output = total_output_tokens.unwrap_or(0),
                "model usage"
            );
        }

        ServerEvent::ModelStreamError { message } | ServerEvent::InternalServerError { message } => {
            let message = message.unwrap_or_else(|| "unspecified model error".into());
            error!("model reported error: {message}");
            (state.callbacks.on_stream_error)(message);
        }
    }
}

/// When the model omits content ids, a lone accumulator is unambiguous.
fn take_single_pending(pending: &mut HashMap<String, PendingToolUse>) -> Option<PendingToolUse> {
    if pending.len() == 1 {
        let key = pending.keys().next().cloned()?;
        pending.remove(&key)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured {
        audio_chunks: Mutex<Vec<Vec<i16>>>,
        texts: Mutex<Vec<(Role, String)>>,
        tool_uses: Mutex<Vec<ToolUseRequest>>,
        turns: Mutex<Vec<String>>,
        interruptions: Mutex<u32>,
    }

    fn callbacks(captured: Arc<Captured>) -> AgentCallbacks {
        let c1 = captured.clone();
        let c2 = captured.clone();
        let c3 = captured.clone();
        let c4 = captured.clone();
        let c5 = captured.clone();
        AgentCallbacks {
            on_audio: Arc::new(move |pcm| c1.audio_chunks.lock().unwrap().push(pcm)),
            on_text: Arc::new(move |role, text| c2.texts.lock().unwrap().push((role, text))),
            on_tool_use: Arc::new(move |req| c3.tool_uses.lock().unwrap().push(req)),
            on_turn_complete: Arc::new(move |text| c4.turns.lock().unwrap().push(text)),
            on_interruption: Arc::new(move || *c5.interruptions.lock().unwrap() += 1),
            on_stream_error: Arc::new(|_| {}),
        }
    }

    fn reader_state(captured: Arc<Captured>) -> ReaderState {
        ReaderState {
            callbacks: callbacks(captured),
            queue: Arc::new(EventQueue::new()),
            speaking_contents: Vec::new(),
            pending_tools: HashMap::new(),
            user_turn_text: String::new(),
        }
    }

    fn parse(frame: &str) -> ServerEvent {
        serde_json::from_str::<ServerEnvelope>(frame).unwrap().event
    }

    #[test]
    fn assistant_content_gates_audio() {
        let captured = Arc::new(Captured::default());
        let mut state = reader_state(captured);

        handle_server_event(
            &mut state,
            parse(r#"{"event":{"contentStart":{"contentId":"a1","role":"ASSISTANT","type":"AUDIO"}}}"#),
        );
        assert!(state.queue.model_speaking());

        handle_server_event(
            &mut state,
            parse(r#"{"event":{"contentEnd":{"contentId":"a1","type":"AUDIO"}}}"#),
        );
        assert!(!state.queue.model_speaking());
    }

    #[test]
    fn interruption_clears_gate_and_fires_callback() {
        let captured = Arc::new(Captured::default());
        let mut state = reader_state(captured.clone());

        handle_server_event(
            &mut state,
            parse(r#"{"event":{"contentStart":{"contentId":"a1","role":"ASSISTANT","type":"AUDIO"}}}"#),
        );
        handle_server_event(
            &mut state,
            parse(r#"{"event":{"contentEnd":{"contentId":"a1","stopReason":"INTERRUPTED"}}}"#),
        );

        assert!(!state.queue.model_speaking());
        assert_eq!(*captured.interruptions.lock().unwrap(), 1);
    }

    #[test]
    fn tool_use_accumulates_across_partial_events() {
        let captured = Arc::new(Captured::default());
        let mut state = reader_state(captured.clone());

        handle_server_event(
            &mut state,
            parse(
                r#"{"event":{"toolUse":{"contentId":"c1","toolUseId":"t1",
                    "toolName":"service_health","content":"{\"service\":"}}}"#,
            ),
        );
        handle_server_event(
            &mut state,
            parse(
                r#"{"event":{"toolUse":{"contentId":"c1","toolUseId":"t1",
                    "toolName":"service_health","content":"\"all\"}"}}}"#,
            ),
        );
        handle_server_event(
            &mut state,
            parse(r#"{"event":{"contentEnd":{"contentId":"c1","type":"TOOL"}}}"#),
        );

        let tool_uses = captured.tool_uses.lock().unwrap();
        assert_eq!(tool_uses.len(), 1);
        assert_eq!(tool_uses[0].tool_name, "service_health");
        assert_eq!(tool_uses[0].input["service"], "all");
    }

    #[test]
    fn concurrent_tool_uses_accumulate_independently() {
        let captured = Arc::new(Captured::default());
        let mut state = reader_state(captured.clone());

        handle_server_event(
            &mut state,
            parse(
                r#"{"event":{"toolUse":{"contentId":"c1","toolUseId":"t1",
                    "toolName":"alpha","content":"{\"a\":1}"}}}"#,
            ),
        );
        handle_server_event(
            &mut state,
            parse(
                r#"{"event":{"toolUse":{"contentId":"c2","toolUseId":"t2",
                    "toolName":"beta","content":"{\"b\":2}"}}}"#,
            ),
        );
        handle_server_event(
            &mut state,
            parse(r#"{"event":{"contentEnd":{"contentId":"c2","type":"TOOL"}}}"#),
        );
        handle_server_event(
            &mut state,
            parse(r#"{"event":{"contentEnd":{"contentId":"c1","type":"TOOL"}}}"#),
        );

        let tool_uses = captured.tool_uses.lock().unwrap();
        assert_eq!(tool_uses.len(), 2);
        assert_eq!(tool_uses[0].tool_name, "beta");
        assert_eq!(tool_uses[1].tool_name, "alpha");
    }

    #[test]
    fn unparseable_tool_input_falls_back_to_raw_string() {
        let captured = Arc::new(Captured::default());
        let mut state = reader_state(captured.clone());

        handle_server_event(
            &mut state,
            parse(
                r#"{"event":{"toolUse":{"contentId":"c1","toolUseId":"t1",
                    "toolName":"alpha","content":"not json"}}}"#,
            ),
        );
        handle_server_event(
            &mut state,
            parse(r#"{"event":{"contentEnd":{"contentId":"c1","type":"TOOL"}}}"#),
        );

        let tool_uses = captured.tool_uses.lock().unwrap();
        assert_eq!(tool_uses[0].input, serde_json::json!("not json"));
    }

    #[test]
    fn completion_end_reports_accumulated_user_text() {
        let captured = Arc::new(Captured::default());
        let mut state = reader_state(captured.clone());

        handle_server_event(
            &mut state,
            parse(r#"{"event":{"textOutput":{"role":"USER","content":"All good"}}}"#),
        );
        handle_server_event(&mut state, parse(r#"{"event":{"completionEnd":{}}}"#));

        assert_eq!(captured.turns.lock().unwrap().as_slice(), ["All good"]);
        // A second completion without new text yields an empty turn.
        handle_server_event(&mut state, parse(r#"{"event":{"completionEnd":{}}}"#));
        assert_eq!(captured.turns.lock().unwrap().len(), 2);
        assert!(captured.turns.lock().unwrap()[1].is_empty());
    }

    #[test]
    fn audio_output_is_decoded_to_samples() {
        let captured = Arc::new(Captured::default());
        let mut state = reader_state(captured.clone());

        let samples: Vec<i16> = vec![0, 1000, -1000, 42];
        let encoded = BASE64.encode(audio::samples_to_pcm_bytes(&samples));
        handle_server_event(
            &mut state,
            parse(&format!(
                r#"{{"event":{{"audioOutput":{{"content":"{encoded}"}}}}}}"#
            )),
        );

        assert_eq!(captured.audio_chunks.lock().unwrap()[0], samples);
    }
}
