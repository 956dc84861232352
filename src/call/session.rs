//! Per-call session: the state machine that correlates Driver commands,
//! carrier events, and the conversational backend.
//!
//! A session owns the media egress queue (one writer task per call), the
//! speech-agent stream or the split pipeline, the transcript, and the
//! pending turn-completion slot. Driver commands against one session are
//! serialized by the manager through `cmd_lock`; carrier webhooks and
//! media frames arrive on their own tasks and communicate through watch
//! channels and the egress queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::media::{self, EgressControl, EgressQueue, InboundFrame};
use crate::audio;
use crate::carrier::{CarrierEvent, CarrierPort};
use crate::config::{BridgeConfig, VoiceBackend};
use crate::errors::{AgentError, BridgeError, HangupError, MediaError, TimeoutError};
use crate::pipeline::{
    LlmBrain, PlaybackBuffer, RetryDecision, RetryPolicy, SttClient, StopReason, TtsClient,
    UtteranceDetector,
};
use crate::speech::session::{AgentCallbacks, SpeechAgentSession, ToolUseRequest};
use crate::speech::Role;
use crate::tools::ToolRegistry;

/// Bounded drain before hangup, unified mode.
const DRAIN_UNIFIED: Duration = Duration::from_secs(3);
/// Bounded drain before hangup, split mode.
const DRAIN_SPLIT: Duration = Duration::from_secs(2);
/// Hang-up poll granularity inside turn waits.
const HANGUP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    New,
    Placing,
    Ringing,
    ConnectingMedia,
    Ready,
    SpeakingAgent,
    ListeningUser,
    ToolCall,
    Ending,
    Ended,
    Failed,
}

impl CallState {
    /// READY or a substate of it: the only states Driver commands other
    /// than `initiate` are legal in.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            CallState::Ready
                | CallState::SpeakingAgent
                | CallState::ListeningUser
                | CallState::ToolCall
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Agent,
    User,
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: SystemTime,
}

/// Notifications from the speech-agent reader into the session pump.
enum AgentNotice {
    Audio(Vec<i16>),
    Text { role: Role, content: String },
    ToolUse(ToolUseRequest),
    TurnComplete(String),
    Interrupted,
    StreamError(String),
}

struct SplitRuntime {
    stt: Arc<SttClient>,
    brain: Option<Arc<LlmBrain>>,
    tts: Arc<TtsClient>,
    utterance_tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

pub struct CallSession {
    pub call_id: String,
    pub user_number: String,
    pub caller_number: String,
    pub ws_token: String,

    config: Arc<BridgeConfig>,
    carrier: Arc<dyn CarrierPort>,
    tools: Arc<ToolRegistry>,
    http: reqwest::Client,

    state_tx: watch::Sender<CallState>,
    hung_up_tx: watch::Sender<bool>,
    call_ref: OnceLock<String>,
    stream_sid_tx: watch::Sender<Option<String>>,
    stream_ready_tx: watch::Sender<bool>,
    /// Set once by the first successful media upgrade; a second upgrade
    /// against the same token is rejected.
    media_claimed: AtomicBool,
    /// The connect directive is served at most once per call.
    directive_served: AtomicBool,

    egress: Arc<EgressQueue>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    turn_tx: Mutex<Option<oneshot::Sender<String>>>,
    agent: Mutex<Option<Arc<SpeechAgentSession>>>,
    split: Mutex<Option<Arc<SplitRuntime>>>,
    /// Serializes spoken output so two TTS streams never interleave.
    speak_lock: tokio::sync::Mutex<()>,
    /// Serializes Driver commands for this call (held by the manager).
    pub(crate) cmd_lock: tokio::sync::Mutex<()>,

    pub started_at: SystemTime,
    ended_at: Mutex<Option<SystemTime>>,
}

impl CallSession {
    pub fn new(
        config: Arc<BridgeConfig>,
        carrier: Arc<dyn CarrierPort>,
        tools: Arc<ToolRegistry>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            call_id: Uuid::new_v4().to_string(),
            user_number: config.user_number.clone(),
            caller_number: config.from_number.clone(),
            ws_token: crate::auth::new_ws_token(),
            config,
            carrier,
            tools,
            http,
            state_tx: watch::Sender::new(CallState::New),
            hung_up_tx: watch::Sender::new(false),
            call_ref: OnceLock::new(),
            stream_sid_tx: watch::Sender::new(None),
            stream_ready_tx: watch::Sender::new(false),
            media_claimed: AtomicBool::new(false),
            directive_served: AtomicBool::new(false),
            egress: Arc::new(EgressQueue::new()),
            transcript: Mutex::new(Vec::new()),
            turn_tx: Mutex::new(None),
            agent: Mutex::new(None),
            split: Mutex::new(None),
            speak_lock: tokio::sync::Mutex::new(()),
            cmd_lock: tokio::sync::Mutex::new(()),
            started_at: SystemTime::now(),
            ended_at: Mutex::new(None),
        })
    }

    pub fn state(&self) -> CallState {
        *self.state_tx.borrow()
    }

    pub fn hung_up(&self) -> bool {
        *self.hung_up_tx.borrow()
    }

    pub fn call_ref(&self) -> Option<&str> {
        self.call_ref.get().map(String::as_str)
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().expect("transcript lock").clone()
    }

    fn set_state(&self, state: CallState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            debug!(call_id = %self.call_id, ?previous, ?state, "call state");
            self.state_tx.send_replace(state);
        }
    }

    fn record(&self, speaker: Speaker, text: &str) {
        if text.is_empty() {
            return;
        }
        self.transcript
            .lock()
            .expect("transcript lock")
            .push(TranscriptEntry {
                speaker,
                text: text.to_string(),
                at: SystemTime::now(),
            });
    }

    // =========================================================================
    // Driver operations (invoked through the manager, under cmd_lock)
    // =========================================================================

    /// Place the outbound leg. Returns the carrier call reference so the
    /// manager can index it before any webhook can arrive.
    pub async fn place(&self) -> Result<String, BridgeError> {
        self.set_state(CallState::Placing);
        let call_ref = self
            .carrier
            .place_outbound(
                &self.user_number,
                &self.caller_number,
                &self.config.webhook_url(),
            )
            .await?;
        self.call_ref
            .set(call_ref.clone())
            .expect("call ref is set exactly once");
        info!(call_id = %self.call_id, call_ref = %call_ref, "outbound call placed");
        Ok(call_ref)
    }

    /// Wait for media, open the backend, deliver the opening message, and
    /// return the user's first reply.
    pub async fn complete_start(self: &Arc<Self>, initial_message: &str) -> Result<String, BridgeError> {
        self.wait_media_ready().await?;

        match self.config.backend {
            VoiceBackend::Unified => self.connect_unified().await?,
            VoiceBackend::SplitBrain | VoiceBackend::SplitSttTts => self.connect_split()?,
        }
        self.set_state(CallState::Ready);

        self.deliver(initial_message).await?;
        self.wait_for_user_turn(self.config.turn_timeout).await
    }

    /// Inject a Driver message into the conversation and wait for the
    /// user's next turn.
    pub async fn inject(self: &Arc<Self>, message: &str) -> Result<String, BridgeError> {
        self.ensure_ready()?;
        self.deliver(message).await?;
        self.wait_for_user_turn(self.config.turn_timeout).await
    }

    /// Fire-and-forget delivery; does not wait for a reply.
    pub fn speak(self: &Arc<Self>, message: &str) -> Result<(), BridgeError> {
        self.ensure_ready()?;
        let session = self.clone();
        let message = message.to_string();
        tokio::spawn(async move {
            if let Err(e) = session.deliver(&message).await {
                warn!(call_id = %session.call_id, "speak failed: {e}");
            }
        });
        Ok(())
    }

    /// Deliver a closing message, drain, hang up, and free resources.
    pub async fn end(self: &Arc<Self>, message: &str) -> Result<(), BridgeError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        if !message.is_empty() && self.state().is_ready() {
            if let Err(e) = self.deliver(message).await {
                warn!(call_id = %self.call_id, "closing message failed: {e}");
            }
        }
        self.set_state(CallState::Ending);

        let drain = if self.config.backend == VoiceBackend::Unified {
            DRAIN_UNIFIED
        } else {
            DRAIN_SPLIT
        };
        self.egress.wait_idle(drain).await;

        if let Some(call_ref) = self.call_ref() {
            if !self.hung_up() {
                if let Err(e) = self.carrier.hangup(call_ref).await {
                    warn!(call_id = %self.call_id, "carrier hangup failed: {e}");
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), BridgeError> {
        if self.hung_up() {
            return Err(HangupError.into());
        }
        if !self.state().is_ready() {
            return Err(MediaError::NotReady.into());
        }
        Ok(())
    }

    // =========================================================================
    // Turn waiting
    // =========================================================================

    /// Resolve on the next completed user turn. Polls for hang-up at
    /// 100 ms granularity and rejects with `HangupError`.
    pub async fn wait_for_user_turn(&self, timeout: Duration) -> Result<String, BridgeError> {
        let (tx, mut rx) = oneshot::channel();
        *self.turn_tx.lock().expect("turn lock") = Some(tx);
        self.set_state(CallState::ListeningUser);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(HANGUP_POLL);

        loop {
            tokio::select! {
                result = &mut rx => {
                    return match result {
                        Ok(text) => {
                            if self.state() == CallState::ListeningUser {
                                self.set_state(CallState::Ready);
                            }
                            Ok(text)
                        }
                        // Sender dropped: the session shut down underneath us.
                        Err(_) => Err(HangupError.into()),
                    };
                }
                _ = &mut deadline => {
                    self.turn_tx.lock().expect("turn lock").take();
                    return Err(TimeoutError::new("user turn").into());
                }
                _ = poll.tick() => {
                    if self.hung_up() {
                        self.turn_tx.lock().expect("turn lock").take();
                        return Err(HangupError.into());
                    }
                }
            }
        }
    }

    /// Hand the accumulated user text to whoever is waiting on this turn.
    fn resolve_turn(&self, text: &str) {
        if let Some(tx) = self.turn_tx.lock().expect("turn lock").take() {
            let _ = tx.send(text.to_string());
        }
    }

    // =========================================================================
    // Media plumbing
    // =========================================================================

    /// Claim the single media upgrade allowed for this session.
    pub fn try_claim_media(&self) -> bool {
        !self.media_claimed.swap(true, Ordering::SeqCst)
    }

    /// Claim the single connect-directive response for this session.
    pub fn try_claim_directive(&self) -> bool {
        !self.directive_served.swap(true, Ordering::SeqCst)
    }

    /// Bind the carrier's media WebSocket: spawn the writer task and the
    /// inbound reader. Called at most once, from the upgrade handler.
    pub fn bind_media_socket(self: &Arc<Self>, socket: axum::extract::ws::WebSocket) {
        info!(call_id = %self.call_id, "media socket connected");
        if !self.state().is_ready() && !self.state().is_terminal() {
            self.set_state(CallState::ConnectingMedia);
        }

        let (mut sink, mut stream) = socket.split();

        // Writer: wait for the carrier's stream id, then pace egress.
        let writer_session = self.clone();
        tokio::spawn(async move {
            let mut sid_rx = writer_session.stream_sid_tx.subscribe();
            let stream_sid = loop {
                if let Some(sid) = sid_rx.borrow().clone() {
                    break sid;
                }
                if sid_rx.changed().await.is_err() {
                    return;
                }
            };
            media::run_writer(&writer_session.egress, &stream_sid, &mut sink).await;
        });

        // Reader: start frame, inbound audio, stop.
        let reader_session = self.clone();
        tokio::spawn(async move {
            let mut vad = UtteranceDetector::new(reader_session.config.vad.clone());
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(axum::extract::ws::Message::Text(text)) => text,
                    Ok(axum::extract::ws::Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("dropping unparseable media frame: {e}");
                        continue;
                    }
                };
                match frame.event.as_str() {
                    "start" => {
                        if let Some(start) = frame.start {
                            info!(call_id = %reader_session.call_id,
                                  stream_sid = %start.stream_sid, "media stream started");
                            reader_session
                                .stream_sid_tx
                                .send_replace(Some(start.stream_sid));
                            reader_session.stream_ready_tx.send_replace(true);
                        }
                    }
                    "media" => {
                        if let Some(mulaw) = frame.inbound_payload() {
                            reader_session.on_inbound_audio(&mulaw, &mut vad);
                        }
                    }
                    "stop" => {
                        debug!(call_id = %reader_session.call_id, "media stream stopped");
                        break;
                    }
                    other => {
                        debug!(event = other, "ignoring media frame");
                    }
                }
            }
            // Socket gone. If the call was still live, that is a hangup.
            if !reader_session.state().is_terminal() && reader_session.state() != CallState::Ending
            {
                warn!(call_id = %reader_session.call_id, "{}", MediaError::SocketClosed);
                reader_session.mark_hung_up();
            }
        });
    }

    fn on_inbound_audio(&self, mulaw: &[u8], vad: &mut UtteranceDetector) {
        match self.config.backend {
            VoiceBackend::Unified => {
                let agent = self.agent.lock().expect("agent lock").clone();
                if let Some(agent) = agent {
                    let narrow = audio::mulaw_decode_buf(mulaw);
                    let wide = audio::upsample_8k_to_16k(&narrow);
                    agent.send_audio(&wide);
                }
            }
            VoiceBackend::SplitBrain | VoiceBackend::SplitSttTts => {
                if let Some(utterance) = vad.push(mulaw) {
                    let runtime = self.split.lock().expect("split lock").clone();
                    if let Some(runtime) = runtime {
                        let _ = runtime.utterance_tx.send(utterance);
                    }
                }
            }
        }
    }

    /// Wait until the socket is bound, the stream id is known, and the
    /// carrier acknowledged streaming.
    async fn wait_media_ready(&self) -> Result<(), BridgeError> {
        let timeout = self.config.media_ready_timeout;
        let wait = async {
            let mut ready_rx = self.stream_ready_tx.subscribe();
            loop {
                if self.hung_up() {
                    return Err(BridgeError::from(HangupError));
                }
                if *ready_rx.borrow() && self.stream_sid_tx.borrow().is_some() {
                    return Ok(());
                }
                tokio::select! {
                    changed = ready_rx.changed() => {
                        if changed.is_err() {
                            return Err(BridgeError::from(HangupError));
                        }
                    }
                    _ = tokio::time::sleep(HANGUP_POLL) => {}
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(TimeoutError::new("media stream").into()),
        }
    }

    // =========================================================================
    // Carrier events
    // =========================================================================

    /// React to a parsed carrier webhook for this call.
    pub fn handle_carrier_event(self: &Arc<Self>, event: CarrierEvent) {
        match event {
            CarrierEvent::Placed => {}
            CarrierEvent::Ringing => {
                if self.state() == CallState::Placing {
                    self.set_state(CallState::Ringing);
                }
            }
            CarrierEvent::Answered => {
                if matches!(self.state(), CallState::Placing | CallState::Ringing) {
                    self.set_state(CallState::ConnectingMedia);
                }
                // Telnyx needs an explicit action to open the stream.
                let session = self.clone();
                tokio::spawn(async move {
                    if let Some(call_ref) = session.call_ref() {
                        let ws_url = session.config.media_ws_url(&session.ws_token);
                        if let Err(e) = session.carrier.start_media_stream(call_ref, &ws_url).await
                        {
                            warn!(call_id = %session.call_id, "start_media_stream failed: {e}");
                        }
                    }
                });
            }
            CarrierEvent::StreamReady => {
                self.stream_ready_tx.send_replace(true);
            }
            CarrierEvent::StreamStopped => {
                debug!(call_id = %self.call_id, "carrier reports streaming stopped");
            }
            CarrierEvent::MachineDetection { result } => {
                info!(call_id = %self.call_id, result = %result, "machine detection verdict");
            }
            CarrierEvent::HungUp => self.mark_hung_up(),
        }
    }

    /// The remote side is gone: cancel waits, free resources.
    pub fn mark_hung_up(self: &Arc<Self>) {
        if self.hung_up_tx.send_replace(true) {
            return; // already marked
        }
        info!(call_id = %self.call_id, "call hung up");
        let session = self.clone();
        tokio::spawn(async move {
            session.shutdown().await;
        });
    }

    /// Close the backend, the egress queue, and every pending wait.
    pub async fn shutdown(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(CallState::Ending);

        let agent = self.agent.lock().expect("agent lock").take();
        if let Some(agent) = agent {
            agent.close().await;
        }
        let split = self.split.lock().expect("split lock").take();
        if let Some(split) = split {
            for task in split.tasks.lock().expect("tasks lock").drain(..) {
                task.abort();
            }
        }

        self.egress.close();
        // Dropping the sender rejects any in-flight turn wait.
        self.turn_tx.lock().expect("turn lock").take();
        self.hung_up_tx.send_replace(true);
        *self.ended_at.lock().expect("ended lock") = Some(SystemTime::now());
        self.set_state(CallState::Ended);
    }

    /// Mark the session failed before it ever became ready.
    pub async fn fail(&self) {
        self.set_state(CallState::Failed);
        self.egress.close();
        self.turn_tx.lock().expect("turn lock").take();
        self.hung_up_tx.send_replace(true);
    }

    // =========================================================================
    // Unified backend
    // =========================================================================

    async fn connect_unified(self: &Arc<Self>) -> Result<(), BridgeError> {
        let config = self
            .config
            .unified
            .as_ref()
            .expect("unified backend requires unified config");

        let (tx, rx) = mpsc::unbounded_channel();
        let callbacks = {
            let audio_tx = tx.clone();
            let text_tx = tx.clone();
            let tool_tx = tx.clone();
            let turn_tx = tx.clone();
            let int_tx = tx.clone();
            let err_tx = tx;
            AgentCallbacks {
                on_audio: Arc::new(move |pcm| {
                    let _ = audio_tx.send(AgentNotice::Audio(pcm));
                }),
                on_text: Arc::new(move |role, content| {
                    let _ = text_tx.send(AgentNotice::Text { role, content });
                }),
                on_tool_use: Arc::new(move |request| {
                    let _ = tool_tx.send(AgentNotice::ToolUse(request));
                }),
                on_turn_complete: Arc::new(move |text| {
                    let _ = turn_tx.send(AgentNotice::TurnComplete(text));
                }),
                on_interruption: Arc::new(move || {
                    let _ = int_tx.send(AgentNotice::Interrupted);
                }),
                on_stream_error: Arc::new(move |message| {
                    let _ = err_tx.send(AgentNotice::StreamError(message));
                }),
            }
        };

        let agent = SpeechAgentSession::connect(config, self.tools.specs(), callbacks).await?;
        *self.agent.lock().expect("agent lock") = Some(Arc::new(agent));

        let session = self.clone();
        tokio::spawn(async move {
            session.pump_agent_notices(rx).await;
        });
        Ok(())
    }

    /// Translate agent callbacks into media frames, transcript entries,
    /// tool executions, and turn completions.
    async fn pump_agent_notices(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<AgentNotice>) {
        let mut chunker: Vec<u8> = Vec::new();
        while let Some(notice) = rx.recv().await {
            match notice {
                AgentNotice::Audio(pcm24) => {
                    if self.state() == CallState::ListeningUser {
                        self.set_state(CallState::SpeakingAgent);
                    }
                    let narrow = audio::downsample_24k_to_8k(&pcm24);
                    chunker.extend(audio::mulaw_encode_buf(&narrow));
                    while chunker.len() >= audio::FRAME_BYTES {
                        let rest = chunker.split_off(audio::FRAME_BYTES);
                        self.egress.push_audio(std::mem::replace(&mut chunker, rest));
                    }
                }
                AgentNotice::Text { role, content } => {
                    let speaker = match role {
                        Role::User => Speaker::User,
                        _ => Speaker::Agent,
                    };
                    self.record(speaker, &content);
                }
                AgentNotice::ToolUse(request) => {
                    self.set_state(CallState::ToolCall);
                    let session = self.clone();
                    tokio::spawn(async move {
                        let outcome = session
                            .tools
                            .run(&request.tool_name, request.input.clone())
                            .await;
                        let agent = session.agent.lock().expect("agent lock").clone();
                        if let Some(agent) = agent {
                            agent.send_tool_result(&request.tool_use_id, &outcome.output);
                        }
                        if session.state() == CallState::ToolCall {
                            session.set_state(CallState::Ready);
                        }
                    });
                }
                AgentNotice::TurnComplete(text) => {
                    if !text.is_empty() {
                        self.resolve_turn(&text);
                    }
                    if self.state() == CallState::SpeakingAgent {
                        self.set_state(CallState::Ready);
                    }
                }
                AgentNotice::Interrupted => {
                    // Barge-in: stop queued audio and tell the carrier to
                    // flush what it already has.
                    chunker.clear();
                    self.egress.clear_audio();
                    self.egress.push_control(EgressControl::Clear);
                }
                AgentNotice::StreamError(message) => {
                    error!(call_id = %self.call_id, "agent stream failed: {message}");
                    self.mark_hung_up();
                    break;
                }
            }
        }
        // Teardown: flush any sub-frame tail.
        if !chunker.is_empty() {
            self.egress.push_audio(chunker);
        }
    }

    // =========================================================================
    // Split backend
    // =========================================================================

    fn connect_split(self: &Arc<Self>) -> Result<(), BridgeError> {
        let stt_config = self
            .config
            .stt
            .clone()
            .expect("split backend requires STT config");
        let tts_config = self
            .config
            .tts
            .clone()
            .expect("split backend requires TTS config");

        let brain = self.config.brain.clone().map(|brain_config| {
            Arc::new(LlmBrain::new(
                brain_config,
                self.http.clone(),
                self.tools.specs().to_vec(),
            ))
        });

        let (utterance_tx, mut utterance_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (transcript_tx, mut transcript_rx) = mpsc::unbounded_channel::<String>();

        let runtime = Arc::new(SplitRuntime {
            stt: Arc::new(SttClient::new(stt_config, self.http.clone())),
            brain,
            tts: Arc::new(TtsClient::new(tts_config, self.http.clone())),
            utterance_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // Transcriber: utterance bytes -> text -> turn resolution.
        let transcriber = {
            let session = self.clone();
            let runtime = runtime.clone();
            tokio::spawn(async move {
                while let Some(utterance) = utterance_rx.recv().await {
                    match runtime.stt.transcribe(&utterance).await {
                        Ok(Some(text)) => {
                            info!(call_id = %session.call_id, "user said: {text}");
                            session.record(Speaker::User, &text);
                            session.resolve_turn(&text);
                            let _ = transcript_tx.send(text);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(call_id = %session.call_id, "transcription failed: {e}"),
                    }
                }
            })
        };
        runtime.tasks.lock().expect("tasks lock").push(transcriber);

        // Conversation loop: listen -> brain -> speak, with retries.
        if runtime.brain.is_some() {
            let session = self.clone();
            let loop_runtime = runtime.clone();
            let conversation = tokio::spawn(async move {
                session.run_conversation_loop(loop_runtime, &mut transcript_rx).await;
            });
            runtime.tasks.lock().expect("tasks lock").push(conversation);
        }

        *self.split.lock().expect("split lock") = Some(runtime);
        Ok(())
    }

    async fn run_conversation_loop(
        self: &Arc<Self>,
        runtime: Arc<SplitRuntime>,
        transcript_rx: &mut mpsc::UnboundedReceiver<String>,
    ) {
        let policy = RetryPolicy::default();
        while let Some(user_text) = transcript_rx.recv().await {
            if self.hung_up() {
                break;
            }
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match self.brain_turn(&runtime, &user_text).await {
                    Ok(reply) => {
                        if let Err(e) = self.speak_split(&runtime, &reply).await {
                            warn!(call_id = %self.call_id, "tts failed: {e}");
                        }
                        break;
                    }
                    Err(e) => match policy.classify(&e, attempt) {
                        RetryDecision::Retry(delay) => {
                            warn!(call_id = %self.call_id, "brain turn failed, retrying: {e}");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::End => {
                            error!(call_id = %self.call_id, "conversation loop ending: {e}");
                            self.mark_hung_up();
                            return;
                        }
                    },
                }
            }
        }
    }

    /// One full brain turn: respond, then loop tool execution until the
    /// model stops asking.
    async fn brain_turn(
        &self,
        runtime: &SplitRuntime,
        user_text: &str,
    ) -> Result<String, AgentError> {
        let brain = runtime.brain.as_ref().expect("brain turn without brain");
        let mut response = brain.respond(user_text).await?;
        response = self.drive_tool_loop(brain, response).await?;
        Ok(response.text)
    }

    async fn drive_tool_loop(
        &self,
        brain: &LlmBrain,
        mut response: crate::pipeline::BrainResponse,
    ) -> Result<crate::pipeline::BrainResponse, AgentError> {
        while response.stop_reason == StopReason::ToolUse && !response.tool_uses.is_empty() {
            self.set_state(CallState::ToolCall);
            let results = futures_util::future::join_all(response.tool_uses.iter().map(
                |tool_use| async {
                    let outcome = self.tools.run(&tool_use.name, tool_use.input.clone()).await;
                    (outcome.output, outcome.is_error)
                },
            ))
            .await;
            response = brain.handle_tool_results(&response.tool_uses, &results).await?;
        }
        if self.state() == CallState::ToolCall {
            self.set_state(CallState::Ready);
        }
        Ok(response)
    }

    /// Stream TTS for `text` into paced 20 ms carrier frames.
    async fn speak_split(&self, runtime: &SplitRuntime, text: &str) -> Result<(), AgentError> {
        if text.is_empty() {
            return Ok(());
        }
        let _guard = self.speak_lock.lock().await;
        self.record(Speaker::Agent, text);
        if self.state().is_ready() {
            self.set_state(CallState::SpeakingAgent);
        }

        let mut stream = runtime.tts.stream(text).await?;
        let mut buffer = PlaybackBuffer::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AgentError::StreamError(e.to_string()))?;
            for frame in buffer.push_pcm(&chunk) {
                self.egress.push_audio(frame);
            }
            if self.hung_up() {
                break;
            }
        }
        for frame in buffer.flush() {
            self.egress.push_audio(frame);
        }

        if self.state() == CallState::SpeakingAgent {
            self.set_state(CallState::Ready);
        }
        Ok(())
    }

    // =========================================================================
    // Message delivery (both backends)
    // =========================================================================

    /// Put a Driver message into the conversation so it is spoken to the
    /// user.
    async fn deliver(self: &Arc<Self>, message: &str) -> Result<(), BridgeError> {
        if message.is_empty() {
            return Ok(());
        }
        match self.config.backend {
            VoiceBackend::Unified => {
                let agent = self.agent.lock().expect("agent lock").clone();
                let agent = agent.ok_or(AgentError::ConnectFailed("agent not connected".into()))?;
                agent.send_text(message, Role::User);
                Ok(())
            }
            VoiceBackend::SplitBrain => {
                let runtime = self
                    .split
                    .lock()
                    .expect("split lock")
                    .clone()
                    .ok_or(AgentError::ConnectFailed("pipeline not running".into()))?;
                let brain = runtime.brain.as_ref().expect("split-brain has a brain");
                let response = brain.inject_context(message).await?;
                let response = self.drive_tool_loop(brain, response).await?;
                self.speak_split(&runtime, &response.text).await?;
                Ok(())
            }
            VoiceBackend::SplitSttTts => {
                let runtime = self
                    .split
                    .lock()
                    .expect("split lock")
                    .clone()
                    .ok_or(AgentError::ConnectFailed("pipeline not running".into()))?;
                self.speak_split(&runtime, message).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::MediaConnectDirective;
    use crate::errors::CarrierError;
    use async_trait::async_trait;

    struct FakeCarrier;

    #[async_trait]
    impl CarrierPort for FakeCarrier {
        async fn place_outbound(
            &self,
            _to: &str,
            _from: &str,
            _webhook_url: &str,
        ) -> Result<String, CarrierError> {
            Ok("CAfake".into())
        }
        async fn start_media_stream(
            &self,
            _call_ref: &str,
            _ws_url: &str,
        ) -> Result<(), CarrierError> {
            Ok(())
        }
        async fn hangup(&self, _call_ref: &str) -> Result<(), CarrierError> {
            Ok(())
        }
        fn media_connect_directive(&self, _ws_url: &str) -> MediaConnectDirective {
            MediaConnectDirective {
                content_type: "text/xml",
                body: String::new(),
            }
        }
    }

    fn session() -> Arc<CallSession> {
        CallSession::new(
            Arc::new(crate::config::test_config()),
            Arc::new(FakeCarrier),
            Arc::new(ToolRegistry::empty()),
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn place_records_call_ref_and_state() {
        let session = session();
        assert_eq!(session.state(), CallState::New);
        let call_ref = session.place().await.unwrap();
        assert_eq!(call_ref, "CAfake");
        assert_eq!(session.call_ref(), Some("CAfake"));
        assert_eq!(session.state(), CallState::Placing);
    }

    #[tokio::test]
    async fn carrier_events_advance_the_state_machine() {
        let session = session();
        session.place().await.unwrap();

        session.handle_carrier_event(CarrierEvent::Ringing);
        assert_eq!(session.state(), CallState::Ringing);

        session.handle_carrier_event(CarrierEvent::Answered);
        assert_eq!(session.state(), CallState::ConnectingMedia);

        session.handle_carrier_event(CarrierEvent::StreamReady);
        assert!(*session.stream_ready_tx.borrow());
    }

    #[tokio::test]
    async fn hangup_event_ends_the_session() {
        let session = session();
        session.place().await.unwrap();
        session.handle_carrier_event(CarrierEvent::HungUp);
        assert!(session.hung_up());
        // Shutdown runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.state().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn turn_wait_rejects_on_hangup_within_poll_granularity() {
        let session = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_user_turn(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.clone().mark_hung_up();

        let started = tokio::time::Instant::now();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Hangup(_))));
        assert!(started.elapsed() <= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn turn_wait_times_out() {
        let session = session();
        let result = session.wait_for_user_turn(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
    }

    #[tokio::test]
    async fn turn_wait_resolves_with_user_text() {
        let session = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_user_turn(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.resolve_turn("All good");
        assert_eq!(waiter.await.unwrap().unwrap(), "All good");
    }

    #[tokio::test(start_paused = true)]
    async fn media_readiness_times_out() {
        let session = session();
        let result = session.wait_media_ready().await;
        assert!(matches!(result, Err(BridgeError::Timeout(t)) if t.what == "media stream"));
    }

    #[tokio::test]
    async fn media_readiness_requires_sid_and_ack() {
        let session = session();
        session.stream_ready_tx.send_replace(true);
        // Still missing the stream id.
        let pending =
            tokio::time::timeout(Duration::from_millis(50), session.wait_media_ready()).await;
        assert!(pending.is_err());

        session.stream_sid_tx.send_replace(Some("MZ1".into()));
        tokio::time::timeout(Duration::from_secs(1), session.wait_media_ready())
            .await
            .expect("ready now")
            .unwrap();
    }

    #[tokio::test]
    async fn media_claim_is_single_use() {
        let session = session();
        assert!(session.try_claim_media());
        assert!(!session.try_claim_media());
    }

    #[tokio::test]
    async fn driver_ops_fail_outside_ready() {
        let session = session();
        assert!(session.clone().speak("hello").is_err());
        assert!(session.inject("hello").await.is_err());
    }

    #[tokio::test]
    async fn end_is_idempotent_once_terminal() {
        let session = session();
        session.shutdown().await;
        assert_eq!(session.state(), CallState::Ended);
        session.end("bye").await.unwrap();
        assert_eq!(session.state(), CallState::Ended);
    }

    #[test]
    fn ready_substates() {
        for state in [
            CallState::Ready,
            CallState::SpeakingAgent,
            CallState::ListeningUser,
            CallState::ToolCall,
        ] {
            assert!(state.is_ready());
        }
        for state in [
            CallState::New,
            CallState::Placing,
            CallState::Ending,
            CallState::Ended,
            CallState::Failed,
        ] {
            assert!(!state.is_ready());
        }
    }
}
