//! Process-wide call registry and event router.
//!
//! The manager owns the active-sessions map and the two lookup indexes
//! (`carrier call ref -> call id`, `ws token -> call id`). All three live
//! under one lock with short critical sections; no lock is held across
//! network I/O. Driver RPC handlers, webhook routing, and the media
//! upgrade all come through here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use super::session::CallSession;
use crate::carrier::{CarrierEvent, CarrierPort, WebhookEvent};
use crate::config::BridgeConfig;
use crate::errors::BridgeError;
use crate::tools::ToolRegistry;

/// Grace period for ending every call on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<CallSession>>,
    by_call_ref: HashMap<String, String>,
    by_token: HashMap<String, String>,
    /// Call ids in creation order, newest last. Backs the tunneled-mode
    /// untokenized-upgrade fallback.
    order: Vec<String>,
}

pub struct CallManager {
    registry: Mutex<Registry>,
    config: Arc<BridgeConfig>,
    carrier: Arc<dyn CarrierPort>,
    tools: Arc<ToolRegistry>,
    http: reqwest::Client,
}

/// Result of a successful `initiate_call`.
#[derive(Debug, Clone)]
pub struct InitiateResult {
    pub call_id: String,
    pub response: String,
}

impl CallManager {
    pub fn new(
        config: Arc<BridgeConfig>,
        carrier: Arc<dyn CarrierPort>,
        tools: Arc<ToolRegistry>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            config,
            carrier,
            tools,
            http,
        })
    }

    pub fn carrier(&self) -> &Arc<dyn CarrierPort> {
        &self.carrier
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().expect("registry lock").sessions.len()
    }

    pub fn session(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.registry
            .lock()
            .expect("registry lock")
            .sessions
            .get(call_id)
            .cloned()
    }

    pub fn session_by_call_ref(&self, call_ref: &str) -> Option<Arc<CallSession>> {
        let registry = self.registry.lock().expect("registry lock");
        let call_id = registry.by_call_ref.get(call_ref)?;
        registry.sessions.get(call_id).cloned()
    }

    pub fn session_by_token(&self, token: &str) -> Option<Arc<CallSession>> {
        let registry = self.registry.lock().expect("registry lock");
        let call_id = registry.by_token.get(token)?;
        registry.sessions.get(call_id).cloned()
    }

    /// Most recently created session still registered. Best-effort target
    /// for untokenized upgrades in tunneled deployments.
    pub fn latest_session(&self) -> Option<Arc<CallSession>> {
        let registry = self.registry.lock().expect("registry lock");
        registry
            .order
            .iter()
            .rev()
            .find_map(|id| registry.sessions.get(id).cloned())
    }

    fn register(&self, session: &Arc<CallSession>) {
        let mut registry = self.registry.lock().expect("registry lock");
        registry
            .sessions
            .insert(session.call_id.clone(), session.clone());
        registry
            .by_token
            .insert(session.ws_token.clone(), session.call_id.clone());
        registry.order.push(session.call_id.clone());
    }

    fn index_call_ref(&self, call_ref: &str, call_id: &str) {
        let mut registry = self.registry.lock().expect("registry lock");
        registry
            .by_call_ref
            .insert(call_ref.to_string(), call_id.to_string());
    }

    pub fn remove_session(&self, call_id: &str) {
        let mut registry = self.registry.lock().expect("registry lock");
        if let Some(session) = registry.sessions.remove(call_id) {
            registry.by_token.remove(&session.ws_token);
            if let Some(call_ref) = session.call_ref() {
                registry.by_call_ref.remove(call_ref);
            }
            registry.order.retain(|id| id != call_id);
        }
    }

    // =========================================================================
    // Driver RPC operations
    // =========================================================================

    /// Place a call, wait for it to come up, deliver the opening message,
    /// and return the user's first reply. A failed placement removes the
    /// session entirely.
    pub async fn initiate_call(self: &Arc<Self>, message: &str) -> Result<InitiateResult, BridgeError> {
        let session = CallSession::new(
            self.config.clone(),
            self.carrier.clone(),
            self.tools.clone(),
            self.http.clone(),
        );
        self.register(&session);
        let call_id = session.call_id.clone();
        let _cmd = session.cmd_lock.lock().await;

        let call_ref = match session.place().await {
            Ok(call_ref) => call_ref,
            Err(e) => {
                session.fail().await;
                self.remove_session(&call_id);
                return Err(e);
            }
        };
        self.index_call_ref(&call_ref, &call_id);

        match session.complete_start(message).await {
            Ok(response) => Ok(InitiateResult { call_id, response }),
            Err(e) => {
                // Per-turn timeouts leave the call alive for a retry via
                // continue_call; everything else tears it down.
                match &e {
                    BridgeError::Timeout(t) if t.what == "user turn" => Err(e),
                    _ => {
                        warn!(call_id = %call_id, "call setup failed: {e}");
                        if let Err(hangup_err) = self.carrier.hangup(&call_ref).await {
                            warn!("hangup after failed setup: {hangup_err}");
                        }
                        session.fail().await;
                        self.remove_session(&call_id);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Inject a message on an active call and wait for the next user turn.
    pub async fn continue_call(&self, call_id: &str, message: &str) -> Result<String, BridgeError> {
        let session = self
            .session(call_id)
            .ok_or_else(|| BridgeError::SessionNotFound(call_id.to_string()))?;
        let _cmd = session.cmd_lock.lock().await;
        let result = session.inject(message).await;
        if matches!(result, Err(BridgeError::Hangup(_))) {
            self.remove_session(call_id);
        }
        result
    }

    /// Speak without waiting for a reply.
    pub async fn speak_to_user(&self, call_id: &str, message: &str) -> Result<(), BridgeError> {
        let session = self
            .session(call_id)
            .ok_or_else(|| BridgeError::SessionNotFound(call_id.to_string()))?;
        let _cmd = session.cmd_lock.lock().await;
        session.speak(message)
    }

    /// Deliver a goodbye, hang up, and remove the session.
    pub async fn end_call(&self, call_id: &str, message: &str) -> Result<(), BridgeError> {
        let session = self
            .session(call_id)
            .ok_or_else(|| BridgeError::SessionNotFound(call_id.to_string()))?;
        let _cmd = session.cmd_lock.lock().await;
        let result = session.end(message).await;
        self.remove_session(call_id);
        result
    }

    // =========================================================================
    // Carrier event routing
    // =========================================================================

    /// Route a parsed webhook to its session. Unknown call refs are logged
    /// and ignored; hangups remove the session from the registry.
    pub fn route_webhook(&self, event: WebhookEvent) {
        let Some(session) = self.session_by_call_ref(&event.call_ref) else {
            warn!(call_ref = %event.call_ref, "webhook for unknown call");
            return;
        };
        let is_hangup = event.event == CarrierEvent::HungUp;
        session.handle_carrier_event(event.event);
        if is_hangup {
            self.remove_session(&session.call_id);
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// End every active call, bounded by the grace period.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<CallSession>> = {
            let registry = self.registry.lock().expect("registry lock");
            registry.sessions.values().cloned().collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "ending all active calls");

        let ending = futures_util::future::join_all(sessions.iter().map(|session| {
            let session = session.clone();
            async move {
                if let Err(e) = session.end("").await {
                    warn!(call_id = %session.call_id, "shutdown end failed: {e}");
                }
            }
        }));
        if tokio::time::timeout(SHUTDOWN_GRACE, ending).await.is_err() {
            warn!("shutdown grace period expired, dropping remaining calls");
        }

        let mut registry = self.registry.lock().expect("registry lock");
        registry.sessions.clear();
        registry.by_call_ref.clear();
        registry.by_token.clear();
        registry.order.clear();
    }
}
