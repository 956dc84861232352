//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::call::CallManager;
use crate::carrier::{CarrierPort, TelnyxCarrier, TwilioCarrier};
use crate::config::{BridgeConfig, CarrierKind};
use crate::tools::ToolRegistry;

/// Everything the HTTP handlers and the Driver RPC loop share.
///
/// There is exactly one `reqwest::Client` per process; the carrier port,
/// STT/TTS/brain stages, and webhook responses all reuse its pool.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub manager: Arc<CallManager>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: BridgeConfig, tools: ToolRegistry) -> Self {
        let config = Arc::new(config);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let carrier: Arc<dyn CarrierPort> = match config.carrier {
            CarrierKind::Twilio => Arc::new(TwilioCarrier::new(
                config.twilio.clone().expect("twilio config present"),
                http.clone(),
            )),
            CarrierKind::Telnyx => Arc::new(TelnyxCarrier::new(
                config.telnyx.clone().expect("telnyx config present"),
                http.clone(),
            )),
        };

        let manager = CallManager::new(config.clone(), carrier, Arc::new(tools), http.clone());

        Self {
            config,
            manager,
            http,
        }
    }
}
