use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use callbridge::rpc::DriverRpc;
use callbridge::tools::{ToolRegistry, ToolSpec};
use callbridge::{AppState, BridgeConfig, routes};

/// Callbridge - telephone bridge between an AI orchestrator and a live
/// voice conversation.
#[derive(Parser, Debug)]
#[command(name = "callbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a JSON file of tool specs to advertise to the model
    #[arg(long = "tools", value_name = "FILE")]
    tools: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before config resolution.
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout belongs to the Driver RPC.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = BridgeConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let tools = match &cli.tools {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
            let specs: Vec<ToolSpec> = serde_json::from_str(&raw)
                .map_err(|e| anyhow!("failed to parse {}: {e}", path.display()))?;
            info!(count = specs.len(), "loaded tool specs");
            // Specs loaded from disk have no process-side executor wired
            // in; invocations report that back to the model.
            ToolRegistry::new(specs, std::sync::Arc::new(NoopExecutor))
        }
        None => ToolRegistry::empty(),
    };

    let state = AppState::new(config, tools);
    let manager = state.manager.clone();
    let port = state.config.port;

    let app = routes::create_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| anyhow!("invalid listen address: {e}"))?;
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "webhook listener up");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("server error: {e}");
        }
    });

    // The Driver drives us over stdio; EOF or ctrl-c ends the process.
    let rpc = DriverRpc::new(manager.clone());
    tokio::select! {
        _ = rpc.run(tokio::io::stdin(), tokio::io::stdout()) => {
            info!("driver disconnected");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
    }

    manager.shutdown().await;
    server.abort();
    Ok(())
}

struct NoopExecutor;

#[async_trait::async_trait]
impl callbridge::tools::ToolExecutor for NoopExecutor {
    async fn execute(
        &self,
        name: &str,
        _input: serde_json::Value,
    ) -> Result<String, callbridge::errors::ToolError> {
        Err(callbridge::errors::ToolError {
            name: name.to_string(),
            cause: "no executor is bound for this tool".into(),
        })
    }
}
