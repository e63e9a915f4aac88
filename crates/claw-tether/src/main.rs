//! tether - command-line client for claw-tether
//!
//! Connects to a WebSocket endpoint through the durable transport and either
//! streams what arrives, issues one correlated call, or waits for a cached
//! result.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use claw_tether::{
    CachedCorrelator, CodecPlugin, ConnectionEvent, ConnectionManager, ConnectionParams,
    ConnectionState, Frame, HeartbeatMonitor, ParamsResolver, ReactiveCorrelator,
    ReconnectConfig, TransportConfig, TransportError, WebSocketConnector, reconnect_with_backoff,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Durable WebSocket client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ConnectArgs {
    /// WebSocket URL
    #[arg(long, env = "TETHER_URL")]
    url: String,

    /// Path to a JSON transport config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bearer token sent on every connection attempt
    #[arg(long, env = "TETHER_TOKEN", conflicts_with = "token_file")]
    token: Option<String>,

    /// File holding the bearer token, re-read before every connection attempt
    #[arg(long)]
    token_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print every inbound message and state change
    Watch {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Send one correlated request and print the response data
    Call {
        #[command(flatten)]
        connect: ConnectArgs,

        /// JSON object to send
        #[arg(long)]
        payload: String,

        /// Override the configured call timeout, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Wait for a cached result pushed for a request id
    Wait {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Request id to wait for
        #[arg(long)]
        request_id: String,

        /// Override the configured wait timeout, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Write the default transport config as JSON
    InitConfig {
        /// Where to write it (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::from_default_env()
                .add_directive("claw_tether=info".parse()?)
                .add_directive("tether=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { connect } => watch(&connect).await,
        Commands::Call {
            connect,
            payload,
            timeout_ms,
        } => call(&connect, &payload, timeout_ms).await,
        Commands::Wait {
            connect,
            request_id,
            timeout_ms,
        } => wait(&connect, &request_id, timeout_ms).await,
        Commands::InitConfig { output } => init_config(output.as_deref()),
    }
}

fn load_config(args: &ConnectArgs) -> anyhow::Result<TransportConfig> {
    match &args.config {
        Some(path) => Ok(TransportConfig::from_file(path)?),
        None => Ok(TransportConfig::default()),
    }
}

/// Retry policy for reading the token file; rotation may briefly leave it missing.
fn token_read_retry() -> ReconnectConfig {
    ReconnectConfig {
        base_delay: Duration::from_millis(200),
        max_attempts: Some(3),
        ..Default::default()
    }
}

async fn read_token(path: &Path) -> Result<String, TransportError> {
    let token = reconnect_with_backoff(&token_read_retry(), || async move {
        tokio::fs::read_to_string(path).await
    })
    .await
    .map_err(|e| {
        TransportError::Resolve(format!(
            "failed to read token file '{}': {e}",
            path.display()
        ))
    })?;

    let token = token.trim();
    if token.is_empty() {
        return Err(TransportError::Resolve(format!(
            "token file '{}' is empty",
            path.display()
        )));
    }
    Ok(token.to_string())
}

fn resolver(args: &ConnectArgs) -> impl ParamsResolver {
    let url = args.url.clone();
    let token = args.token.clone();
    let token_file = args.token_file.clone();

    move || {
        let url = url.clone();
        let token = token.clone();
        let token_file = token_file.clone();
        async move {
            let params = ConnectionParams::new(url);
            let token = match (token, token_file) {
                (Some(token), _) => Some(token),
                (None, Some(path)) => Some(read_token(&path).await?),
                (None, None) => None,
            };
            Ok::<_, TransportError>(match token {
                Some(token) => params.with_bearer_token(&token),
                None => params,
            })
        }
    }
}

fn build_manager(args: &ConnectArgs, config: &TransportConfig) -> ConnectionManager {
    let connector = WebSocketConnector::new().with_connect_timeout(config.connect_timeout());
    let mut builder = ConnectionManager::builder(connector, resolver(args)).with_config(config);
    if let Some(heartbeat) = config.heartbeat() {
        builder = builder.with_plugin(Arc::new(HeartbeatMonitor::new(heartbeat)));
    }
    builder.with_plugin(Arc::new(CodecPlugin::json())).build()
}

/// Open the manager and wait until the first connection is up.
async fn connect(manager: &ConnectionManager, within: Duration) -> anyhow::Result<()> {
    manager.open()?;
    let mut state = manager.watch_state();
    let reached = tokio::time::timeout(
        within,
        state.wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Closed)),
    )
    .await
    .context("timed out waiting for the connection to open")?
    .map(|s| *s)
    .context("connection manager dropped")?;

    if reached == ConnectionState::Closed {
        anyhow::bail!("connection closed before it opened");
    }
    Ok(())
}

fn print_frame(frame: &Frame) {
    match frame {
        Frame::Value(value) => println!("{value}"),
        Frame::Text(text) => println!("{text}"),
        Frame::Binary(bytes) => println!("<{} bytes>", bytes.len()),
    }
}

async fn watch(args: &ConnectArgs) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let manager = build_manager(args, &config);
    let mut events = manager.events();
    manager.open()?;
    info!(url = %args.url, "watching, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ConnectionEvent::Message(frame)) => print_frame(&frame),
                Ok(ConnectionEvent::Closed) => break,
                Ok(event) => info!(?event, state = %manager.state(), "connection event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "output lagged, events lost"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.close();
    Ok(())
}

async fn call(args: &ConnectArgs, payload: &str, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("payload is not valid JSON")?;
    let timeout = timeout_ms.map_or(config.correlation().timeout, Duration::from_millis);

    let manager = Arc::new(build_manager(args, &config));
    let rpc = ReactiveCorrelator::new(Arc::clone(&manager), config.correlation())?;
    connect(&manager, timeout).await?;

    let data = rpc.call_with_timeout(payload, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);

    manager.close();
    Ok(())
}

async fn wait(args: &ConnectArgs, request_id: &str, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let timeout = timeout_ms.map_or(config.cache().wait_timeout, Duration::from_millis);

    let manager = Arc::new(build_manager(args, &config));
    let cache = CachedCorrelator::new(Arc::clone(&manager), config.cache())?;
    manager.open()?;

    let result = cache.wait_for_with_timeout(request_id, timeout).await;
    manager.close();

    match result {
        Some(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        None => anyhow::bail!("no result for request '{request_id}' within {timeout:?}"),
    }
}

fn init_config(output: Option<&Path>) -> anyhow::Result<()> {
    let json = TransportConfig::default().to_json()?;
    match output {
        Some(path) => {
            std::fs::write(path, format!("{json}\n"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "wrote default config");
        }
        None => println!("{json}"),
    }
    Ok(())
}
