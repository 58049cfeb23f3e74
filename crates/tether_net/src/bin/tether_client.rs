//! # Tether Demo Client
//!
//! Connects to a host, says hello in chat, calls `echo`, and logs what the
//! host sends until the duration runs out.
//!
//! ## Usage
//!
//! ```bash
//! tether_client --host 127.0.0.1 --port 7777 --secret lan-party --duration 10
//! tether_client --config client.toml --chat "gg"
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::{json, Map};
use tether_net::{ClientConfig, ClientEngine, ClientState, Message, NetResult, RpcId};
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

/// Demo client for the Tether protocol.
#[derive(Parser, Debug)]
#[command(name = "tether_client", about = "Tether demo client")]
struct Cli {
    /// TOML file with client settings; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host address.
    #[arg(long)]
    host: Option<String>,

    /// Host port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared secret.
    #[arg(long)]
    secret: Option<String>,

    /// Chat line sent once welcomed.
    #[arg(long, default_value = "hello from tether_client")]
    chat: String,

    /// Seconds to stay connected.
    #[arg(short, long, default_value = "10")]
    duration: u64,
}

impl Cli {
    fn client_config(&self) -> NetResult<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.secret.is_some() {
            config.secret.clone_from(&self.secret);
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> NetResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    let poll_interval = config.poll_interval();

    let mut client = ClientEngine::new(config);
    client.connect_configured()?;

    let started = Instant::now();
    let deadline = started + Duration::from_secs(cli.duration);
    let mut greeted = false;
    let mut echo_call = RpcId::INVALID;
    let mut states = 0u64;

    while Instant::now() < deadline {
        for msg in client.poll() {
            match msg {
                Message::State { objects, ts } => {
                    states += 1;
                    debug!(objects = objects.len(), ts, "state");
                }
                Message::InitState { objects } => info!(objects = objects.len(), "initial state"),
                Message::Chat { from, text } => info!(from = ?from, text, "chat"),
                Message::Spawn(spec) => info!(from = ?spec.from, shape = ?spec.shape, "spawn"),
                Message::Welcome { .. } | Message::Error { .. } | Message::Ping { .. } | Message::Pong { .. } => {}
                other => debug!(kind = other.kind(), "message"),
            }
        }

        match client.state() {
            ClientState::Disconnected => {
                match client.rejection() {
                    Some(reason) => warn!(%reason, "rejected by host"),
                    None => warn!("host closed the connection"),
                }
                break;
            }
            ClientState::Connected if !greeted => {
                greeted = true;
                client.send_chat(cli.chat.clone())?;
                let mut kwargs = Map::new();
                kwargs.insert("sent_at_ms".to_string(), json!(started.elapsed().as_millis() as u64));
                echo_call = client.call_rpc("echo", vec![json!("ping")], kwargs);
            }
            _ => {}
        }

        if client.get_rpc_result(echo_call).is_some_and(|s| s.done) {
            if let Some(status) = client.take_rpc_result(echo_call) {
                if status.ok {
                    info!(result = %status.result, "echo returned");
                } else {
                    warn!(error = ?status.error, "echo failed");
                }
                echo_call = RpcId::INVALID;
                let _ = client.ping();
            }
        }

        std::thread::sleep(poll_interval);
    }

    info!(states, rtt = ?client.rtt(), "done");
    client.close();
    Ok(())
}
