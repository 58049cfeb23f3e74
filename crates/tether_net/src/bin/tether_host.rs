//! # Tether Demo Host
//!
//! Authoritative host with an `echo` RPC and a small orbiting world, for
//! trying clients against.
//!
//! ## Usage
//!
//! ```bash
//! tether_host --port 7777 --max-clients 8 --secret lan-party --broadcast-hz 20
//! tether_host --config host.toml --duration 60
//! RUST_LOG=tether_net=debug tether_host
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::Value;
use tether_net::{HandlerError, HostConfig, HostEngine, NetResult, ObjectState, RpcArgs, Vec2};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Demo host for the Tether protocol.
#[derive(Parser, Debug)]
#[command(name = "tether_host", about = "Tether demo host")]
struct Cli {
    /// TOML file with host settings; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum concurrent clients.
    #[arg(short, long)]
    max_clients: Option<usize>,

    /// Shared secret clients must sign.
    #[arg(long)]
    secret: Option<String>,

    /// State broadcast frequency.
    #[arg(long)]
    broadcast_hz: Option<f64>,

    /// Compress state frames.
    #[arg(long)]
    compress: bool,

    /// Number of orbiting demo objects.
    #[arg(long, default_value = "8")]
    objects: u64,

    /// Run for N seconds then exit.
    #[arg(short, long)]
    duration: Option<u64>,
}

impl Cli {
    fn host_config(&self) -> NetResult<HostConfig> {
        let mut config = match &self.config {
            Some(path) => HostConfig::load(path)?,
            None => HostConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if self.secret.is_some() {
            config.secret.clone_from(&self.secret);
        }
        if let Some(hz) = self.broadcast_hz {
            config.broadcast_hz = hz;
        }
        config.compress |= self.compress;
        config.validate()?;
        Ok(config)
    }
}

fn echo(call: RpcArgs) -> Result<Value, HandlerError> {
    Ok(call.arg(0).cloned().unwrap_or(Value::Null))
}

/// Objects on circles around the origin, one lap every ten seconds.
fn orbit(count: u64, elapsed: f64) -> Vec<ObjectState> {
    let omega = std::f64::consts::TAU / 10.0;
    (0..count)
        .map(|i| {
            let radius = 2.0 + i as f64;
            let phase = omega * elapsed + i as f64;
            let position = Vec2::new(radius * phase.cos(), radius * phase.sin());
            let velocity = Vec2::new(-radius * omega * phase.sin(), radius * omega * phase.cos());
            ObjectState::at_rest(i + 1, position, phase).with_velocity(velocity, omega)
        })
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> NetResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.host_config()?;

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         TETHER HOST                                              ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("┌─ CONFIGURATION ─────────────────────────────────────────────────┐");
    println!("│ Bind Address:       {}", config.bind_addr());
    println!("│ Broadcast Rate:     {} Hz", config.broadcast_hz);
    println!("│ Max Clients:        {}", config.max_clients);
    println!("│ Auth:               {}", if config.secret.is_some() { "secret" } else { "open" });
    println!("│ Compression:        {}", config.compress);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let host = HostEngine::new(config)?;
    host.register_rpc("echo", echo);
    host.on_client(|id| {
        info!(%id, "client joined");
        Ok(())
    });
    host.on_disconnect(|id| {
        info!(%id, "client left");
        Ok(())
    });
    host.on_chat(|id, text| {
        info!(%id, text, "chat");
        Ok(())
    });

    let started = Instant::now();
    let objects = cli.objects;
    host.set_state_provider(move || orbit(objects, started.elapsed().as_secs_f64()));

    let addr = host.start().await?;
    info!(%addr, "ready, Ctrl-C to stop");

    let deadline = async {
        match cli.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut status = tokio::time::interval(Duration::from_secs(5));
    status.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = &mut deadline => break,
            _ = status.tick() => {
                let stats = host.tick_stats();
                info!(
                    clients = host.client_count(),
                    ticks = stats.ticks,
                    broadcasts = stats.broadcasts,
                    avg_tick_us = stats.avg_tick_us,
                    max_tick_us = stats.max_tick_us,
                    "status"
                );
            }
        }
    }

    host.shutdown().await;

    let stats = host.tick_stats();
    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                    HOST SHUTDOWN                                 ║");
    println!("╠══════════════════════════════════════════════════════════════════╣");
    println!("║ Uptime:             {:>10.1} s", started.elapsed().as_secs_f64());
    println!("║ Total Ticks:        {:>10}", stats.ticks);
    println!("║ Broadcasts:         {:>10}", stats.broadcasts);
    println!("║ Pings Sent:         {:>10}", stats.pings_sent);
    println!("║ Avg Tick Time:      {:>10} μs", stats.avg_tick_us);
    println!("║ Max Tick Time:      {:>10} μs", stats.max_tick_us);
    println!("╚══════════════════════════════════════════════════════════════════╝");
    Ok(())
}
