//! tunneld: reverse-tunnel broker/agent binary.
//!
//! Runs as Node B (the public broker, `--mode b`) or Node A (the agent that
//! dials B, `--mode a`). See `broker` and `agent` for the two roles.

mod agent;
mod broker;
mod config;

use agent::NodeA;
use broker::NodeB;
use clap::{Parser, ValueEnum};
use config::{AgentConfig, BrokerConfig};
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    A,
    B,
}

/// tunneld — reverse-tunnel broker/agent
#[derive(Parser, Debug)]
#[command(name = "tunneld", version, about = "Reverse-tunnel broker/agent")]
struct Cli {
    /// Which role to run: the broker (b) or the agent (a)
    #[arg(long, value_enum)]
    mode: Mode,

    /// [mode=b] IP address B advertises to A and C for rendezvous ports
    #[arg(long, default_value = "127.0.0.1")]
    b_ip: String,

    /// [mode=b] Port for the C-control listener
    #[arg(long, default_value_t = 9001)]
    c_ctl_port: u16,

    /// [mode=b] Port for the A-control listener
    #[arg(long, default_value_t = 9002)]
    a_ctl_port: u16,

    /// [mode=a] Address of B's A-control listener to dial
    #[arg(long, default_value = "127.0.0.1:9002")]
    b_ctl_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), mode = ?cli.mode, "starting tunneld");

    match cli.mode {
        Mode::B => {
            let config = BrokerConfig {
                b_ip: cli.b_ip,
                c_ctl_port: cli.c_ctl_port,
                a_ctl_port: cli.a_ctl_port,
                ..BrokerConfig::default()
            };
            let node = NodeB::new(config);

            let watched = node.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("received shutdown signal");
                watched.stop().await;
            });

            if let Err(e) = node.run().await {
                error!(error = %e, "node b error");
                std::process::exit(1);
            }
        }
        Mode::A => {
            let config = AgentConfig {
                b_ctl_addr: cli.b_ctl_addr,
                ..AgentConfig::default()
            };
            let node = NodeA::new(config);
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

            tokio::spawn(async move {
                shutdown_signal().await;
                info!("received shutdown signal");
                let _ = shutdown_tx.send(());
            });

            node.run(shutdown_rx).await;
        }
    }

    info!("tunneld stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
