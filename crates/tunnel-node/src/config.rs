//! Resolved configuration for each node role.
//!
//! Unlike `wsh-server`'s TOML-backed config, there is no on-disk config
//! file here — the CLI surface (see `Cli` in `main.rs`) is the sole source
//! of truth — but the "merge into a plain config struct" shape is kept so
//! the broker/agent constructors never touch `clap` types directly.

use std::time::Duration;

/// Configuration for Node B (the broker).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// The IP address B advertises to A and C for dialing back ephemeral
    /// rendezvous ports.
    pub b_ip: String,
    /// Port for the C-control listener (operator commands).
    pub c_ctl_port: u16,
    /// Port for the A-control listener (exactly one A is expected).
    pub a_ctl_port: u16,
    /// Per-CAListener queue capacity for arriving C-side/A-side sockets.
    pub queue_capacity: usize,
    /// Interval between idle-CAListener reaper sweeps.
    pub idle_reap_interval: Duration,
    /// Interval between per-CAListener dead-tunnel reaper sweeps.
    pub tunnel_reap_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            b_ip: "127.0.0.1".to_string(),
            c_ctl_port: 9001,
            a_ctl_port: 9002,
            queue_capacity: 10,
            idle_reap_interval: Duration::from_secs(10),
            tunnel_reap_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration for Node A (the agent).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address of B's A-control listener to dial.
    pub b_ctl_addr: String,
    /// Timeout applied to every outbound dial (to B, and to D).
    pub dial_timeout: Duration,
    /// Interval between reconnect attempts while `Dialing`.
    pub reconnect_interval: Duration,
    /// Interval between dead-tunnel reaper sweeps.
    pub tunnel_reap_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            b_ctl_addr: "127.0.0.1:9002".to_string(),
            dial_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(2),
            tunnel_reap_interval: Duration::from_secs(5),
        }
    }
}
