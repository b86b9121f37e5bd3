//! Node A: the agent. Dials B's control port, serves the command loop, and
//! opens BAD tunnels (socket to B paired with socket to D) on demand.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use tunnel_core::{JsonStream, Packet, Status, Tunnel, TunnelError, TunnelResult};

use crate::config::AgentConfig;

pub struct NodeA {
    config: AgentConfig,
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
}

enum DialOutcome {
    Connected(TcpStream),
    Retry,
    /// Connection refused dialing B: the operator's contract is that B is
    /// already reachable when A starts, so this is unrecoverable.
    Fatal,
}

impl NodeA {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            tunnels: Mutex::new(Vec::new()),
        })
    }

    /// Run the Dialing -> Serving state machine until `shutdown` fires, then
    /// disconnect every live tunnel before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let reaper = {
            let node = self.clone();
            let interval = self.config.tunnel_reap_interval;
            let stop_rx = shutdown.resubscribe();
            tokio::spawn(tunnel_reaper(node, interval, stop_rx))
        };

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                outcome = dial_b(&self.config.b_ctl_addr, self.config.dial_timeout) => {
                    match outcome {
                        DialOutcome::Connected(stream) => {
                            info!(addr = %self.config.b_ctl_addr, "connected to b");
                            self.clone().serve(stream, &mut shutdown).await;
                        }
                        DialOutcome::Retry => {
                            debug!(addr = %self.config.b_ctl_addr, "dial b failed, retrying");
                            tokio::select! {
                                _ = shutdown.recv() => break,
                                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                            }
                        }
                        DialOutcome::Fatal => {
                            error!(addr = %self.config.b_ctl_addr, "b refused connection, exiting");
                            std::process::exit(1);
                        }
                    }
                }
            }
        }

        let tunnels: Vec<_> = self.tunnels.lock().await.drain(..).collect();
        for tunnel in tunnels {
            let _ = tunnel.disconnect().await;
        }
        reaper.abort();
    }

    /// Read/dispatch/write Packets over `stream` until an I/O error or
    /// shutdown signal, then return to the caller's dial loop.
    async fn serve(self: Arc<Self>, stream: TcpStream, shutdown: &mut broadcast::Receiver<()>) {
        let mut conn = JsonStream::new(stream);

        loop {
            let req = tokio::select! {
                _ = shutdown.recv() => return,
                result = conn.read_packet() => match result {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(error = %e, "b control stream ended");
                        return;
                    }
                },
            };

            let rsp = self.dispatch(req).await;

            if let Err(e) = conn.write_packet(&rsp).await {
                debug!(error = %e, "b control stream write failed");
                return;
            }
        }
    }

    async fn dispatch(&self, req: Packet) -> Packet {
        match req.cmd.as_str() {
            "hello" => Packet::new("world"),
            "testD" => self.handle_test_d(req).await,
            "tunnelBAD" => self.handle_tunnel_bad(req).await,
            other => Packet::with_data("error", [("msg", format!("[{other}] not registered"))]),
        }
    }

    async fn handle_test_d(&self, mut req: Packet) -> Packet {
        let Some(d_addr) = req.get("dAddr").map(str::to_string) else {
            req.set("error", "missing dAddr");
            return req;
        };

        let started = Instant::now();
        match dial_with_timeout(&d_addr, self.config.dial_timeout).await {
            Ok(stream) => {
                drop(stream);
                req.set("msg", format!("tcp ping since: {:?}", started.elapsed()));
            }
            Err(e) => req.set("error", e.to_string()),
        }
        req
    }

    async fn handle_tunnel_bad(&self, mut req: Packet) -> Packet {
        let Some(b_addr) = req.get("bAddr").map(str::to_string) else {
            req.set("msg", "missing bAddr");
            return req;
        };
        let Some(d_addr) = req.get("dAddr").map(str::to_string) else {
            req.set("msg", "missing dAddr");
            return req;
        };

        let ba = match dial_with_timeout(&b_addr, self.config.dial_timeout).await {
            Ok(s) => s,
            Err(e) => {
                req.set("msg", format!("dial b failed: {e}"));
                return req;
            }
        };

        let ad = match dial_with_timeout(&d_addr, self.config.dial_timeout).await {
            Ok(s) => s,
            Err(e) => {
                drop(ba);
                req.set("msg", format!("dial d failed: {e}"));
                return req;
            }
        };

        let tunnel = Tunnel::new(ba, ad);
        if let Err(e) = tunnel.connect().await {
            req.set("msg", format!("connect failed: {e}"));
            return req;
        }

        self.tunnels.lock().await.push(tunnel);
        req.set("msg", "add bad tunnel success");
        req.set("code", "1");
        req
    }
}

/// Dial `addr` with a bounded timeout, classifying the outcome into the
/// typed errors the rest of the control-plane dispatch reports to its peer.
async fn dial_with_timeout(addr: &str, timeout: Duration) -> TunnelResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(TunnelError::DialRefused(addr.to_string(), e.to_string()))
        }
        Ok(Err(e)) => Err(TunnelError::Io(e)),
        Err(_) => Err(TunnelError::DialTimeout(addr.to_string())),
    }
}

async fn dial_b(addr: &str, timeout: Duration) -> DialOutcome {
    match dial_with_timeout(addr, timeout).await {
        Ok(stream) => DialOutcome::Connected(stream),
        Err(e @ TunnelError::DialRefused(..)) => {
            warn!(addr, error = %e, "dial b refused");
            DialOutcome::Fatal
        }
        Err(e) => {
            debug!(addr, error = %e, "dial b failed");
            DialOutcome::Retry
        }
    }
}

async fn tunnel_reaper(node: Arc<NodeA>, interval: Duration, mut stop_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {}
        }
        let mut tunnels = node.tunnels.lock().await;
        let before = tunnels.len();
        tunnels.retain(|t| t.status() != Status::Disconnected);
        if tunnels.len() != before {
            debug!(removed = before - tunnels.len(), "reaped disconnected bad tunnels");
        }
    }
}
