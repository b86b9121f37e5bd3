//! Node B: the public broker. Listens for A's single control connection and
//! for C's command connections, and orchestrates `CaListener`s between them.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tunnel_core::{JsonStream, LineStream, Packet, TunnelError, TunnelResult};

use crate::config::BrokerConfig;

use super::registry::CaListenerRegistry;

pub struct NodeB {
    config: BrokerConfig,
    registry: CaListenerRegistry,
    a_conn: Mutex<Option<JsonStream<TcpStream>>>,
    stop_tx: broadcast::Sender<()>,
}

impl NodeB {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let registry = CaListenerRegistry::new(config.queue_capacity, config.tunnel_reap_interval);
        let (stop_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            registry,
            a_conn: Mutex::new(None),
            stop_tx,
        })
    }

    /// Bind both control listeners and run until `stop()` is called.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let a_listener = TcpListener::bind(("0.0.0.0", self.config.a_ctl_port)).await?;
        let c_listener = TcpListener::bind(("0.0.0.0", self.config.c_ctl_port)).await?;
        info!(
            a_ctl_port = self.config.a_ctl_port,
            c_ctl_port = self.config.c_ctl_port,
            "node b listening"
        );

        let a_handle: JoinHandle<()> = {
            let node = self.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        result = a_listener.accept() => match result {
                            Ok((conn, peer)) => node.clone().accept_a(conn, peer).await,
                            Err(e) => warn!(error = %e, "a-control accept error"),
                        }
                    }
                }
            })
        };

        let c_handle: JoinHandle<()> = {
            let node = self.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        result = c_listener.accept() => match result {
                            Ok((conn, peer)) => {
                                let node = node.clone();
                                let handler_stop = node.stop_tx.subscribe();
                                tokio::spawn(async move {
                                    node.handle_c_ctl(conn, peer, handler_stop).await;
                                });
                            }
                            Err(e) => warn!(error = %e, "c-control accept error"),
                        }
                    }
                }
            })
        };

        let reaper_handle: JoinHandle<()> = {
            let node = self.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            let interval = self.config.idle_reap_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = ticker.tick() => {}
                    }
                    node.registry.reap_idle().await;
                }
            })
        };

        let _ = tokio::join!(a_handle, c_handle, reaper_handle);
        self.registry.stop_all().await;
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        if let Some(mut s) = self.a_conn.lock().await.take() {
            let _ = s.shutdown().await;
        }
    }

    /// The A-control slot is overwritten, not closed, on a new arrival — A
    /// is expected to redial and the stale connection is simply abandoned.
    /// Closing it here would race a still-in-flight request/response pair
    /// on the connection being replaced.
    async fn accept_a(self: Arc<Self>, conn: TcpStream, peer: std::net::SocketAddr) {
        info!(peer = %peer, "agent control connection established");
        let new_stream = JsonStream::new(conn);
        let mut guard = self.a_conn.lock().await;
        if let Some(old) = guard.take() {
            std::mem::forget(old);
        }
        *guard = Some(new_stream);
    }

    async fn forward_to_a(&self, req: &Packet) -> TunnelResult<Packet> {
        let mut guard = self.a_conn.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| TunnelError::Other("a not connected".to_string()))?;
        stream.write_packet(req).await?;
        stream.read_packet().await
    }

    async fn handle_c_ctl(
        self: Arc<Self>,
        conn: TcpStream,
        peer: std::net::SocketAddr,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        let mut stream = LineStream::new(conn);
        info!(peer = %peer, "client control connection established");

        if self.a_conn.lock().await.is_none() {
            let _ = stream
                .write_packet(&Packet::with_data("", [("msg", "a not connected")]))
                .await;
            return;
        }

        loop {
            let req = tokio::select! {
                _ = stop_rx.recv() => return,
                result = stream.read_packet() => match result {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };

            if req.cmd.is_empty() {
                continue;
            }

            let rsp = match req.cmd.as_str() {
                "testD" => self.proxy_test_d(req).await,
                "tunnelBAD" => self.handle_tunnel_bad(req).await,
                "listForward" => self.handle_list_forward().await,
                other => Packet::with_data("", [("msg", format!("{other} not implement"))]),
            };

            if stream.write_packet(&rsp).await.is_err() {
                return;
            }
        }
    }

    async fn proxy_test_d(&self, req: Packet) -> Packet {
        match self.forward_to_a(&req).await {
            Ok(rsp) => rsp,
            Err(e) => Packet::with_data("", [("msg", format!("a control error: {e}"))]),
        }
    }

    async fn handle_tunnel_bad(&self, mut req: Packet) -> Packet {
        let d_addr = match req.get("dAddr") {
            Some(s) => s.to_string(),
            None => return Packet::with_data("", [("msg", "missing dAddr")]),
        };

        let ca_listener = match self.registry.get_or_create(&d_addr).await {
            Ok(l) => l,
            Err(e) => {
                return Packet::with_data(
                    "",
                    [("msg", format!("failed to start listener for {d_addr}: {e}"))],
                )
            }
        };

        req.set("bAddr", format!("{}:{}", self.config.b_ip, ca_listener.a_rand_port()));

        let rsp = match self.forward_to_a(&req).await {
            Ok(p) => p,
            Err(e) => return Packet::with_data("", [("msg", format!("a control error: {e}"))]),
        };

        if rsp.get("code") != Some("1") {
            return rsp;
        }

        req.set(
            "randAddrForC",
            format!("{}:{}", self.config.b_ip, ca_listener.c_rand_port()),
        );
        req
    }

    async fn handle_list_forward(&self) -> Packet {
        let entries = self.registry.list().await;
        let data = entries
            .into_iter()
            .map(|(d_addr, c_rand_port)| (format!("B提供到[{d_addr}]的转发端口"), c_rand_port.to_string()))
            .collect();
        Packet { cmd: String::new(), data }
    }
}
