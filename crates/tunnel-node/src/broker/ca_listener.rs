//! Per-destination rendezvous unit on B.
//!
//! A `CaListener` owns two ephemeral TCP listeners — one that C dials to
//! reach `dAddr`, one that A dials to bring up the D-side leg — and pairs
//! one arrival from each into a [`Tunnel`]. Pairing is strict FIFO: the
//! A-side arrival is always awaited first, then the C-side arrival.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tunnel_core::{Status, Tunnel};

pub struct CaListener {
    d_addr: String,
    c_rand_port: u16,
    a_rand_port: u16,
    tunnels: Arc<Mutex<Vec<Arc<Tunnel>>>>,
    stop_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CaListener {
    /// Bind both ephemeral listeners and spawn the accept, pairing, and
    /// reaper tasks. Returns once both ports are bound and known.
    pub async fn start(
        d_addr: String,
        queue_capacity: usize,
        tunnel_reap_interval: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let a_listener = TcpListener::bind("0.0.0.0:0").await?;
        let a_rand_port = a_listener.local_addr()?.port();
        let c_listener = TcpListener::bind("0.0.0.0:0").await?;
        let c_rand_port = c_listener.local_addr()?.port();

        let (stop_tx, _) = broadcast::channel(1);
        let (ba_tx, ba_rx) = mpsc::channel::<TcpStream>(queue_capacity);
        let (cb_tx, cb_rx) = mpsc::channel::<TcpStream>(queue_capacity);
        let tunnels: Arc<Mutex<Vec<Arc<Tunnel>>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        handles.push(tokio::spawn(accept_loop(
            a_listener,
            ba_tx,
            stop_tx.subscribe(),
            "a-side",
            d_addr.clone(),
        )));
        handles.push(tokio::spawn(accept_loop(
            c_listener,
            cb_tx,
            stop_tx.subscribe(),
            "c-side",
            d_addr.clone(),
        )));
        handles.push(tokio::spawn(pairing_loop(
            ba_rx,
            cb_rx,
            tunnels.clone(),
            stop_tx.subscribe(),
            d_addr.clone(),
        )));
        handles.push(tokio::spawn(tunnel_reaper(
            tunnels.clone(),
            tunnel_reap_interval,
            stop_tx.subscribe(),
        )));

        info!(d_addr = %d_addr, a_rand_port, c_rand_port, "ca listener started");

        Ok(Arc::new(Self {
            d_addr,
            c_rand_port,
            a_rand_port,
            tunnels,
            stop_tx,
            handles: Mutex::new(handles),
        }))
    }

    pub fn d_addr(&self) -> &str {
        &self.d_addr
    }

    pub fn c_rand_port(&self) -> u16 {
        self.c_rand_port
    }

    pub fn a_rand_port(&self) -> u16 {
        self.a_rand_port
    }

    /// True iff at least one tunnel paired through this listener is still
    /// connected. The idle reaper in [`crate::broker::registry`] calls this.
    pub async fn active(&self) -> bool {
        !self.tunnels.lock().await.is_empty()
    }

    /// Stop accepting, disconnect every live tunnel, and wait for the
    /// background tasks to exit.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());

        let tunnels: Vec<_> = self.tunnels.lock().await.drain(..).collect();
        for tunnel in tunnels {
            let _ = tunnel.disconnect().await;
        }

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<TcpStream>,
    mut stop_rx: broadcast::Receiver<()>,
    side: &'static str,
    d_addr: String,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!(d_addr = %d_addr, side, "ca accept loop stopped");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((conn, peer)) => {
                        debug!(d_addr = %d_addr, side, peer = %peer, "accepted connection");
                        if tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(d_addr = %d_addr, side, error = %e, "accept error"),
                }
            }
        }
    }
}

async fn pairing_loop(
    mut ba_rx: mpsc::Receiver<TcpStream>,
    mut cb_rx: mpsc::Receiver<TcpStream>,
    tunnels: Arc<Mutex<Vec<Arc<Tunnel>>>>,
    mut stop_rx: broadcast::Receiver<()>,
    d_addr: String,
) {
    loop {
        let ba_conn = tokio::select! {
            _ = stop_rx.recv() => break,
            conn = ba_rx.recv() => match conn {
                Some(c) => c,
                None => break,
            },
        };
        debug!(d_addr = %d_addr, "a-side arrival, waiting for c-side");

        let cb_conn = tokio::select! {
            _ = stop_rx.recv() => { drop(ba_conn); break; }
            conn = cb_rx.recv() => match conn {
                Some(c) => c,
                None => { drop(ba_conn); break; }
            },
        };

        let tunnel = Tunnel::new(cb_conn, ba_conn);
        match tunnel.connect().await {
            Ok(()) => {
                info!(d_addr = %d_addr, "paired new c<->b<->a<->d tunnel");
                tunnels.lock().await.push(tunnel);
            }
            Err(e) => warn!(d_addr = %d_addr, error = %e, "failed to start paired tunnel"),
        }
    }

    ba_rx.close();
    cb_rx.close();
    while ba_rx.try_recv().is_ok() {}
    while cb_rx.try_recv().is_ok() {}
}

async fn tunnel_reaper(
    tunnels: Arc<Mutex<Vec<Arc<Tunnel>>>>,
    interval: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {}
        }
        let mut tunnels = tunnels.lock().await;
        let before = tunnels.len();
        tunnels.retain(|t| t.status() != Status::Disconnected);
        if tunnels.len() != before {
            debug!(removed = before - tunnels.len(), "reaped disconnected tunnels");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pairs_a_then_c_arrivals_fifo() {
        let listener = CaListener::start("test-dest".to_string(), 10, Duration::from_secs(5))
            .await
            .unwrap();
        let a_port = listener.a_rand_port();
        let c_port = listener.c_rand_port();

        let mut a1 = TcpStream::connect(("127.0.0.1", a_port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut a2 = TcpStream::connect(("127.0.0.1", a_port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut c1 = TcpStream::connect(("127.0.0.1", c_port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut c2 = TcpStream::connect(("127.0.0.1", c_port)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(listener.active().await);

        c1.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        a1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");

        c2.write_all(b"two").await.unwrap();
        let mut buf = [0u8; 3];
        a2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");

        listener.stop().await;
        assert!(!listener.active().await);
    }
}
