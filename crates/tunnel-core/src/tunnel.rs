//! The bidirectional byte-copy tunnel and its tri-state lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{TunnelError, TunnelResult};

const CREATED: u8 = 0;
const CONNECTED: u8 = 1;
const DISCONNECTED: u8 = 2;

/// Lifecycle state of a [`Tunnel`]. Transitions are monotonic:
/// `Created -> Connected -> Disconnected`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Connected,
    Disconnected,
}

impl From<u8> for Status {
    fn from(v: u8) -> Self {
        match v {
            CONNECTED => Status::Connected,
            DISCONNECTED => Status::Disconnected,
            _ => Status::Created,
        }
    }
}

/// Owns exactly two connected sockets and copies bytes between them in both
/// directions until either side reaches end-of-stream.
///
/// `Connect` and `Disconnect` race to perform the single Connected ->
/// Disconnected transition; whichever wins is responsible for closing both
/// sockets (see module docs on [`Status`]).
pub struct Tunnel {
    downstream: Arc<TcpStream>,
    upstream: Arc<TcpStream>,
    status: Arc<AtomicU8>,
    cancel: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    finished: Arc<Notify>,
    tasks_finished: Arc<AtomicBool>,
}

impl Tunnel {
    /// Construct a new tunnel in state `Created`.
    pub fn new(downstream: TcpStream, upstream: TcpStream) -> Arc<Self> {
        Arc::new(Self {
            downstream: Arc::new(downstream),
            upstream: Arc::new(upstream),
            status: Arc::new(AtomicU8::new(CREATED)),
            cancel: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(Notify::new()),
            tasks_finished: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        Status::from(self.status.load(Ordering::SeqCst))
    }

    /// `Created -> Connected`. Spawns the two copy tasks and a joiner task
    /// that performs the Connected -> Disconnected transition once both
    /// copies finish naturally (peer EOF), unless `disconnect` beats it to
    /// the CAS first.
    pub async fn connect(self: &Arc<Self>) -> TunnelResult<()> {
        self.status
            .compare_exchange(CREATED, CONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TunnelError::AlreadyConnected)?;

        let down_to_up = tokio::spawn(copy_direction(
            self.downstream.clone(),
            self.upstream.clone(),
            self.cancel.clone(),
            self.cancelled.clone(),
            "downstream->upstream",
        ));
        let up_to_down = tokio::spawn(copy_direction(
            self.upstream.clone(),
            self.downstream.clone(),
            self.cancel.clone(),
            self.cancelled.clone(),
            "upstream->downstream",
        ));

        let joiner = self.clone();
        tokio::spawn(async move {
            let _ = tokio::join!(down_to_up, up_to_down);
            joiner.tasks_finished.store(true, Ordering::SeqCst);

            if joiner
                .status
                .compare_exchange(CONNECTED, DISCONNECTED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                joiner.shutdown_both().await;
            }
            joiner.finished.notify_waiters();
        });

        Ok(())
    }

    /// `Connected -> Disconnected`. Closes both sockets (unblocking the
    /// copy tasks, which are always parked on a cancellation-aware select)
    /// and waits for them to exit before returning.
    pub async fn disconnect(&self) -> TunnelResult<()> {
        self.status
            .compare_exchange(CONNECTED, DISCONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TunnelError::NotConnected)?;

        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
        self.shutdown_both().await;
        self.wait_for_copies().await;
        Ok(())
    }

    async fn shutdown_both(&self) {
        let mut down = &*self.downstream;
        let mut up = &*self.upstream;
        let _ = down.shutdown().await;
        let _ = up.shutdown().await;
    }

    async fn wait_for_copies(&self) {
        let notified = self.finished.notified();
        if self.tasks_finished.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

async fn copy_direction(
    src: Arc<TcpStream>,
    dst: Arc<TcpStream>,
    cancel: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    label: &'static str,
) {
    let mut reader = &*src;
    let mut writer = &*dst;
    let mut buf = [0u8; 8192];

    loop {
        if cancelled.load(Ordering::SeqCst) {
            debug!(label, "copy cancelled");
            break;
        }

        let notified = cancel.notified();
        tokio::select! {
            _ = notified => {
                debug!(label, "copy cancelled");
                break;
            }
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!(label, "copy stream eof");
                        let _ = writer.shutdown().await;
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = writer.write_all(&buf[..n]).await {
                            log_copy_termination(label, &e);
                            break;
                        }
                    }
                    Err(e) => {
                        log_copy_termination(label, &e);
                        break;
                    }
                }
            }
        }
    }
}

fn log_copy_termination(label: &str, err: &std::io::Error) {
    use std::io::ErrorKind::*;
    match err.kind() {
        UnexpectedEof => debug!(label, "copy stream eof"),
        BrokenPipe => debug!(label, "copy broken stream"),
        ConnectionReset => debug!(label, "copy reset stream"),
        NotConnected | ConnectionAborted => debug!(label, error = %err, "copy closed stream"),
        _ => warn!(label, error = %err, "copy stream err"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn connect_then_connect_again_fails() {
        let (a, b) = connected_pair().await;
        let tunnel = Tunnel::new(a, b);
        tunnel.connect().await.unwrap();
        assert_eq!(tunnel.status(), Status::Connected);

        let err = tunnel.connect().await.unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyConnected));
    }

    #[tokio::test]
    async fn disconnect_before_connect_fails() {
        let (a, b) = connected_pair().await;
        let tunnel = Tunnel::new(a, b);
        let err = tunnel.disconnect().await.unwrap_err();
        assert!(matches!(err, TunnelError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_twice_fails_second_time() {
        let (a, b) = connected_pair().await;
        let tunnel = Tunnel::new(a, b);
        tunnel.connect().await.unwrap();
        tunnel.disconnect().await.unwrap();
        assert_eq!(tunnel.status(), Status::Disconnected);

        let err = tunnel.disconnect().await.unwrap_err();
        assert!(matches!(err, TunnelError::NotConnected));
    }

    #[tokio::test]
    async fn bytes_flow_both_directions() {
        // down <-> tunnel <-> up, with a peer attached to each side.
        let (down, down_peer) = connected_pair().await;
        let (up, up_peer) = connected_pair().await;

        let tunnel = Tunnel::new(down, up);
        tunnel.connect().await.unwrap();

        let mut down_peer = down_peer;
        let mut up_peer = up_peer;

        down_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        up_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        up_peer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        down_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn eof_on_one_side_reaches_disconnected() {
        let (down, down_peer) = connected_pair().await;
        let (up, up_peer) = connected_pair().await;

        let tunnel = Tunnel::new(down, up);
        tunnel.connect().await.unwrap();

        drop(down_peer);
        drop(up_peer);

        for _ in 0..50 {
            if tunnel.status() == Status::Disconnected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("tunnel did not reach Disconnected after both peers closed");
    }
}
