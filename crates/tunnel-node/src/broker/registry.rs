//! The map from destination address to its [`CaListener`], with
//! get-or-create semantics so a given `dAddr` is ever started once.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;

use super::ca_listener::CaListener;
use std::sync::Arc;

pub struct CaListenerRegistry {
    listeners: Mutex<HashMap<String, Arc<CaListener>>>,
    queue_capacity: usize,
    tunnel_reap_interval: Duration,
}

impl CaListenerRegistry {
    pub fn new(queue_capacity: usize, tunnel_reap_interval: Duration) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            queue_capacity,
            tunnel_reap_interval,
        }
    }

    /// Return the existing `CaListener` for `d_addr`, starting a new one
    /// under the registry lock if none exists yet. The lock is held across
    /// the (cheap) bind calls, so at most one `CaListener` is ever started
    /// per `d_addr` even under concurrent lookups.
    pub async fn get_or_create(&self, d_addr: &str) -> std::io::Result<Arc<CaListener>> {
        let mut listeners = self.listeners.lock().await;
        if let Some(existing) = listeners.get(d_addr) {
            return Ok(existing.clone());
        }
        let listener =
            CaListener::start(d_addr.to_string(), self.queue_capacity, self.tunnel_reap_interval).await?;
        listeners.insert(d_addr.to_string(), listener.clone());
        Ok(listener)
    }

    /// `(dAddr, cRandPort)` for every currently-registered listener.
    pub async fn list(&self) -> Vec<(String, u16)> {
        self.listeners
            .lock()
            .await
            .values()
            .map(|l| (l.d_addr().to_string(), l.c_rand_port()))
            .collect()
    }

    /// Remove and stop every listener with no live tunnels.
    pub async fn reap_idle(&self) {
        let idle: Vec<Arc<CaListener>> = {
            let mut listeners = self.listeners.lock().await;
            let mut idle = Vec::new();
            let keys: Vec<String> = listeners.keys().cloned().collect();
            for key in keys {
                let is_active = match listeners.get(&key) {
                    Some(l) => l.active().await,
                    None => continue,
                };
                if !is_active {
                    if let Some(l) = listeners.remove(&key) {
                        idle.push(l);
                    }
                }
            }
            idle
        };
        for listener in idle {
            listener.stop().await;
        }
    }

    /// Remove and stop every registered listener.
    pub async fn stop_all(&self) {
        let all: Vec<Arc<CaListener>> = self.listeners.lock().await.drain().map(|(_, v)| v).collect();
        for listener in all {
            listener.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn get_or_create_returns_same_listener_for_same_d_addr() {
        let registry = CaListenerRegistry::new(10, Duration::from_secs(5));
        let first = registry.get_or_create("127.0.0.1:7777").await.unwrap();
        let second = registry.get_or_create("127.0.0.1:7777").await.unwrap();
        assert_eq!(first.c_rand_port(), second.c_rand_port());
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn reap_idle_removes_listener_with_no_tunnels() {
        let registry = CaListenerRegistry::new(10, Duration::from_secs(5));
        registry.get_or_create("127.0.0.1:7777").await.unwrap();
        assert_eq!(registry.list().await.len(), 1);

        registry.reap_idle().await;
        assert_eq!(registry.list().await.len(), 0);
    }
}
