//! A bounded pool of [`Connector`]s to a single `host:port`, with a
//! watchdog task that reconnects the pool after the peer drops (`§4.7`).

use std::sync::Arc;
use std::time::Duration;

use frostbox_common::CoreError;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, instrument, warn};

use crate::connector::Connector;

/// Watchdog polling period (`§4.7`: "configurable period, default 10s").
pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

struct Inner {
    host: String,
    port: u16,
    capacity: usize,
    idle: Mutex<Vec<Connector>>,
    available: mpsc::Sender<()>,
    /// Receiver side lives behind a mutex because `Get` is called from
    /// multiple caller tasks; only one waiter dequeues a permit at a time.
    available_rx: Mutex<mpsc::Receiver<()>>,
    connected: watch::Sender<bool>,
}

/// A fixed-capacity pool of live connectors to one replica endpoint.
///
/// `connected()` reflects the watchdog's most recent health judgment. While
/// disconnected, [`ConnectorPool::get`] fails fast with
/// [`CoreError::RemoteUnavailable`] rather than blocking forever waiting
/// for a connector that does not exist.
pub struct ConnectorPool {
    inner: Arc<Inner>,
    shutdown: watch::Sender<()>,
}

impl ConnectorPool {
    /// Connects `capacity` connectors up front and starts the watchdog.
    /// The pool starts disconnected if the initial connection attempt
    /// fails; the watchdog will keep retrying at `watchdog_period`.
    #[instrument(skip_all, fields(%port, capacity))]
    pub async fn connect(host: impl Into<String>, port: u16, capacity: usize, watchdog_period: Duration) -> Self {
        let host = host.into();
        let (available_tx, available_rx) = mpsc::channel(capacity.max(1));
        let (connected_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            host,
            port,
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            available: available_tx,
            available_rx: Mutex::new(available_rx),
            connected: connected_tx,
        });

        if Self::fill(&inner).await.is_ok() {
            inner.connected.send_replace(true);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let watchdog_inner = Arc::clone(&inner);
        tokio::spawn(watchdog(watchdog_inner, watchdog_period, shutdown_rx));

        Self { inner, shutdown: shutdown_tx }
    }

    /// Replaces the idle set with `capacity` freshly connected connectors.
    async fn fill(inner: &Arc<Inner>) -> Result<(), CoreError> {
        let mut fresh = Vec::with_capacity(inner.capacity);
        for _ in 0..inner.capacity {
            fresh.push(Connector::connect(&inner.host, inner.port).await?);
        }
        let mut idle = inner.idle.lock().await;
        idle.clear();
        idle.extend(fresh);
        for _ in 0..idle.len() {
            let _ = inner.available.try_send(());
        }
        Ok(())
    }

    pub fn connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Waits for an available connector. Fails immediately with
    /// [`CoreError::RemoteUnavailable`] if the pool is currently marked
    /// disconnected, rather than waiting on a permit that will never come.
    pub async fn get(&self) -> Result<Connector, CoreError> {
        if !self.connected() {
            return Err(CoreError::RemoteUnavailable);
        }
        self.inner
            .available_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(CoreError::RemoteUnavailable)?;
        let mut idle = self.inner.idle.lock().await;
        idle.pop().ok_or(CoreError::RemoteUnavailable)
    }

    /// Returns a connector to the pool, or drops it (and its permit) if it
    /// came back unhealthy.
    pub async fn put_back(&self, connector: Connector) {
        if !connector.is_healthy() {
            return;
        }
        self.inner.idle.lock().await.push(connector);
        let _ = self.inner.available.try_send(());
    }
}

impl Drop for ConnectorPool {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Pings one idle connector at each tick to judge pool health; reconnects
/// the whole pool once a disconnected tick observes a healthy peer again
/// (`§4.7`).
#[instrument(skip_all, fields(host = %inner.host, port = inner.port))]
async fn watchdog(inner: Arc<Inner>, period: Duration, mut shutdown: watch::Receiver<()>) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // first tick fires immediately; skip it, state is fresh
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("watchdog cancelled, draining pool");
                inner.idle.lock().await.clear();
                return;
            }
            _ = ticker.tick() => {}
        }

        if *inner.connected.borrow() {
            let candidate = {
                let mut idle = inner.idle.lock().await;
                idle.pop()
            };
            match candidate {
                Some(mut connector) => {
                    let healthy = connector.ping().await;
                    if healthy {
                        inner.idle.lock().await.push(connector);
                        let _ = inner.available.try_send(());
                    } else {
                        warn!("watchdog ping failed, marking pool disconnected");
                        inner.connected.send_replace(false);
                        inner.idle.lock().await.clear();
                    }
                }
                None => {
                    // Every connector is checked out; nothing to probe this
                    // tick. Leave the health judgment as-is.
                }
            }
        } else {
            if let Ok(mut probe) = Connector::connect(&inner.host, inner.port).await {
                if probe.ping().await {
                    drop(probe);
                    if ConnectorPool::fill(&inner).await.is_ok() {
                        info!("watchdog reconnected pool");
                        inner.connected.send_replace(true);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use frostbox_server::{bind_listener, serve, ServerConfig};
    use frostbox_store::DataStore;
    use tokio::sync::watch;

    use super::*;

    async fn spawn_server() -> SocketAddr {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::new(dir.path()));
        store.open().unwrap();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        tokio::spawn(serve(listener, store, Arc::new(ServerConfig::default()), shutdown_rx));
        std::mem::forget(dir);
        std::mem::forget(shutdown_tx);
        addr
    }

    #[tokio::test]
    async fn get_and_put_back_round_trip() {
        let addr = spawn_server().await;
        let pool = ConnectorPool::connect(addr.ip().to_string(), addr.port(), 2, Duration::from_secs(60)).await;
        assert!(pool.connected());

        let mut connector = pool.get().await.unwrap();
        assert!(connector.ping().await);
        pool.put_back(connector).await;

        let connector = pool.get().await.unwrap();
        pool.put_back(connector).await;
    }

    #[tokio::test]
    async fn pool_fails_fast_when_initial_connect_fails() {
        let pool = ConnectorPool::connect("127.0.0.1", 1, 1, Duration::from_secs(60)).await;
        assert!(!pool.connected());
        assert!(matches!(pool.get().await, Err(CoreError::RemoteUnavailable)));
    }

    #[tokio::test]
    async fn watchdog_marks_pool_disconnected_after_peer_drops() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    // Hold the connection open just long enough for the pool
                    // to connect, then drop it so the next ping observes EOF.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    drop(stream);
                });
            }
        });

        let pool = ConnectorPool::connect(addr.ip().to_string(), addr.port(), 1, Duration::from_millis(100)).await;
        assert!(pool.connected());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!pool.connected());
    }
}
