//! Accept loop, connection table, broadcast and graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::addr;
use crate::conntype::ConnTypeRegistry;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::net::{self, ConnHandle, EngineConfig};
use crate::packets;
use crate::registry::Registry;
use crate::signal::ShutdownListener;
use crate::state::{ConnState, Side};
use crate::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(#[from] crate::config::Error),
    #[error("address: {0}")]
    Addr(#[from] addr::Error),
    #[error(transparent)]
    Net(#[from] net::Error),
}

/// The process-wide table of connected clients, keyed by a monotone `cid` allocated starting at
/// 1 under a mutex.
struct ConnectionPool {
    next_cid: AtomicU64,
    conns: Mutex<HashMap<u64, Arc<ConnHandle>>>,
    metrics: Arc<Metrics>,
}

impl ConnectionPool {
    fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            next_cid: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    fn alloc_cid(&self) -> u64 {
        self.next_cid.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, cid: u64, handle: Arc<ConnHandle>) {
        self.conns.lock().insert(cid, handle);
        self.metrics.active_connections.inc();
    }

    fn remove(&self, cid: u64) {
        if self.conns.lock().remove(&cid).is_some() {
            self.metrics.active_connections.dec();
        }
    }

    fn get(&self, cid: u64) -> Option<Arc<ConnHandle>> {
        self.conns.lock().get(&cid).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<ConnHandle>> {
        self.conns.lock().values().cloned().collect()
    }
}

/// A running server: the listening socket, packet/connection-type registries, and the live
/// connection table.
pub struct Server {
    pub registry: Arc<Registry>,
    pub conntypes: Arc<ConnTypeRegistry>,
    pub metrics: Arc<Metrics>,
    config: Arc<Config>,
    pool: Arc<ConnectionPool>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let metrics = Arc::new(Metrics::default());
        Self {
            registry: Arc::new(Registry::new()),
            conntypes: Arc::new(ConnTypeRegistry::new()),
            metrics: metrics.clone(),
            config: Arc::new(config),
            pool: Arc::new(ConnectionPool::new(metrics)),
        }
    }

    fn engine_config(&self) -> Result<EngineConfig, Error> {
        Ok(EngineConfig {
            registry: self.registry.clone(),
            conntypes: self.conntypes.clone(),
            compression: self.config.net.compress.into(),
            autosync: self.config.net.registry.autosync,
            missingpacketaction: self.config.missingpacketaction()?,
            // The server learns the connection type from the client's `SetType`, so this is
            // never consulted; `classic` is just a harmless default.
            target_conntype: crate::conntype::CONNTYPE_CLASSIC.to_owned(),
            ping_data: None,
            metrics: self.metrics.clone(),
        })
    }

    /// Binds the listening socket and runs the accept loop until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let raw = match &self.config.net.server.addr {
            Some(addr) => addr.clone(),
            None => format!("{}:{}", self.config.net.server.host, self.config.net.server.port),
        };
        let bind_addr = addr::parse(&raw, self.config.net.server.port)?.to_string();

        let listener = TcpListener::bind(&bind_addr).await?;
        tracing::info!(addr = %bind_addr, "listening");

        let shutdown = ShutdownListener::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    if let Err(err) = self.accept(stream, peer_addr) {
                        tracing::warn!(%err, "failed to accept connection");
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received, closing connections");
                    self.shutdown(Duration::from_secs(5)).await;
                    return Ok(());
                }
            }
        }
    }

    fn accept(&self, stream: tokio::net::TcpStream, addr: std::net::SocketAddr) -> Result<(), Error> {
        stream.set_nodelay(true).ok();

        let cid = self.pool.alloc_cid();
        let handle = net::spawn(stream, addr, Side::Server, Some(cid), self.engine_config()?);
        self.pool.insert(cid, handle.clone());

        tracing::debug!(cid, %addr, "accepted connection");

        let previous = handle.set_state(ConnState::HelloWait);
        let _ = previous;

        let hello = Value::map([
            ("version", Value::String(packets::VERSION.to_owned())),
            ("protoversion", Value::Uint(packets::PROTOVERSION as u64)),
        ]);
        if let Err(err) = handle.send_message(packets::ID_HELLO, &hello) {
            tracing::debug!(cid, %err, "failed to send hello");
        }
        for action in packets::hello_sent() {
            let _ = net::run_actions(&handle, vec![action]);
        }

        let pool = self.pool.clone();
        tokio::spawn(async move {
            let _ = handle.wait_for_close(Duration::from_secs(3600)).await;
            pool.remove(cid);
        });

        Ok(())
    }

    /// Sends `payload` under `id` to one connection, if still present.
    pub fn send_message(&self, cid: u64, id: u32, payload: &Value) -> Result<(), Error> {
        let handle = self.pool.get(cid).ok_or(net::Error::Closed)?;
        handle.send_message(id, payload)?;
        Ok(())
    }

    /// Sends `payload` under `id` to every connected client except those in `exclude`.
    ///
    /// Holds no lock across the sends themselves: a per-connection failure (already
    /// disconnected, queue closed) is logged and skipped, not propagated.
    pub fn broadcast(&self, id: u32, payload: &Value, exclude: &[u64]) {
        for handle in self.pool.snapshot() {
            if let Some(cid) = handle.cid {
                if exclude.contains(&cid) {
                    continue;
                }
            }
            if let Err(err) = handle.send_message(id, payload) {
                tracing::debug!(cid = ?handle.cid, %err, "broadcast send failed");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.pool.conns.lock().len()
    }

    /// Issues `CloseConnection` to every known client (best-effort) and waits up to `timeout`
    /// for the connection table to drain.
    async fn shutdown(&self, timeout: Duration) {
        for handle in self.pool.snapshot() {
            handle.begin_close("servershutdown");
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
