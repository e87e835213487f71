//! Client core: connect, then the same I/O+dispatch task pair the server uses, mirrored.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::addr;
use crate::config::Config;
use crate::conntype::ConnTypeRegistry;
use crate::metrics::Metrics;
use crate::net::{self, ConnHandle, EngineConfig};
use crate::registry::Registry;
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

/// A single-use client connection. Mirrors the server's per-connection engine but owns exactly
/// one [`ConnHandle`] rather than a connection table.
pub struct Client {
    pub registry: Arc<Registry>,
    pub conntypes: Arc<ConnTypeRegistry>,
    pub metrics: Arc<Metrics>,
    handle: Arc<ConnHandle>,
}

impl Client {
    /// Opens a TCP connection to `addr` (overriding `config.net.client`'s default target when
    /// given explicitly) and spawns its I/O and dispatch tasks. Returns once the socket is
    /// connected; use [`Client::wait_for_connection`] to wait out the handshake.
    ///
    /// Declares `"classic"` as the connection type; see [`Client::connect_with`] for callers
    /// that need a different one (the ping extension, for instance).
    pub async fn connect(
        addr: Option<&str>,
        config: &Config,
        registry: Arc<Registry>,
        conntypes: Arc<ConnTypeRegistry>,
    ) -> Result<Arc<Self>, Error> {
        Self::connect_with(
            addr,
            config,
            registry,
            conntypes,
            crate::conntype::CONNTYPE_CLASSIC,
            None,
        )
        .await
    }

    /// As [`Client::connect`], but lets the caller pick the connection type declared in
    /// `SetType` and seed per-connection-type data (consumed by that type's `init` hook)
    /// before the connection's tasks start running.
    pub async fn connect_with(
        addr: Option<&str>,
        config: &Config,
        registry: Arc<Registry>,
        conntypes: Arc<ConnTypeRegistry>,
        target_conntype: &str,
        conntype_data: Option<Value>,
    ) -> Result<Arc<Self>, Error> {
        let raw = match addr.map(str::to_owned).or_else(|| config.net.client.addr.clone()) {
            Some(addr) => addr,
            None => format!("{}:{}", config.net.client.host, config.net.client.port),
        };
        let connect_addr = addr::parse(&raw, config.net.client.port)?.to_string();

        let stream = TcpStream::connect(&connect_addr).await?;
        stream.set_nodelay(true).ok();
        let peer_addr = stream.peer_addr()?;

        let metrics = Arc::new(Metrics::default());
        let engine_cfg = EngineConfig {
            registry: registry.clone(),
            conntypes: conntypes.clone(),
            compression: config.net.compress.into(),
            autosync: config.net.registry.autosync,
            missingpacketaction: config.missingpacketaction()?,
            target_conntype: target_conntype.to_owned(),
            ping_data: conntype_data,
            metrics: metrics.clone(),
        };

        let handle = net::spawn(stream, peer_addr, Side::Client, None, engine_cfg);
        handle.set_state(ConnState::HelloWait);

        tracing::debug!(addr = %connect_addr, target_conntype, "connected");

        Ok(Arc::new(Self {
            registry,
            conntypes,
            metrics,
            handle,
        }))
    }

    /// Waits until the handshake has completed (state reaches `Active`/`LoggedIn`).
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), Error> {
        self.handle.wait_for_handshake(timeout).await.map_err(Into::into)
    }

    pub async fn wait_for_close(&self, timeout: Duration) -> Result<(), Error> {
        self.handle.wait_for_close(timeout).await.map_err(Into::into)
    }

    pub fn send_message(&self, id: u32, payload: &Value) -> Result<(), Error> {
        self.handle.send_message(id, payload).map_err(Into::into)
    }

    pub fn close(&self, reason: &str) {
        self.handle.finalize_close(reason);
    }

    pub fn state(&self) -> ConnState {
        self.handle.state()
    }

    pub fn handle(&self) -> &Arc<ConnHandle> {
        &self.handle
    }
}
