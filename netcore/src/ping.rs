//! The `ping` connection type: a single request/reply exchange (ids 64/65) used to measure
//! round-trip latency and fetch lightweight server info, without needing the client to know the
//! server's packet table. Both sides skip the classic handshake's `Handshake`/`HandshakeAccept`
//! exchange entirely and go straight to `Active` once the connection type is chosen.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::client::Client;
use crate::config::Config;
use crate::conntype::{ConnTypeRegistry, ConnectionType, CONNTYPE_PING};
use crate::net::ConnHandle;
use crate::registry::Registry;
use crate::state::{ConnState, Mode, Side};
use crate::value::Value;

pub const ID_PING: u32 = 64;
pub const ID_PONG: u32 = 65;

pub const REASON_PING_COMPLETE: &str = "pingcomplete";
pub const REASON_PING_INVALID_SIDE: &str = "pinginvalidside";
pub const REASON_INVALID_PING_PACKET: &str = "invalidpingpacket";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(#[from] crate::config::Error),
    #[error(transparent)]
    Net(#[from] crate::net::Error),
    #[error(transparent)]
    Client(#[from] crate::client::Error),
    #[error("timed out waiting for pong")]
    Timeout,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Server-supplied data merged into every reply, alongside the connection type's own version
/// info. `static_data` covers things that don't change between requests, like a server name;
/// `dynamic` is invoked per query for values that do, like a connected-client count.
#[derive(Clone)]
pub struct PingData {
    pub static_data: Value,
    pub dynamic: Option<Arc<dyn Fn(&Value, Option<u64>) -> Value + Send + Sync>>,
}

impl Default for PingData {
    /// `static_data` defaults to an empty map, not `Value::Nil`: `Value::merge` replaces
    /// wholesale when either side isn't a map, so a `Nil` default would blank out everything
    /// merged in before it.
    fn default() -> Self {
        Self {
            static_data: Value::map([]),
            dynamic: None,
        }
    }
}

/// The connection type driving the ping sub-protocol. Register under
/// [`crate::conntype::CONNTYPE_PING`] on a server to make it pingable, and the same name on a
/// client to let it initiate pings (normally via [`ping`], which does this for you).
pub struct PingConnectionType {
    writeback: bool,
    data: PingData,
}

impl PingConnectionType {
    pub fn new(writeback: bool, data: PingData) -> Self {
        Self { writeback, data }
    }

    fn build_reply(&self, query: &Value, cid: Option<u64>) -> Value {
        let mut reply = Value::map([]);
        if self.writeback {
            reply = reply.merge(Value::map([("oldmsg", query.clone())]));
        }
        if let Some(dynamic) = &self.data.dynamic {
            reply = reply.merge(dynamic(query, cid));
        }
        reply = reply.merge(self.data.static_data.clone());
        reply = reply.merge(version_info());
        reply
    }
}

fn version_info() -> Value {
    Value::map([(
        env!("CARGO_PKG_NAME"),
        Value::map([
            ("version", Value::String(crate::packets::VERSION.to_owned())),
            ("protoversion", Value::Uint(crate::packets::PROTOVERSION as u64)),
        ]),
    )])
}

impl ConnectionType for PingConnectionType {
    /// Skips the classic handshake entirely: the connection is `Active` as soon as the type is
    /// known. On the client this also fires off the query carrying `{"time": <now>}` merged over
    /// whatever seed data [`ping`] stashed via `ConnHandle::ping`.
    fn init(&self, handle: &ConnHandle) {
        match handle.side {
            Side::Client => {
                let seed = handle.ping.take_pending_data().unwrap_or_else(|| Value::map([]));
                let query = seed.merge(Value::map([("time", Value::Float(now_secs()))]));
                handle.ping.set_query(query.clone());
                handle.set_mode(Mode::Ping);
                handle.set_state(ConnState::Active);
                if let Err(err) = handle.send_message(ID_PING, &query) {
                    tracing::debug!(%err, "failed to send ping query");
                }
            }
            Side::Server => {
                handle.set_state(ConnState::Active);
            }
        }
    }

    fn receive(&self, handle: &ConnHandle, msg: &Value, pid: u32, _flags: u16) -> bool {
        match pid {
            ID_PING => {
                if handle.side != Side::Server {
                    handle.finalize_close(REASON_PING_INVALID_SIDE);
                    return true;
                }
                handle.set_mode(Mode::Ping);
                let reply = self.build_reply(msg, handle.cid);
                if let Err(err) = handle.send_message(ID_PONG, &reply) {
                    tracing::debug!(%err, "failed to send pong");
                }
                true
            }
            ID_PONG => {
                if handle.side != Side::Client {
                    handle.finalize_close(REASON_PING_INVALID_SIDE);
                    return true;
                }
                handle.ping.set_pong(msg.clone());
                handle.finalize_close(REASON_PING_COMPLETE);
                true
            }
            _ => {
                tracing::warn!(pid, "unexpected packet on ping connection");
                handle.finalize_close(REASON_INVALID_PING_PACKET);
                true
            }
        }
    }

    fn send(&self, handle: &ConnHandle, _payload: &Value, pid: u32) -> bool {
        if pid == ID_PING {
            handle.set_mode(Mode::Ping);
        }
        true
    }
}

/// Registers the ping connection type, normally called once on a server wanting to be pingable.
/// `writeback` and `data` come from application config and app-specific hooks respectively.
pub fn register(conntypes: &ConnTypeRegistry, writeback: bool, data: PingData) {
    conntypes.register(CONNTYPE_PING, Arc::new(PingConnectionType::new(writeback, data)));
}

/// Waits up to `timeout` for a pong to arrive on `handle`, returning the raw reply payload.
pub async fn wait_for_pong(handle: &ConnHandle, timeout: Duration) -> Result<Value, Error> {
    if let Some(pong) = handle.ping.pong() {
        return Ok(pong);
    }
    tokio::time::timeout(timeout, async {
        loop {
            handle.ping.pong_ready.notified().await;
            if let Some(pong) = handle.ping.pong() {
                return pong;
            }
        }
    })
    .await
    .map_err(|_| Error::Timeout)
}

/// The outcome of a [`ping`] call: the server's (possibly merged) reply, plus the measured
/// round-trip time.
#[derive(Debug, Clone)]
pub struct PingResult {
    pub reply: Value,
    pub delay: Duration,
}

/// Pings `addr`: connects as a `ping`-typed client, sends `data` (with `time` always overridden
/// to the moment of connection), and waits up to `timeout` for the reply.
pub async fn ping(
    addr: &str,
    timeout: Duration,
    config: &Config,
    registry: Arc<Registry>,
    conntypes: Arc<ConnTypeRegistry>,
    data: Option<Value>,
) -> Result<PingResult, Error> {
    if !conntypes.contains(CONNTYPE_PING) {
        register(&conntypes, config.ping.writeback, PingData::default());
    }

    let client = Client::connect_with(
        Some(addr),
        config,
        registry,
        conntypes,
        CONNTYPE_PING,
        data,
    )
    .await?;

    let pong = wait_for_pong(client.handle(), timeout).await?;
    let recvtime = now_secs();

    let sent_at = client
        .handle()
        .ping
        .query()
        .as_ref()
        .and_then(|q| q.get("time"))
        .and_then(Value::as_f64)
        .unwrap_or(recvtime);
    let delay = Duration::from_secs_f64((recvtime - sent_at).max(0.0));

    let reply = pong.merge(Value::map([
        ("recvtime", Value::Float(recvtime)),
        ("delay", Value::Float(delay.as_secs_f64())),
    ]));

    Ok(PingResult { reply, delay })
}
