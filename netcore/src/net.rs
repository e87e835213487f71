//! Shared connection engine used by both [`crate::server`] and [`crate::client`]: the
//! length-prefix framing loop, the outbound write queue, and dispatch of decoded frames through
//! the packet registry and connection-type hooks.
//!
//! Each connection owns exactly two long-lived tasks: an I/O task (the exclusive reader/writer of
//! the socket) and a dispatch task (drains decoded frames and runs handlers). This mirrors the
//! teacher's `Connection` future in spirit — alternating between awaiting inbound bytes and
//! draining the outbound queue — but expressed as ordinary `tokio::select!`-driven async tasks
//! rather than a hand-rolled `Future::poll` state machine, since a length-prefixed TCP stream
//! needs none of the self-referential polling the UDP/SRT socket-sharing model required.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Notify};

use crate::conntype::ConnTypeRegistry;
use crate::handler::{Admission, GateContext};
use crate::packets::{self, Action, MissingPacketAction};
use crate::registry::Registry;
use crate::state::{ConnState, Mode, Side, StateCell, TlsSecLevel};
use crate::value::Value;
use crate::wire::{self, CompressionConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire: {0}")]
    Wire(#[from] wire::Error),
    #[error("packet: {0}")]
    Packet(#[from] packets::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed")]
    Closed,
}

/// Per-connection state used only by the ping connection type. Lives here rather than inside
/// `PingConnectionType` itself because that type is a single shared instance registered once
/// per [`ConnTypeRegistry`], while this state is per-peer.
#[derive(Default)]
pub struct PingState {
    pending_data: parking_lot::Mutex<Option<Value>>,
    query: parking_lot::Mutex<Option<Value>>,
    pong: parking_lot::Mutex<Option<Value>>,
    pub pong_ready: Notify,
}

impl PingState {
    /// Stashes the caller-supplied payload the client's ping query should carry, read back by
    /// the ping connection type's `init` hook. Must be set before the connection's tasks are
    /// spawned to avoid racing the handshake.
    pub fn set_pending_data(&self, data: Value) {
        *self.pending_data.lock() = Some(data);
    }

    pub fn take_pending_data(&self) -> Option<Value> {
        self.pending_data.lock().take()
    }

    pub fn set_query(&self, v: Value) {
        *self.query.lock() = Some(v);
    }

    pub fn query(&self) -> Option<Value> {
        self.query.lock().clone()
    }

    pub fn set_pong(&self, v: Value) {
        *self.pong.lock() = Some(v);
        self.pong_ready.notify_waiters();
    }

    pub fn pong(&self) -> Option<Value> {
        self.pong.lock().clone()
    }
}

/// Everything a connection's dispatch logic needs, shared between its I/O and dispatch tasks and
/// handed out to application code as `Arc<ConnHandle>`.
pub struct ConnHandle {
    pub cid: Option<u64>,
    pub addr: std::net::SocketAddr,
    pub side: Side,
    pub registry: Arc<Registry>,
    pub conntypes: Arc<ConnTypeRegistry>,
    pub compression: CompressionConfig,
    pub autosync: bool,
    pub missingpacketaction: MissingPacketAction,
    /// The connection type the client side declares in `SetType`. Always `"classic"` for
    /// ordinary clients; `"ping"` for connections made through [`crate::ping::ping`].
    pub target_conntype: String,
    pub ping: PingState,
    pub metrics: Arc<crate::metrics::Metrics>,

    state: parking_lot::Mutex<StateCell>,
    mode: parking_lot::Mutex<Mode>,
    conntype: parking_lot::Mutex<String>,
    tls_seclevel: TlsSecLevel,

    outbound: mpsc::UnboundedSender<Vec<u8>>,
    mark_close: AtomicBool,

    pub handshake_done: Notify,
    pub closed: Notify,
}

impl ConnHandle {
    pub fn state(&self) -> ConnState {
        self.state.lock().get()
    }

    /// Transitions state, returning the previous state (see [`StateCell::transition`]).
    pub fn set_state(&self, next: ConnState) -> ConnState {
        let previous = self.state.lock().transition(next);
        if next == ConnState::Active || next == ConnState::LoggedIn {
            self.handshake_done.notify_waiters();
        }
        previous
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn conntype(&self) -> String {
        self.conntype.lock().clone()
    }

    pub fn set_conntype(&self, name: &str) {
        *self.conntype.lock() = name.to_owned();
    }

    pub fn tls_seclevel(&self) -> TlsSecLevel {
        self.tls_seclevel
    }

    fn gate_context<'a>(&self, conntype: &'a str) -> GateContext<'a> {
        GateContext {
            state: self.state(),
            side: self.side,
            mode: self.mode(),
            conntype,
            tls_seclevel: self.tls_seclevel,
        }
    }

    /// Encodes and enqueues `payload` under packet id `id`. For ids < 64 (internal packets) or
    /// when the connection type's `send` hook returns `false`, also runs the registered
    /// handler's gated `send`.
    pub fn send_message(&self, id: u32, payload: &Value) -> Result<(), Error> {
        if self.mark_close.load(Ordering::Acquire) && id != packets::ID_CLOSE_CONNECTION {
            return Err(Error::Closed);
        }

        let bytes = wire::encode(id, payload, self.compression)?;
        self.outbound.send(bytes).map_err(|_| Error::Closed)?;

        let suppressed = if id >= crate::registry::RESERVED_RANGE {
            let conntype = self.conntypes.get(&self.conntype()).ok();
            conntype.map(|ct| ct.send(self, payload, id)).unwrap_or(false)
        } else {
            false
        };

        if !suppressed {
            if let Some(handler) = self.registry.handler_of(id) {
                let conntype = self.conntype();
                match handler.dispatch_send(&self.gate_context(&conntype), payload, self.cid) {
                    Admission::Close => self.finalize_close("smartpacketinvalid"),
                    Admission::Ran | Admission::Dropped => {}
                }
            }
        }

        Ok(())
    }

    /// Queues a `CloseConnection` frame (best-effort) and marks the connection for teardown once
    /// the outbound queue drains. Safe to call more than once; only the first call's reason wins.
    pub fn begin_close(&self, reason: &str) {
        if self.mark_close.swap(true, Ordering::AcqRel) {
            return;
        }
        let payload = packets::close_connection_payload(Some(reason));
        if let Ok(bytes) = wire::encode(packets::ID_CLOSE_CONNECTION, &payload, self.compression) {
            let _ = self.outbound.send(bytes);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.mark_close.load(Ordering::Acquire)
    }

    /// Queues the close frame (if not already) and transitions to `Closed`, firing `on_close`
    /// exactly once regardless of how many times this is called.
    pub fn finalize_close(&self, reason: &str) {
        self.begin_close(reason);
        let previous = self.set_state(ConnState::Closed);
        if previous != ConnState::Closed {
            self.closed.notify_waiters();
        }
    }

    async fn wait_until(&self, notify: &Notify, pred: impl Fn() -> bool, timeout: Duration, what: &'static str) -> Result<(), Error> {
        if pred() {
            return Ok(());
        }
        tokio::time::timeout(timeout, async {
            loop {
                notify.notified().await;
                if pred() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout(what))
    }

    pub async fn wait_for_handshake(&self, timeout: Duration) -> Result<(), Error> {
        self.wait_until(
            &self.handshake_done,
            || matches!(self.state(), ConnState::Active | ConnState::LoggedIn),
            timeout,
            "handshake",
        )
        .await
    }

    pub async fn wait_for_close(&self, timeout: Duration) -> Result<(), Error> {
        self.wait_until(&self.closed, || self.state() == ConnState::Closed, timeout, "close")
            .await
    }
}

/// Parameters fixed at connection construction, shared by server and client.
pub struct EngineConfig {
    pub registry: Arc<Registry>,
    pub conntypes: Arc<ConnTypeRegistry>,
    pub compression: CompressionConfig,
    pub autosync: bool,
    pub missingpacketaction: MissingPacketAction,
    /// Connection type the client will declare in `SetType`. Ignored on the server side, which
    /// learns the type from the incoming `SetType` packet instead.
    pub target_conntype: String,
    /// Seed data for a ping client's initial query, consumed by the ping connection type's
    /// `init` hook. Always `None` outside of [`crate::ping::ping`].
    pub ping_data: Option<Value>,
    pub metrics: Arc<crate::metrics::Metrics>,
}

/// Spawns the I/O task and dispatch task for one accepted/connected socket, returning the shared
/// handle. `initial_state` and the first action (if any) are driven by the caller: the server
/// sends `Hello` right after spawning; the client just waits.
pub fn spawn(
    stream: tokio::net::TcpStream,
    addr: std::net::SocketAddr,
    side: Side,
    cid: Option<u64>,
    cfg: EngineConfig,
) -> Arc<ConnHandle> {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let ping = PingState::default();
    if let Some(data) = cfg.ping_data {
        ping.set_pending_data(data);
    }

    let handle = Arc::new(ConnHandle {
        cid,
        addr,
        side,
        registry: cfg.registry,
        conntypes: cfg.conntypes,
        compression: cfg.compression,
        autosync: cfg.autosync,
        missingpacketaction: cfg.missingpacketaction,
        target_conntype: cfg.target_conntype,
        ping,
        metrics: cfg.metrics,
        state: parking_lot::Mutex::new(StateCell::new(ConnState::Init)),
        mode: parking_lot::Mutex::new(Mode::NotSet),
        conntype: parking_lot::Mutex::new(crate::conntype::CONNTYPE_NOTSET.to_owned()),
        tls_seclevel: TlsSecLevel::None,
        outbound: outbound_tx,
        mark_close: AtomicBool::new(false),
        handshake_done: Notify::new(),
        closed: Notify::new(),
    });

    let (read_half, write_half) = stream.into_split();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<wire::Frame>();

    tokio::spawn(writer_task(write_half, outbound_rx, handle.clone()));
    tokio::spawn(reader_task(read_half, frame_tx, handle.clone()));
    tokio::spawn(dispatch_task(frame_rx, handle.clone()));

    handle
}

/// Drives the socket's write half off the outbound queue until the connection is marked for
/// close and the queue has drained, or a write fails. `outbound_rx`'s sender lives inside
/// `ConnHandle`, which this task holds an `Arc` of for its whole lifetime, so `recv` returning
/// `None` is not a close signal this task can ever observe on its own; `handle.closed` (fired
/// once by `finalize_close`) is what actually wakes it for a graceful shutdown.
async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    handle: Arc<ConnHandle>,
) {
    loop {
        if handle.is_closing() {
            while let Ok(bytes) = outbound_rx.try_recv() {
                handle.metrics.frames_sent.inc();
                handle.metrics.bytes_sent.add(bytes.len());
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            break;
        }

        tokio::select! {
            msg = outbound_rx.recv() => match msg {
                Some(bytes) => {
                    handle.metrics.frames_sent.inc();
                    handle.metrics.bytes_sent.add(bytes.len());
                    if let Err(err) = write_half.write_all(&bytes).await {
                        tracing::debug!(cid = ?handle.cid, %err, "write failed, closing connection");
                        break;
                    }
                }
                None => break,
            },
            _ = handle.closed.notified() => {}
        }
    }

    let _ = write_half.shutdown().await;
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    frame_tx: mpsc::UnboundedSender<wire::Frame>,
    handle: Arc<ConnHandle>,
) {
    let mut buf = Vec::new();
    let mut read_buf = [0u8; 8192];

    loop {
        let n = match read_half.read(&mut read_buf).await {
            Ok(0) => {
                tracing::trace!(cid = ?handle.cid, "peer closed connection");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(cid = ?handle.cid, %err, "read error, closing connection");
                break;
            }
        };
        handle.metrics.bytes_received.add(n);
        buf.extend_from_slice(&read_buf[..n]);

        loop {
            if buf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
            if (len as u64) > wire::MAX_PACKETLENGTH {
                tracing::warn!(cid = ?handle.cid, len, "frame exceeds MAX_PACKETLENGTH, closing");
                handle.finalize_close("frametoolarge");
                return;
            }
            if buf.len() < 4 + len {
                break;
            }

            let body = buf[4..4 + len].to_vec();
            buf.drain(0..4 + len);

            match wire::decode(&body) {
                Ok(frame) => {
                    handle.metrics.frames_received.inc();
                    if frame_tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(cid = ?handle.cid, %err, "failed to decode frame, closing");
                    handle.finalize_close("protocolerror");
                    return;
                }
            }
        }
    }

    handle.finalize_close("peerclosed");
}

async fn dispatch_task(mut frame_rx: mpsc::UnboundedReceiver<wire::Frame>, handle: Arc<ConnHandle>) {
    while let Some(frame) = frame_rx.recv().await {
        let result = AssertUnwindSafe(dispatch_one(&handle, &frame))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(cid = ?handle.cid, %err, "handler error");
            }
            Err(_) => {
                tracing::error!(cid = ?handle.cid, "handler panicked");
            }
        }

        if handle.state() == ConnState::Closed {
            break;
        }
    }
}

async fn dispatch_one(handle: &Arc<ConnHandle>, frame: &wire::Frame) -> Result<(), Error> {
    if frame.id < crate::registry::RESERVED_RANGE {
        return dispatch_internal(handle, frame);
    }

    let suppressed = match handle.conntypes.get(&handle.conntype()) {
        Ok(conntype) => conntype.receive(handle, &frame.payload, frame.id, frame.flags.bits()),
        Err(_) => false,
    };

    if !suppressed {
        if let Some(h) = handle.registry.handler_of(frame.id) {
            let conntype = handle.conntype();
            match h.dispatch_receive(&handle.gate_context(&conntype), &frame.payload, handle.cid) {
                Admission::Close => handle.finalize_close("smartpacketinvalid"),
                Admission::Ran | Admission::Dropped => {}
            }
        }
    }

    Ok(())
}

fn dispatch_internal(handle: &Arc<ConnHandle>, frame: &wire::Frame) -> Result<(), Error> {
    let actions = match frame.id {
        packets::ID_HELLO => packets::hello_received(&frame.payload, &handle.target_conntype)?,
        packets::ID_SET_TYPE => {
            let conntypes = handle.conntypes.clone();
            packets::set_type_received(&frame.payload, |name| conntypes.contains(name))?
        }
        packets::ID_HANDSHAKE => {
            let local = handle.registry.snapshot();
            packets::handshake_received(
                &frame.payload,
                &local,
                handle.autosync,
                handle.missingpacketaction,
            )?
        }
        packets::ID_HANDSHAKE_ACCEPT => packets::handshake_accept_received(&frame.payload)?,
        packets::ID_CLOSE_CONNECTION => packets::close_connection_received(&frame.payload),
        _ => return Ok(()),
    };

    run_actions(handle, actions)
}

#[cfg(test)]
/// Builds a standalone handle with no backing socket, for unit tests that only need to exercise
/// state/gate bookkeeping.
pub fn test_handle(side: Side) -> Arc<ConnHandle> {
    let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    Arc::new(ConnHandle {
        cid: match side {
            Side::Server => Some(1),
            Side::Client => None,
        },
        addr: "127.0.0.1:0".parse().unwrap(),
        side,
        registry: Arc::new(Registry::new()),
        conntypes: Arc::new(ConnTypeRegistry::new()),
        compression: CompressionConfig::default(),
        autosync: true,
        missingpacketaction: MissingPacketAction::CloseConnection,
        target_conntype: crate::conntype::CONNTYPE_CLASSIC.to_owned(),
        ping: PingState::default(),
        metrics: Arc::new(crate::metrics::Metrics::default()),
        state: parking_lot::Mutex::new(StateCell::new(ConnState::Init)),
        mode: parking_lot::Mutex::new(Mode::NotSet),
        conntype: parking_lot::Mutex::new(crate::conntype::CONNTYPE_NOTSET.to_owned()),
        tls_seclevel: TlsSecLevel::None,
        outbound: outbound_tx,
        mark_close: AtomicBool::new(false),
        handshake_done: Notify::new(),
        closed: Notify::new(),
    })
}

/// Executes the [`Action`]s returned by the pure handshake logic in `packets`, driving socket
/// sends and state transitions.
pub fn run_actions(handle: &Arc<ConnHandle>, actions: Vec<Action>) -> Result<(), Error> {
    for action in actions {
        match action {
            Action::Send { id, payload } => handle.send_message(id, &payload)?,
            Action::Transition(state) => {
                handle.set_state(state);
            }
            Action::RemapRegistry { name, id } => {
                let _ = handle.registry.remap(&name, id);
            }
            Action::SignalHandshakeComplete => {
                handle.set_state(ConnState::Active);
            }
            Action::InitConnType(conntype) => {
                handle.set_conntype(&conntype);
                if conntype == crate::conntype::CONNTYPE_CLASSIC {
                    match handle.side {
                        Side::Server => {
                            let snapshot = handle.registry.snapshot();
                            run_actions(handle, packets::classic_init(&snapshot))?;
                        }
                        // The client doesn't push Handshake itself, it only needs its own
                        // state to reach HandshakeWait1 so the gate on the inbound Handshake
                        // packet admits it.
                        Side::Client => {
                            run_actions(handle, vec![Action::Transition(ConnState::HandshakeWait1)])?;
                        }
                    }
                } else if let Ok(ct) = handle.conntypes.get(&conntype) {
                    ct.init(handle);
                }
            }
            Action::Close { reason } => handle.finalize_close(&reason),
        }
    }
    Ok(())
}
