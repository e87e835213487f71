//! Packet handler interface and the "smart" declarative gate wrapped around it.

use crate::state::{ConnState, Mode, Side, TlsSecLevel};
use crate::value::Value;

/// What a gated handler should do when a receive/send doesn't satisfy its gate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvalidAction {
    /// Silently drop the message.
    Ignore,
    /// Terminate the connection with reason `smartpacketinvalid`.
    Close,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid_action must be \"ignore\" or \"close\", got {0:?}")]
    BadInvalidAction(String),
}

impl std::str::FromStr for InvalidAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(InvalidAction::Ignore),
            "close" => Ok(InvalidAction::Close),
            other => Err(Error::BadInvalidAction(other.to_owned())),
        }
    }
}

/// A snapshot of connection state consulted when evaluating a [`Gate`]. Built fresh by the
/// dispatcher for every receive/send from either the local connection record (server side) or
/// the peer's record (client side).
#[derive(Copy, Clone, Debug)]
pub struct GateContext<'a> {
    pub state: ConnState,
    pub side: Side,
    pub mode: Mode,
    pub conntype: &'a str,
    pub tls_seclevel: TlsSecLevel,
}

/// Declarative admission policy for a packet handler, evaluated once per receive and once per
/// send.
#[derive(Clone, Debug)]
pub struct Gate {
    pub state: ConnState,
    pub side: Option<Side>,
    pub mode: Option<Mode>,
    pub conntype: Option<&'static str>,
    pub min_tls_seclevel: TlsSecLevel,
    pub invalid_action: InvalidAction,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            state: ConnState::Active,
            side: None,
            mode: None,
            conntype: None,
            min_tls_seclevel: TlsSecLevel::None,
            invalid_action: InvalidAction::Ignore,
        }
    }
}

impl Gate {
    pub fn with_state(mut self, state: ConnState) -> Self {
        self.state = state;
        self
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_conntype(mut self, conntype: &'static str) -> Self {
        self.conntype = Some(conntype);
        self
    }

    pub fn with_invalid_action(mut self, action: InvalidAction) -> Self {
        self.invalid_action = action;
        self
    }

    /// Checks the gate against `ctx` for a receive. `min_tls_seclevel` is a send-only
    /// requirement and is not consulted here.
    pub fn admits_receive(&self, ctx: &GateContext) -> bool {
        self.admits_common(ctx)
    }

    /// Checks the gate against `ctx` for a send, additionally enforcing `min_tls_seclevel`.
    pub fn admits_send(&self, ctx: &GateContext) -> bool {
        self.admits_common(ctx) && ctx.tls_seclevel >= self.min_tls_seclevel
    }

    fn admits_common(&self, ctx: &GateContext) -> bool {
        if ctx.state != self.state {
            return false;
        }
        if let Some(side) = self.side {
            if side != ctx.side {
                return false;
            }
        }
        if let Some(mode) = self.mode {
            if mode != ctx.mode {
                return false;
            }
        }
        if let Some(conntype) = self.conntype {
            if conntype != ctx.conntype {
                return false;
            }
        }
        true
    }
}

/// A reason a gated handler asked its connection to close.
pub const REASON_SMARTPACKET_INVALID: &str = "smartpacketinvalid";

/// The outcome of a gated dispatch.
pub enum Admission {
    /// The gate passed; the handler ran.
    Ran,
    /// The gate failed and `invalid_action` was `ignore`.
    Dropped,
    /// The gate failed and `invalid_action` was `close`; the caller must close the connection
    /// with [`REASON_SMARTPACKET_INVALID`].
    Close,
}

/// A packet's application-level behavior.
pub trait PacketHandler: Send + Sync {
    fn receive(&self, msg: &Value, cid: Option<u64>);
    fn send(&self, msg: &Value, cid: Option<u64>);
}

/// Wraps a [`PacketHandler`] with a [`Gate`], matching the distilled spec's "smart packet"
/// behavior: the gate is consulted before every receive/send, and its `invalid_action` decides
/// whether a failing check drops the message or closes the connection.
pub struct SmartHandler<H> {
    inner: H,
    gate: Gate,
}

impl<H: PacketHandler> SmartHandler<H> {
    pub fn new(inner: H, gate: Gate) -> Self {
        Self { inner, gate }
    }

    pub fn on_receive(&self, ctx: &GateContext, msg: &Value, cid: Option<u64>) -> Admission {
        if self.gate.admits_receive(ctx) {
            self.inner.receive(msg, cid);
            Admission::Ran
        } else {
            self.deny()
        }
    }

    pub fn on_send(&self, ctx: &GateContext, msg: &Value, cid: Option<u64>) -> Admission {
        if self.gate.admits_send(ctx) {
            self.inner.send(msg, cid);
            Admission::Ran
        } else {
            self.deny()
        }
    }

    fn deny(&self) -> Admission {
        match self.gate.invalid_action {
            InvalidAction::Ignore => Admission::Dropped,
            InvalidAction::Close => Admission::Close,
        }
    }
}

/// Object-safe entry point stored in the packet registry: every registered packet, whether
/// gated or not, is reachable through this trait.
pub trait DynPacketHandler: Send + Sync {
    fn dispatch_receive(&self, ctx: &GateContext, msg: &Value, cid: Option<u64>) -> Admission;
    fn dispatch_send(&self, ctx: &GateContext, msg: &Value, cid: Option<u64>) -> Admission;
}

impl<H: PacketHandler> DynPacketHandler for SmartHandler<H> {
    fn dispatch_receive(&self, ctx: &GateContext, msg: &Value, cid: Option<u64>) -> Admission {
        self.on_receive(ctx, msg, cid)
    }

    fn dispatch_send(&self, ctx: &GateContext, msg: &Value, cid: Option<u64>) -> Admission {
        self.on_send(ctx, msg, cid)
    }
}

/// Type-erased handler entry, as stored by [`crate::registry::Registry`].
pub type DynHandler = dyn DynPacketHandler;
