//! Connection-type registry: name to hook-set mapping, consulted once a peer's chosen type is
//! known.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::net::ConnHandle;
use crate::value::Value;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown connection type {0:?}")]
    Unknown(String),
}

/// Placeholder connection type name used before `SetType` has been processed.
pub const CONNTYPE_NOTSET: &str = "_notset";
/// The built-in connection type driving the handshake.
pub const CONNTYPE_CLASSIC: &str = "classic";
/// The built-in connection type for the ping extension.
pub const CONNTYPE_PING: &str = "ping";

/// The hook set a connection type provides. `handle` carries everything a hook needs to send
/// back on the same connection (its `cid` is `None` on the client side, `Some` on the server
/// side).
pub trait ConnectionType: Send + Sync {
    /// Invoked once the peer's type is known: server on receipt of `SetType`, client on receipt
    /// of `Hello`.
    fn init(&self, _handle: &ConnHandle) {}

    /// Called for every application packet (id >= 64) after decode. Returning `true` marks the
    /// packet fully handled, suppressing further registry dispatch.
    fn receive(&self, _handle: &ConnHandle, _msg: &Value, _pid: u32, _flags: u16) -> bool {
        false
    }

    /// Invoked during send. Returning `true` suppresses the per-packet `on_send` callback for
    /// this message.
    fn send(&self, _handle: &ConnHandle, _payload: &Value, _pid: u32) -> bool {
        false
    }
}

/// A no-op connection type, used as the placeholder before the handshake's `SetType` step and
/// as a base for types that only care about a subset of hooks.
pub struct NotSet;

impl ConnectionType for NotSet {}

#[derive(Default)]
pub struct ConnTypeRegistry {
    types: Mutex<HashMap<String, Arc<dyn ConnectionType>>>,
}

impl ConnTypeRegistry {
    pub fn new() -> Self {
        let reg = Self {
            types: Mutex::new(HashMap::new()),
        };
        reg.register(CONNTYPE_NOTSET, Arc::new(NotSet));
        // "classic" never reaches `ConnectionType::init`/`receive`/`send` (its handshake is
        // wired directly into `net::run_actions`), but it still has to be a known name for
        // `SetType`'s validation and the client's declared target to pass.
        reg.register(CONNTYPE_CLASSIC, Arc::new(NotSet));
        reg
    }

    pub fn register(&self, name: &str, conntype: Arc<dyn ConnectionType>) {
        self.types.lock().insert(name.to_owned(), conntype);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ConnectionType>, Error> {
        self.types
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Unknown(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.lock().contains_key(name)
    }
}
