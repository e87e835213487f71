//! A framed, length-prefixed, MessagePack-based bidirectional network protocol runtime: a
//! connection-lifecycle state machine, a symmetric handshake, multiplexed per-connection I/O,
//! packet/connection-type registries, and a ping sub-protocol extension.

pub mod addr;
pub mod client;
pub mod config;
pub mod conntype;
pub mod handler;
pub mod metrics;
pub mod net;
pub mod packets;
pub mod ping;
pub mod registry;
pub mod server;
pub mod signal;
pub mod state;
pub mod value;
pub mod wire;
