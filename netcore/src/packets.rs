//! Internal packets driving the handshake: Hello, SetType, Handshake, HandshakeAccept and
//! CloseConnection.
//!
//! These functions are deliberately free of I/O and connection bookkeeping: each takes the
//! inbound payload plus whatever local state it needs to decide, and returns the list of
//! [`Action`]s the caller (server or client core) must carry out. Keeping the decision logic
//! pure makes it exercisable without a running socket.

use std::collections::HashMap;

use crate::conntype::CONNTYPE_CLASSIC;
use crate::state::ConnState;
use crate::value::Value;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOVERSION: u32 = 2;

pub const ID_HELLO: u32 = 1;
pub const ID_SET_TYPE: u32 = 2;
pub const ID_HANDSHAKE: u32 = 3;
pub const ID_HANDSHAKE_ACCEPT: u32 = 4;
pub const ID_CLOSE_CONNECTION: u32 = 16;

pub const REASON_PROTOVERSION_MISMATCH: &str = "protoversionmismatch";
pub const REASON_UNKNOWN_CONNTYPE: &str = "unknownconntype";
pub const REASON_PACKETREG_MISMATCH: &str = "packetregmismatch";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

/// What the caller must do in response to an internal packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send { id: u32, payload: Value },
    Transition(ConnState),
    RemapRegistry { name: String, id: u32 },
    SignalHandshakeComplete,
    InitConnType(String),
    Close { reason: String },
}

/// What happens when a peer's packet registry doesn't match ours during the handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MissingPacketAction {
    CloseConnection,
    Ignore,
}

fn protoversion_of(payload: &Value) -> Result<u32, Error> {
    payload
        .get("protoversion")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or(Error::Malformed("protoversion"))
}

/// Client-side: a `Hello` arrived from the server. Verifies the protocol version, then replies
/// with `SetType` declaring `chosen_conntype` and advances to `WaitType`.
pub fn hello_received(payload: &Value, chosen_conntype: &str) -> Result<Vec<Action>, Error> {
    let remote_protoversion = protoversion_of(payload)?;
    if remote_protoversion != PROTOVERSION {
        return Ok(vec![Action::Close {
            reason: REASON_PROTOVERSION_MISMATCH.to_owned(),
        }]);
    }

    Ok(vec![
        Action::Send {
            id: ID_SET_TYPE,
            payload: Value::map([("conntype", Value::String(chosen_conntype.to_owned()))]),
        },
        Action::Transition(ConnState::WaitType),
        Action::InitConnType(chosen_conntype.to_owned()),
    ])
}

/// Server-side, invoked immediately on sending `Hello` to a client: the remote (client) record's
/// state is optimistically advanced, mirroring the client's own transition once it processes the
/// packet.
pub fn hello_sent() -> Vec<Action> {
    vec![Action::Transition(ConnState::WaitType)]
}

/// Server-side: a `SetType` arrived. `known` must answer whether `conntype` (defaulting to
/// `"classic"` when absent) is a registered connection type.
pub fn set_type_received(
    payload: &Value,
    known: impl Fn(&str) -> bool,
) -> Result<Vec<Action>, Error> {
    let conntype = payload
        .get("conntype")
        .and_then(Value::as_str)
        .unwrap_or(CONNTYPE_CLASSIC)
        .to_owned();

    if !known(&conntype) {
        return Ok(vec![Action::Close {
            reason: REASON_UNKNOWN_CONNTYPE.to_owned(),
        }]);
    }

    Ok(vec![Action::InitConnType(conntype)])
}

/// The classic connection type's `init` hook: push `Handshake` and advance to
/// `HandshakeWait1`. `registry` is the sender's current `name -> id` table.
pub fn classic_init(registry: &HashMap<String, u32>) -> Vec<Action> {
    let registry_value = Value::Map(
        registry
            .iter()
            .map(|(name, id)| (Value::String(name.clone()), Value::Uint(*id as u64)))
            .collect(),
    );

    vec![
        Action::Send {
            id: ID_HANDSHAKE,
            payload: Value::map([
                ("version", Value::String(VERSION.to_owned())),
                ("protoversion", Value::Uint(PROTOVERSION as u64)),
                ("registry", registry_value),
            ]),
        },
        Action::Transition(ConnState::HandshakeWait1),
    ]
}

/// Client-side: a `Handshake` arrived. `local_registry` is the client's own `name -> id` table,
/// used to detect and (depending on `autosync`/`on_mismatch`) reconcile divergent ids.
pub fn handshake_received(
    payload: &Value,
    local_registry: &HashMap<String, u32>,
    autosync: bool,
    on_mismatch: MissingPacketAction,
) -> Result<Vec<Action>, Error> {
    let remote_protoversion = protoversion_of(payload)?;
    if remote_protoversion != PROTOVERSION {
        return Ok(vec![Action::Close {
            reason: REASON_PROTOVERSION_MISMATCH.to_owned(),
        }]);
    }

    let mut actions = Vec::new();

    if autosync {
        if !matches!(payload.get("registry"), Some(Value::Map(_))) {
            return Err(Error::Malformed("registry"));
        }

        let remote: HashMap<String, u32> = match payload.get("registry") {
            Some(Value::Map(entries)) => entries
                .iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_owned(), v.as_u64()? as u32)))
                .collect(),
            _ => HashMap::new(),
        };

        let local_names: std::collections::HashSet<_> = local_registry.keys().collect();
        let remote_names: std::collections::HashSet<_> = remote.keys().collect();

        if local_names != remote_names {
            match on_mismatch {
                MissingPacketAction::CloseConnection => {
                    return Ok(vec![Action::Close {
                        reason: REASON_PACKETREG_MISMATCH.to_owned(),
                    }])
                }
                MissingPacketAction::Ignore => {}
            }
        }

        for (name, &remote_id) in &remote {
            if let Some(&local_id) = local_registry.get(name) {
                if local_id != remote_id {
                    actions.push(Action::RemapRegistry {
                        name: name.clone(),
                        id: remote_id,
                    });
                }
            }
        }
    }

    actions.push(Action::Send {
        id: ID_HANDSHAKE_ACCEPT,
        payload: Value::map([("success", Value::Bool(true))]),
    });
    actions.push(Action::SignalHandshakeComplete);

    Ok(actions)
}

/// Server-side: a `HandshakeAccept` arrived.
pub fn handshake_accept_received(payload: &Value) -> Result<Vec<Action>, Error> {
    let success = payload.get("success").and_then(Value::as_bool).unwrap_or(false);
    if success {
        Ok(vec![Action::SignalHandshakeComplete])
    } else {
        Ok(vec![])
    }
}

/// Either direction: a `CloseConnection` arrived.
pub fn close_connection_received(payload: &Value) -> Vec<Action> {
    let reason = payload
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("closed by peer")
        .to_owned();
    vec![Action::Close { reason }]
}

pub fn close_connection_payload(reason: Option<&str>) -> Value {
    match reason {
        Some(r) => Value::map([("reason", Value::String(r.to_owned()))]),
        None => Value::map([]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_accepted() {
        let payload = Value::map([
            ("version", Value::String("0.1.0".into())),
            ("protoversion", Value::Uint(PROTOVERSION as u64)),
        ]);
        let actions = hello_received(&payload, "classic").unwrap();
        assert!(matches!(&actions[0], Action::Send { id, .. } if *id == ID_SET_TYPE));
        assert_eq!(actions[1], Action::Transition(ConnState::WaitType));
        assert_eq!(actions[2], Action::InitConnType("classic".to_owned()));
    }

    #[test]
    fn test_hello_protoversion_mismatch_closes() {
        let payload = Value::map([("protoversion", Value::Uint(999))]);
        let actions = hello_received(&payload, "classic").unwrap();
        assert_eq!(
            actions,
            vec![Action::Close {
                reason: REASON_PROTOVERSION_MISMATCH.to_owned()
            }]
        );
    }

    #[test]
    fn test_set_type_defaults_to_classic() {
        let payload = Value::map([]);
        let actions = set_type_received(&payload, |n| n == CONNTYPE_CLASSIC).unwrap();
        assert_eq!(actions, vec![Action::InitConnType(CONNTYPE_CLASSIC.to_owned())]);
    }

    #[test]
    fn test_set_type_unknown_closes() {
        let payload = Value::map([("conntype", Value::String("bogus".into()))]);
        let actions = set_type_received(&payload, |_| false).unwrap();
        assert_eq!(
            actions,
            vec![Action::Close {
                reason: REASON_UNKNOWN_CONNTYPE.to_owned()
            }]
        );
    }

    #[test]
    fn test_handshake_registry_match_no_remap() {
        let mut local = HashMap::new();
        local.insert("app:echo".to_owned(), 64);

        let payload = Value::map([
            ("version", Value::String(VERSION.to_owned())),
            ("protoversion", Value::Uint(PROTOVERSION as u64)),
            (
                "registry",
                Value::Map(vec![(Value::String("app:echo".into()), Value::Uint(64))]),
            ),
        ]);

        let actions =
            handshake_received(&payload, &local, true, MissingPacketAction::CloseConnection)
                .unwrap();
        assert!(!actions.iter().any(|a| matches!(a, Action::RemapRegistry { .. })));
        assert!(actions.contains(&Action::SignalHandshakeComplete));
    }

    #[test]
    fn test_handshake_registry_mismatch_remaps_shared_names() {
        let mut local = HashMap::new();
        local.insert("app:echo".to_owned(), 64);

        let payload = Value::map([
            ("version", Value::String(VERSION.to_owned())),
            ("protoversion", Value::Uint(PROTOVERSION as u64)),
            (
                "registry",
                Value::Map(vec![(Value::String("app:echo".into()), Value::Uint(70))]),
            ),
        ]);

        let actions =
            handshake_received(&payload, &local, true, MissingPacketAction::CloseConnection)
                .unwrap();
        assert!(actions.contains(&Action::RemapRegistry {
            name: "app:echo".to_owned(),
            id: 70
        }));
    }

    #[test]
    fn test_handshake_registry_mismatch_closes_on_policy() {
        let mut local = HashMap::new();
        local.insert("app:echo".to_owned(), 64);

        let payload = Value::map([
            ("version", Value::String(VERSION.to_owned())),
            ("protoversion", Value::Uint(PROTOVERSION as u64)),
            ("registry", Value::Map(vec![])),
        ]);

        let actions =
            handshake_received(&payload, &local, true, MissingPacketAction::CloseConnection)
                .unwrap();
        assert_eq!(
            actions,
            vec![Action::Close {
                reason: REASON_PACKETREG_MISMATCH.to_owned()
            }]
        );
    }

    #[test]
    fn test_handshake_accept_signals_complete() {
        let payload = Value::map([("success", Value::Bool(true))]);
        let actions = handshake_accept_received(&payload).unwrap();
        assert_eq!(actions, vec![Action::SignalHandshakeComplete]);
    }

    #[test]
    fn test_close_connection_extracts_reason() {
        let payload = Value::map([("reason", Value::String("bye".into()))]);
        let actions = close_connection_received(&payload);
        assert_eq!(
            actions,
            vec![Action::Close {
                reason: "bye".to_owned()
            }]
        );
    }
}
