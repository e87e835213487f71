//! The packet registry: a bijection between packet id, symbolic name and handler.
//!
//! Ids below [`RESERVED_RANGE`] are reserved for internal packets; application registrations are
//! allocated starting at 64.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handler::DynHandler;

/// The first id available for application packets; ids below this are internal.
pub const RESERVED_RANGE: u32 = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("id {0} is already registered to a different handler")]
    AlreadyRegistered(u32),
    #[error("name {0:?} is already registered to a different id")]
    NameConflict(String),
    #[error("no packet registered with id {0}")]
    UnknownId(u32),
    #[error("no packet registered with name {0:?}")]
    UnknownName(String),
}

struct Entry {
    name: String,
    handler: Arc<DynHandler>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<u32, Entry>,
    name_to_id: HashMap<String, u32>,
    next_id: u32,
}

/// A process-wide, per-peer registry of packet descriptors.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                name_to_id: HashMap::new(),
                next_id: RESERVED_RANGE,
            }),
        }
    }

    /// Registers `handler` under `name`, with an explicit `id` if given, otherwise allocating the
    /// next free id `>= 64`.
    ///
    /// Re-registering the exact same `(name, id, handler pointer)` triple is a no-op; registering
    /// a conflicting id or name for a different handler fails.
    pub fn register(
        &self,
        name: &str,
        handler: Arc<DynHandler>,
        id: Option<u32>,
    ) -> Result<u32, Error> {
        let mut inner = self.inner.lock();

        if let Some(&existing_id) = inner.name_to_id.get(name) {
            let same_id = id.map(|i| i == existing_id).unwrap_or(true);
            let same_handler = inner
                .by_id
                .get(&existing_id)
                .map(|e| Arc::ptr_eq(&e.handler, &handler))
                .unwrap_or(false);

            if same_id && same_handler {
                return Ok(existing_id);
            }
            return Err(Error::NameConflict(name.to_owned()));
        }

        let id = match id {
            Some(id) => {
                if inner.by_id.contains_key(&id) {
                    return Err(Error::AlreadyRegistered(id));
                }
                id
            }
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                id
            }
        };

        inner.by_id.insert(
            id,
            Entry {
                name: name.to_owned(),
                handler,
            },
        );
        inner.name_to_id.insert(name.to_owned(), id);

        Ok(id)
    }

    /// Removes the id, name and handler entry atomically.
    pub fn delete(&self, id: u32) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let entry = inner.by_id.remove(&id).ok_or(Error::UnknownId(id))?;
        inner.name_to_id.remove(&entry.name);
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Result<u32, Error> {
        self.inner
            .lock()
            .name_to_id
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownName(name.to_owned()))
    }

    pub fn name_of(&self, id: u32) -> Result<String, Error> {
        self.inner
            .lock()
            .by_id
            .get(&id)
            .map(|e| e.name.clone())
            .ok_or(Error::UnknownId(id))
    }

    pub fn handler_of(&self, id: u32) -> Option<Arc<DynHandler>> {
        self.inner.lock().by_id.get(&id).map(|e| e.handler.clone())
    }

    /// Returns a snapshot of the current `name -> id` table, used to build the `Handshake`
    /// registry payload.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.inner.lock().name_to_id.clone()
    }

    /// Rewrites the local id for `name` to `new_id`, preserving the id<->name<->handler
    /// bijection. Used by the client during registry auto-sync. No-op if `name` is unknown
    /// locally (the distilled spec only remaps names present on both sides).
    pub fn remap(&self, name: &str, new_id: u32) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        let Some(&old_id) = inner.name_to_id.get(name) else {
            return Ok(());
        };
        if old_id == new_id {
            return Ok(());
        }
        if inner.by_id.contains_key(&new_id) {
            return Err(Error::AlreadyRegistered(new_id));
        }

        let entry = inner.by_id.remove(&old_id).expect("name_to_id out of sync");
        inner.by_id.insert(new_id, entry);
        inner.name_to_id.insert(name.to_owned(), new_id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Gate, PacketHandler, SmartHandler};
    use crate::state::ConnState;
    use crate::value::Value;

    struct Noop;

    impl PacketHandler for Noop {
        fn receive(&self, _msg: &Value, _cid: Option<u64>) {}
        fn send(&self, _msg: &Value, _cid: Option<u64>) {}
    }

    fn handler() -> Arc<DynHandler> {
        Arc::new(SmartHandler::new(Noop, Gate::default().with_state(ConnState::Active)))
    }

    #[test]
    fn test_dynamic_allocation_starts_at_64() {
        let reg = Registry::new();
        let id = reg.register("app:one", handler(), None).unwrap();
        assert_eq!(id, 64);
        let id = reg.register("app:two", handler(), None).unwrap();
        assert_eq!(id, 65);
    }

    #[test]
    fn test_bijection() {
        let reg = Registry::new();
        let id = reg.register("app:echo", handler(), None).unwrap();
        assert_eq!(reg.name_of(id).unwrap(), "app:echo");
        assert_eq!(reg.id_of("app:echo").unwrap(), id);
    }

    #[test]
    fn test_idempotent_reregistration() {
        let reg = Registry::new();
        let h = handler();
        let id1 = reg.register("app:echo", h.clone(), Some(100)).unwrap();
        let id2 = reg.register("app:echo", h, Some(100)).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_conflicting_id_rejected() {
        let reg = Registry::new();
        reg.register("app:a", handler(), Some(100)).unwrap();
        let err = reg.register("app:b", handler(), Some(100)).unwrap_err();
        assert_eq!(err, Error::AlreadyRegistered(100));
    }

    #[test]
    fn test_delete_removes_all_entries() {
        let reg = Registry::new();
        let id = reg.register("app:echo", handler(), None).unwrap();
        reg.delete(id).unwrap();
        assert_eq!(reg.id_of("app:echo"), Err(Error::UnknownName("app:echo".into())));
        assert_eq!(reg.name_of(id), Err(Error::UnknownId(id)));
    }

    #[test]
    fn test_remap_preserves_bijection() {
        let reg = Registry::new();
        let id = reg.register("app:echo", handler(), None).unwrap();
        reg.remap("app:echo", 200).unwrap();
        assert_eq!(reg.id_of("app:echo").unwrap(), 200);
        assert_eq!(reg.name_of(200).unwrap(), "app:echo");
        assert_eq!(reg.name_of(id), Err(Error::UnknownId(id)));
    }
}
