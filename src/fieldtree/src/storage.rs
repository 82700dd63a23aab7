//! The composition root a caller actually constructs (spec §4.L, §9's
//! answer to "global state"): one [`BytePool`], one [`Registry`] and one
//! [`EventRegistry`] behind a single handle, so two `Storage` instances in
//! the same process never share ids or subscriptions.

use std::sync::Arc;

use crate::byte_pool::BytePool;
use crate::container::Container;
use crate::events::EventRegistry;
use crate::object::StorageObject;
use crate::registry::Registry;

struct StorageInner {
    pool: BytePool,
    registry: Registry,
    events: EventRegistry,
    root_id: u64,
}

/// Cheap to clone: an `Arc` around the shared pool/registry/event state, so
/// multiple call sites can hold a handle into the same container tree.
#[derive(Clone)]
pub struct Storage(Arc<StorageInner>);

impl Storage {
    pub fn new() -> Self {
        let pool = BytePool::new();
        let registry = Registry::new();
        let events = EventRegistry::new();
        let (root_id, _handle) = registry
            .register(Container::create(&pool))
            .expect("a freshly created container is always wild");
        Storage(Arc::new(StorageInner {
            pool,
            registry,
            events,
            root_id,
        }))
    }

    /// A façade handle over this storage's root container.
    pub fn root(&self) -> StorageObject {
        let generation = self
            .0
            .registry
            .lookup(self.0.root_id)
            .expect("root container is registered for the lifetime of its Storage")
            .lock()
            .unwrap()
            .generation();
        StorageObject::new(self.clone(), self.0.root_id, generation)
    }

    pub fn root_id(&self) -> u64 {
        self.0.root_id
    }

    pub(crate) fn pool(&self) -> &BytePool {
        &self.0.pool
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.0.registry
    }

    pub(crate) fn events(&self) -> &EventRegistry {
        &self.0.events
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_storages_do_not_share_ids() {
        let a = Storage::new();
        let b = Storage::new();
        assert_eq!(a.root_id(), b.root_id());
        a.root().write("hp", 5i32, true).unwrap();
        assert_eq!(b.root().read::<i32>("hp").unwrap(), 0);
    }

    #[test]
    fn root_survives_clone() {
        let storage = Storage::new();
        let clone = storage.clone();
        clone.root().write("hp", 3i32, true).unwrap();
        assert_eq!(storage.root().read::<i32>("hp").unwrap(), 3);
    }
}
