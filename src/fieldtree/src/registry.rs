//! Id allocation, container lookup and cascading unregister (spec §4.F).
//!
//! A single mutex guards id allocation and the id→container / child→parent
//! maps; container byte mutations happen outside the mutex, through the
//! `Arc<Mutex<Container>>` handles this module hands back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::byte_pool::BytePool;
use crate::container::{Container, NULL_ID, WILD_ID};
use crate::error::{Error, Result};

pub type ContainerHandle = Arc<Mutex<Container>>;

struct Inner {
    next: u64,
    free: VecDeque<u64>,
    table: HashMap<u64, ContainerHandle>,
    parent: HashMap<u64, u64>,
}

/// Mints ids, locates containers by id, and performs cascading unregister.
/// Shared across every container created under one [`crate::storage::Storage`]
/// root.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(Inner {
                next: 1,
                free: VecDeque::new(),
                table: HashMap::new(),
                parent: HashMap::new(),
            }),
        }
    }

    /// Assign the container an id and track it. The container must be wild
    /// (never registered).
    pub fn register(&self, container: Container) -> Result<(u64, ContainerHandle)> {
        if container.id() != WILD_ID {
            return Err(Error::OutOfRange {
                what: "register: container already has an id",
                index: container.id() as i64,
                bound: WILD_ID as i64,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        let id = inner.free.pop_back().unwrap_or_else(|| {
            let id = inner.next;
            inner.next += 1;
            id
        });
        let mut container = container;
        container.set_id(id);
        let handle = Arc::new(Mutex::new(container));
        inner.table.insert(id, handle.clone());
        tracing::trace!(id, "container registered");
        Ok((id, handle))
    }

    pub fn lookup(&self, id: u64) -> Option<ContainerHandle> {
        if id == NULL_ID || id == WILD_ID {
            return None;
        }
        self.inner.lock().unwrap().table.get(&id).cloned()
    }

    pub fn get_parent(&self, id: u64) -> Option<u64> {
        self.inner.lock().unwrap().parent.get(&id).copied()
    }

    /// Record that `child` is reachable through a reference field on
    /// `parent`. Used only for event bubbling, not ownership.
    pub fn set_parent(&self, child: u64, parent: u64) {
        self.inner.lock().unwrap().parent.insert(child, parent);
    }

    /// Remove `id` from the table, then recursively unregister (and dispose)
    /// every child it still references. Idempotent: unregistering an id not
    /// in the table is a no-op.
    pub fn unregister(&self, pool: &BytePool, id: u64) {
        if id == NULL_ID || id == WILD_ID {
            return;
        }
        #[cfg(debug_assertions)]
        {
            let mut visited = std::collections::HashSet::new();
            self.unregister_checked(pool, id, &mut visited);
        }
        #[cfg(not(debug_assertions))]
        {
            self.unregister_inner(pool, id);
        }
    }

    #[cfg(debug_assertions)]
    fn unregister_checked(&self, pool: &BytePool, id: u64, visited: &mut std::collections::HashSet<u64>) {
        if !visited.insert(id) {
            panic!("registry cycle detected while unregistering id {id}: container graph is not a tree");
        }
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            inner.parent.remove(&id);
            inner.table.remove(&id)
        };
        let Some(handle) = handle else { return };
        self.push_id_free(id);

        let child_ids = {
            let container = handle.lock().unwrap();
            container.ref_child_ids()
        };
        for child in child_ids {
            self.unregister_checked(pool, child, visited);
        }
        handle.lock().unwrap().dispose(pool);
        tracing::trace!(id, "container unregistered");
    }

    #[cfg(not(debug_assertions))]
    fn unregister_inner(&self, pool: &BytePool, id: u64) {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            inner.parent.remove(&id);
            inner.table.remove(&id)
        };
        let Some(handle) = handle else { return };
        self.push_id_free(id);

        let child_ids = {
            let container = handle.lock().unwrap();
            container.ref_child_ids()
        };
        for child in child_ids {
            self.unregister_inner(pool, child);
        }
        handle.lock().unwrap().dispose(pool);
        tracing::trace!(id, "container unregistered");
    }

    fn push_id_free(&self, id: u64) {
        self.inner.lock().unwrap().free.push_back(id);
    }

    /// Unregister whatever id currently sits in `*slot`, then write `NULL_ID`
    /// into it.
    pub fn unregister_slot(&self, pool: &BytePool, slot: &mut u64) {
        let id = *slot;
        self.unregister(pool, id);
        *slot = NULL_ID;
    }

    /// If `*slot` already holds a live id, unregister it first. Then
    /// register `container`, write its id into `*slot`, and record the
    /// parent link.
    pub fn create_at(
        &self,
        pool: &BytePool,
        slot: &mut u64,
        parent_id: u64,
        container: Container,
    ) -> Result<(u64, ContainerHandle)> {
        if *slot != NULL_ID {
            self.unregister(pool, *slot);
        }
        let (id, handle) = self.register(container)?;
        *slot = id;
        self.set_parent(id, parent_id);
        Ok((id, handle))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_increasing_ids() {
        let pool = BytePool::new();
        let registry = Registry::new();
        let (id1, _) = registry.register(Container::create(&pool)).unwrap();
        let (id2, _) = registry.register(Container::create(&pool)).unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
    }

    #[test]
    fn unregister_frees_id_for_reuse() {
        let pool = BytePool::new();
        let registry = Registry::new();
        let (id1, _) = registry.register(Container::create(&pool)).unwrap();
        registry.unregister(&pool, id1);
        assert!(registry.lookup(id1).is_none());
        let (id2, _) = registry.register(Container::create(&pool)).unwrap();
        assert_eq!(id2, id1);
    }

    #[test]
    fn free_list_reuses_most_recently_freed_id_first() {
        let pool = BytePool::new();
        let registry = Registry::new();
        let (id1, _) = registry.register(Container::create(&pool)).unwrap();
        let (id2, _) = registry.register(Container::create(&pool)).unwrap();
        registry.unregister(&pool, id1);
        registry.unregister(&pool, id2);

        let (reused, _) = registry.register(Container::create(&pool)).unwrap();
        assert_eq!(reused, id2, "LIFO: id2 was freed last, so it is handed out first");
        let (reused2, _) = registry.register(Container::create(&pool)).unwrap();
        assert_eq!(reused2, id1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let pool = BytePool::new();
        let registry = Registry::new();
        let (id, _) = registry.register(Container::create(&pool)).unwrap();
        registry.unregister(&pool, id);
        registry.unregister(&pool, id);
    }

    #[test]
    fn unregister_cascades_to_children() {
        let pool = BytePool::new();
        let registry = Registry::new();
        let (parent_id, parent_handle) = registry.register(Container::create(&pool)).unwrap();
        let (child_id, _) = registry.register(Container::create(&pool)).unwrap();

        {
            let mut parent = parent_handle.lock().unwrap();
            parent.get_ref(&pool, "child").unwrap();
            parent.set_ref("child", child_id).unwrap();
        }
        registry.set_parent(child_id, parent_id);

        registry.unregister(&pool, parent_id);
        assert!(registry.lookup(parent_id).is_none());
        assert!(registry.lookup(child_id).is_none());
    }

    #[test]
    #[cfg(debug_assertions)]
    fn unregister_panics_on_cycle() {
        let pool = BytePool::new();
        let registry = Registry::new();
        let (id_a, handle_a) = registry.register(Container::create(&pool)).unwrap();
        let (id_b, handle_b) = registry.register(Container::create(&pool)).unwrap();

        {
            let mut a = handle_a.lock().unwrap();
            a.get_ref(&pool, "b").unwrap();
            a.set_ref("b", id_b).unwrap();
        }
        {
            let mut b = handle_b.lock().unwrap();
            b.get_ref(&pool, "a").unwrap();
            b.set_ref("a", id_a).unwrap();
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.unregister(&pool, id_a);
        }));
        assert!(result.is_err());
    }
}
