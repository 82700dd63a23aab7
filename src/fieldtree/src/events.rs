//! Change notification without per-container subscriber storage (spec §4.J).
//!
//! Subscriptions live here, keyed by container id, rather than inside
//! `Container` itself: a buffer can be pooled and reused without dragging a
//! stale subscriber list along with it. A record's stored generation gates
//! delivery: once it falls behind the container's live generation the
//! record is stale and is flushed with a synthesized `Dispose`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::kind::ValueKind;
use crate::registry::Registry;

pub type SubscriptionId = u64;
pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Write,
    Rename,
    Delete,
    Dispose,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub container_id: u64,
    pub path: String,
    pub field_kind: Option<ValueKind>,
}

struct ContainerRecord {
    generation: u64,
    field_subs: HashMap<String, Vec<(SubscriptionId, Subscriber)>>,
    container_subs: Vec<(SubscriptionId, Subscriber)>,
    next_id: u64,
}

impl ContainerRecord {
    fn new(generation: u64) -> Self {
        ContainerRecord {
            generation,
            field_subs: HashMap::new(),
            container_subs: Vec::new(),
            next_id: 1,
        }
    }

    fn issue_id(&mut self) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn all_subscribers(&self) -> Vec<Subscriber> {
        let mut all: Vec<Subscriber> = self.container_subs.iter().map(|(_, s)| s.clone()).collect();
        for subs in self.field_subs.values() {
            all.extend(subs.iter().map(|(_, s)| s.clone()));
        }
        all
    }

    fn matching(&self, field_name: &str) -> Vec<Subscriber> {
        let mut matched: Vec<Subscriber> = self.container_subs.iter().map(|(_, s)| s.clone()).collect();
        if let Some(subs) = self.field_subs.get(field_name) {
            matched.extend(subs.iter().map(|(_, s)| s.clone()));
        }
        matched
    }
}

/// Per-container subscription records plus bubbling dispatch, shared across
/// every container under one [`crate::storage::Storage`] root.
pub struct EventRegistry {
    records: Mutex<HashMap<u64, Arc<Mutex<ContainerRecord>>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        EventRegistry {
            records: Mutex::new(HashMap::new()),
        }
    }

    fn record_for(&self, container_id: u64, generation: u64) -> Arc<Mutex<ContainerRecord>> {
        self.records
            .lock()
            .unwrap()
            .entry(container_id)
            .or_insert_with(|| Arc::new(Mutex::new(ContainerRecord::new(generation))))
            .clone()
    }

    pub fn subscribe_field(
        &self,
        container_id: u64,
        generation: u64,
        field_name: &str,
        callback: Subscriber,
    ) -> SubscriptionId {
        let record = self.record_for(container_id, generation);
        let mut record = record.lock().unwrap();
        let id = record.issue_id();
        record
            .field_subs
            .entry(field_name.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    pub fn subscribe_container(&self, container_id: u64, generation: u64, callback: Subscriber) -> SubscriptionId {
        let record = self.record_for(container_id, generation);
        let mut record = record.lock().unwrap();
        let id = record.issue_id();
        record.container_subs.push((id, callback));
        id
    }

    pub fn unsubscribe(&self, container_id: u64, id: SubscriptionId) {
        let Some(record) = self.records.lock().unwrap().get(&container_id).cloned() else {
            return;
        };
        let mut record = record.lock().unwrap();
        record.container_subs.retain(|(sub_id, _)| *sub_id != id);
        for subs in record.field_subs.values_mut() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    fn notify(subscribers: &[Subscriber], event: &Event) {
        for subscriber in subscribers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| subscriber(event)));
            if result.is_err() {
                tracing::error!(
                    container_id = event.container_id,
                    path = %event.path,
                    "event subscriber panicked"
                );
                std::panic::resume_unwind(result.unwrap_err());
            }
        }
    }

    /// Deliver `event` at `container_id`, gating on generation first. If the
    /// record is stale, it is flushed and a synthesized `Dispose` is sent to
    /// the snapshotted subscribers instead; the caller's event is dropped for
    /// this hop. Returns `true` if delivery happened (record was current).
    fn deliver_at(&self, container_id: u64, current_generation: u64, local_field_name: &str, event: &Event) -> bool {
        let record = self.record_for(container_id, current_generation);
        let stale_snapshot = {
            let mut record = record.lock().unwrap();
            if record.generation != current_generation {
                let snapshot = record.all_subscribers();
                *record = ContainerRecord::new(current_generation);
                Some(snapshot)
            } else {
                None
            }
        };
        if let Some(snapshot) = stale_snapshot {
            let dispose = Event {
                kind: EventKind::Dispose,
                container_id,
                path: String::new(),
                field_kind: None,
            };
            Self::notify(&snapshot, &dispose);
            return false;
        }
        let matched = record.lock().unwrap().matching(local_field_name);
        Self::notify(&matched, event);
        true
    }

    /// Dispatch an event originating at `container_id`'s field `field_name`,
    /// then bubble it through the parent chain, prepending `.name` (or
    /// `name[index]` when the hop crosses a reference array) at each step.
    fn dispatch(
        &self,
        registry: &Registry,
        kind: EventKind,
        origin_id: u64,
        origin_generation: u64,
        field_name: &str,
        field_kind: Option<ValueKind>,
    ) {
        let mut path = field_name.to_string();
        let event = Event {
            kind,
            container_id: origin_id,
            path: path.clone(),
            field_kind,
        };
        self.deliver_at(origin_id, origin_generation, field_name, &event);

        let mut current_id = origin_id;
        while let Some(parent_id) = registry.get_parent(current_id) {
            let Some(parent_handle) = registry.lookup(parent_id) else {
                break;
            };
            let (parent_generation, slot) = {
                let parent = parent_handle.lock().unwrap();
                (parent.generation(), parent.find_ref_slot(current_id))
            };
            let Some((name, index)) = slot else {
                break;
            };
            path = match index {
                Some(i) => format!("{name}[{i}].{path}"),
                None => format!("{name}.{path}"),
            };
            let event = Event {
                kind,
                container_id: parent_id,
                path: path.clone(),
                field_kind,
            };
            self.deliver_at(parent_id, parent_generation, &name, &event);
            current_id = parent_id;
        }
    }

    pub fn dispatch_write(
        &self,
        registry: &Registry,
        container_id: u64,
        generation: u64,
        field_name: &str,
        field_kind: ValueKind,
    ) {
        self.dispatch(registry, EventKind::Write, container_id, generation, field_name, Some(field_kind));
    }

    /// Move the subscriber list from `old_name` to `new_name` and deliver a
    /// `Rename` event whose path is the new name.
    pub fn dispatch_rename(
        &self,
        registry: &Registry,
        container_id: u64,
        generation: u64,
        old_name: &str,
        new_name: &str,
    ) {
        let record = self.record_for(container_id, generation);
        {
            let mut record = record.lock().unwrap();
            if let Some(subs) = record.field_subs.remove(old_name) {
                record.field_subs.insert(new_name.to_string(), subs);
            }
        }
        self.dispatch(registry, EventKind::Rename, container_id, generation, new_name, None);
    }

    /// Deliver a `Delete` event, then prune the origin's field-specific
    /// subscribers for `field_name` (they have nothing left to watch).
    pub fn dispatch_delete(
        &self,
        registry: &Registry,
        container_id: u64,
        generation: u64,
        field_name: &str,
        field_kind: Option<ValueKind>,
    ) {
        self.dispatch(registry, EventKind::Delete, container_id, generation, field_name, field_kind);
        let record = self.record_for(container_id, generation);
        record.lock().unwrap().field_subs.remove(field_name);
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_pool::BytePool;
    use crate::container::Container;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn write_event_delivered_to_field_and_container_subscribers() {
        let events = EventRegistry::new();
        let field_hits = Arc::new(AtomicUsize::new(0));
        let container_hits = Arc::new(AtomicUsize::new(0));

        let fh = field_hits.clone();
        events.subscribe_field(1, 1, "hp", Arc::new(move |_e: &Event| {
            fh.fetch_add(1, Ordering::SeqCst);
        }));
        let ch = container_hits.clone();
        events.subscribe_container(1, 1, Arc::new(move |_e: &Event| {
            ch.fetch_add(1, Ordering::SeqCst);
        }));

        let registry = Registry::new();
        events.dispatch_write(&registry, 1, 1, "hp", ValueKind::Int32);

        assert_eq!(field_hits.load(Ordering::SeqCst), 1);
        assert_eq!(container_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_generation_synthesizes_dispose() {
        let events = EventRegistry::new();
        let disposes = Arc::new(AtomicUsize::new(0));
        let d = disposes.clone();
        events.subscribe_container(1, 1, Arc::new(move |e: &Event| {
            if e.kind == EventKind::Dispose {
                d.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let registry = Registry::new();
        // generation bumped to 2 "behind the scenes" (e.g. rescheme) without notifying events.
        events.dispatch_write(&registry, 1, 2, "hp", ValueKind::Int32);

        assert_eq!(disposes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bubbles_through_parent_with_dotted_path() {
        let pool = BytePool::new();
        let registry = Registry::new();
        let events = EventRegistry::new();

        let (parent_id, parent_handle) = registry.register(Container::create(&pool)).unwrap();
        let (child_id, child_handle) = registry.register(Container::create(&pool)).unwrap();
        {
            let mut parent = parent_handle.lock().unwrap();
            parent.get_ref(&pool, "inventory").unwrap();
            parent.set_ref("inventory", child_id).unwrap();
        }
        registry.set_parent(child_id, parent_id);
        let child_generation = child_handle.lock().unwrap().generation();

        let seen_paths = Arc::new(Mutex::new(Vec::new()));
        let seen = seen_paths.clone();
        events.subscribe_container(parent_id, 1, Arc::new(move |e: &Event| {
            seen.lock().unwrap().push(e.path.clone());
        }));

        events.dispatch_write(&registry, child_id, child_generation, "durability", ValueKind::Int32);

        let paths = seen_paths.lock().unwrap();
        assert_eq!(paths.as_slice(), ["inventory.durability"]);
    }

    #[test]
    fn rename_moves_subscribers_and_reports_new_path() {
        let events = EventRegistry::new();
        let registry = Registry::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = hits.clone();
        events.subscribe_field(1, 1, "old_name", Arc::new(move |e: &Event| {
            h.lock().unwrap().push(e.path.clone());
        }));

        events.dispatch_rename(&registry, 1, 1, "old_name", "new_name");

        assert_eq!(hits.lock().unwrap().as_slice(), ["new_name"]);
    }

    #[test]
    fn panicking_subscriber_logs_and_repropagates() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let events = EventRegistry::new();
        events.subscribe_field(1, 1, "hp", Arc::new(|_e: &Event| {
            panic!("subscriber blew up");
        }));

        let registry = Registry::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            events.dispatch_write(&registry, 1, 1, "hp", ValueKind::Int32);
        }));

        assert!(result.is_err());
    }
}
