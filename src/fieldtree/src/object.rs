//! `StorageObject`: the façade a caller actually holds (spec §4.I). Cheap to
//! copy (an id plus a generation snapshot plus a cloned [`Storage`] handle);
//! every operation re-resolves the container through the registry and
//! checks it is still the same live instance before touching bytes.

use std::cell::Cell;

use byteorder::{ByteOrder, LittleEndian};

use crate::array::StorageArray;
use crate::container::{Container, NULL_ID};
use crate::error::{Error, Result};
use crate::events::{Subscriber, SubscriptionId};
use crate::kind::{Char16, RefId, Scalar, ValueKind};
use crate::layout::LayoutBuilder;
use crate::path::{parse_path, Segment};
use crate::registry::ContainerHandle;
use crate::storage::Storage;

/// A lightweight handle over one container. Two `StorageObject`s with the
/// same id and the generation they were resolved under refer to the exact
/// same live container; a generation that has since moved backwards (the id
/// was freed and handed to a brand new container) surfaces as [`Error::Disposed`].
#[derive(Clone)]
pub struct StorageObject {
    storage: Storage,
    id: u64,
    generation: Cell<u64>,
}

impl StorageObject {
    pub(crate) fn new(storage: Storage, id: u64, generation: u64) -> Self {
        StorageObject {
            storage,
            id,
            generation: Cell::new(generation),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    fn handle(&self) -> Result<ContainerHandle> {
        self.storage.registry().lookup(self.id).ok_or(Error::Disposed {
            id: self.id,
            handle_generation: self.generation.get(),
            current_generation: self.generation.get(),
        })
    }

    /// Lock the container, confirm it is still the instance this handle was
    /// issued for, and resync the cached generation to what we just
    /// observed. A generation that moved *backwards* from what we last saw
    /// means the id was recycled out from under us: the only signal we have
    /// for that, since a fresh container always restarts its own counter at
    /// 1 (spec §3's single-writer, acyclic assumptions mean we don't chase
    /// this further).
    fn lock_checked(&self, handle: &ContainerHandle) -> Result<std::sync::MutexGuard<'_, Container>> {
        let guard = handle.lock().unwrap();
        let current = guard.generation();
        if guard.is_disposed() || current < self.generation.get() {
            return Err(Error::Disposed {
                id: self.id,
                handle_generation: self.generation.get(),
                current_generation: current,
            });
        }
        self.generation.set(current);
        Ok(guard)
    }

    /// Dispatch a `Write` event at `generation` (the generation observed
    /// *after* the mutation, since a rescheme bumps it past whatever
    /// [`StorageObject::lock_checked`] last cached).
    fn notify_write(&self, generation: u64, field_name: &str, kind: ValueKind) {
        self.storage
            .events()
            .dispatch_write(self.storage.registry(), self.id, generation, field_name, kind);
    }

    // -- typed scalars --------------------------------------------------

    /// Explicit-mode read: narrowing, float<->int and the bool/char16
    /// bridges are all permitted (spec §4.E `Read<T>`).
    pub fn read<T: Scalar>(&self, name: &str) -> Result<T> {
        let handle = self.handle()?;
        let mut guard = self.lock_checked(&handle)?;
        guard.read(self.storage.pool(), name)
    }

    pub fn try_read<T: Scalar>(&self, name: &str) -> Result<Option<T>> {
        fold_not_found(self.read::<T>(name))
    }

    /// Alias for [`StorageObject::read`], named to pair with
    /// [`StorageObject::read_implicit`] at call sites that care about the
    /// distinction (spec §8 scenario E).
    pub fn read_explicit<T: Scalar>(&self, name: &str) -> Result<T> {
        self.read(name)
    }

    pub fn try_read_explicit<T: Scalar>(&self, name: &str) -> Result<Option<T>> {
        self.try_read(name)
    }

    /// Implicit-mode read: rejects any conversion outside the widening
    /// lattice (spec §4.B, §8 scenario E's `tryReadScalarImplicit`).
    pub fn read_implicit<T: Scalar>(&self, name: &str) -> Result<T> {
        let handle = self.handle()?;
        let mut guard = self.lock_checked(&handle)?;
        guard.read_implicit(self.storage.pool(), name)
    }

    pub fn try_read_implicit<T: Scalar>(&self, name: &str) -> Result<Option<T>> {
        fold_not_found(self.read_implicit::<T>(name))
    }

    pub fn write<T: Scalar>(&self, name: &str, value: T, allow_rescheme: bool) -> Result<()> {
        let handle = self.handle()?;
        let (orphaned, generation) = {
            let mut guard = self.lock_checked(&handle)?;
            let orphaned = guard.write(self.storage.pool(), name, value, allow_rescheme)?;
            (orphaned, guard.generation())
        };
        self.generation.set(generation);
        self.unregister_all(orphaned);
        self.notify_write(generation, name, T::KIND);
        Ok(())
    }

    pub fn try_write<T: Scalar>(&self, name: &str, value: T, allow_rescheme: bool) -> Result<bool> {
        Ok(fold_not_found(self.write(name, value, allow_rescheme))?.is_some())
    }

    pub fn write_bytes(&self, name: &str, src: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        let (kind, generation) = {
            let mut guard = self.lock_checked(&handle)?;
            guard.write_bytes(name, src)?;
            let idx = guard.index_of(name)?;
            (guard.field_descriptor(idx as u32)?.field_kind.kind, guard.generation())
        };
        self.notify_write(generation, name, kind);
        Ok(())
    }

    pub fn get_ref(&self, name: &str) -> Result<u64> {
        let handle = self.handle()?;
        let mut guard = self.lock_checked(&handle)?;
        guard.get_ref(self.storage.pool(), name)
    }

    // -- strings ----------------------------------------------------------

    pub fn write_string(&self, name: &str, value: &str) -> Result<()> {
        let units: Vec<Char16> = value.encode_utf16().map(Char16).collect();
        let handle = self.handle()?;
        let (orphaned, generation) = {
            let mut guard = self.lock_checked(&handle)?;
            let orphaned = guard.write_array(self.storage.pool(), name, &units, true)?;
            (orphaned, guard.generation())
        };
        self.generation.set(generation);
        self.unregister_all(orphaned);
        self.notify_write(generation, name, ValueKind::Char16);
        Ok(())
    }

    pub fn read_string(&self, name: &str) -> Result<String> {
        let handle = self.handle()?;
        let guard = self.lock_checked(&handle)?;
        let chars: Vec<Char16> = guard.read_array(name)?;
        Ok(String::from_utf16_lossy(&chars.into_iter().map(|c| c.0).collect::<Vec<_>>()))
    }

    pub fn try_read_string(&self, name: &str) -> Result<Option<String>> {
        fold_not_found(self.read_string(name))
    }

    // -- arrays -------------------------------------------------------------

    pub fn write_array<T: Scalar>(&self, name: &str, items: &[T]) -> Result<()> {
        let handle = self.handle()?;
        let (orphaned, generation) = {
            let mut guard = self.lock_checked(&handle)?;
            let orphaned = guard.write_array(self.storage.pool(), name, items, true)?;
            (orphaned, guard.generation())
        };
        self.generation.set(generation);
        self.unregister_all(orphaned);
        self.notify_write(generation, name, T::KIND);
        Ok(())
    }

    pub fn read_array<T: Scalar>(&self, name: &str) -> Result<Vec<T>> {
        let handle = self.handle()?;
        let guard = self.lock_checked(&handle)?;
        guard.read_array(name)
    }

    pub fn array_len(&self, name: &str) -> Result<usize> {
        let handle = self.handle()?;
        let guard = self.lock_checked(&handle)?;
        guard.array_len(name)
    }

    pub fn array_element_kind(&self, name: &str) -> Result<ValueKind> {
        let handle = self.handle()?;
        let guard = self.lock_checked(&handle)?;
        guard.array_element_kind(name)
    }

    pub fn read_array_element<T: Scalar>(&self, name: &str, index: u32) -> Result<T> {
        let handle = self.handle()?;
        let guard = self.lock_checked(&handle)?;
        guard.read_array_element(name, index)
    }

    /// Write a single array element in place; the slot must already exist
    /// at this length (use [`StorageObject::write_array`] to grow it).
    pub fn write_array_element<T: Scalar>(&self, name: &str, index: u32, value: T) -> Result<()> {
        let handle = self.handle()?;
        let generation = {
            let mut guard = self.lock_checked(&handle)?;
            guard.write_array_element(name, index, value)?;
            guard.generation()
        };
        self.notify_write(generation, &format!("{name}[{index}]"), T::KIND);
        Ok(())
    }

    /// Resolve `name` as an array: an inline array field on this container,
    /// or (when the field is a bare reference) an array living on a
    /// referenced child.
    pub fn get_array(&self, name: &str) -> Result<StorageArray> {
        let handle = self.handle()?;
        let descriptor = {
            let guard = self.lock_checked(&handle)?;
            let idx = guard.index_of(name)?;
            if idx < 0 {
                return Err(Error::NotFound { name: name.to_string() });
            }
            guard.field_descriptor(idx as u32)?
        };
        if descriptor.field_kind.kind == ValueKind::Ref && !descriptor.field_kind.is_array {
            let child_id: RefId = self.read(name)?;
            let child_handle = self.storage.registry().lookup(child_id.0).ok_or(Error::Disposed {
                id: child_id.0,
                handle_generation: 0,
                current_generation: 0,
            })?;
            let generation = child_handle.lock().unwrap().generation();
            let child = StorageObject::new(self.storage.clone(), child_id.0, generation);
            return Ok(StorageArray::referenced(child));
        }
        Ok(StorageArray::inline(self.clone(), name.to_string()))
    }

    pub fn try_get_array(&self, name: &str) -> Result<Option<StorageArray>> {
        fold_not_found(self.get_array(name))
    }

    // -- child objects ------------------------------------------------------

    pub fn get_object(&self, name: &str) -> Result<StorageObject> {
        self.get_object_with_layout(name, None)
    }

    /// Resolve or create a reference-typed child. When creating, `layout`
    /// (if supplied) seeds the new child's schema; otherwise it starts
    /// empty.
    pub fn get_object_with_layout(&self, name: &str, layout: Option<Vec<u8>>) -> Result<StorageObject> {
        let handle = self.handle()?;
        let mut slot = {
            let mut guard = self.lock_checked(&handle)?;
            guard.get_ref(self.storage.pool(), name)?
        };
        if slot != NULL_ID {
            let child_handle = self.storage.registry().lookup(slot).ok_or(Error::Disposed {
                id: slot,
                handle_generation: 0,
                current_generation: 0,
            })?;
            let generation = child_handle.lock().unwrap().generation();
            return Ok(StorageObject::new(self.storage.clone(), slot, generation));
        }

        let child_layout = layout.unwrap_or_else(|| LayoutBuilder::new().build());
        let child = Container::from_layout(self.storage.pool(), child_layout);
        let (child_id, child_handle) = self
            .storage
            .registry()
            .create_at(self.storage.pool(), &mut slot, self.id, child)?;
        let self_generation = {
            let mut guard = self.lock_checked(&handle)?;
            guard.set_ref(name, child_id)?;
            guard.generation()
        };
        self.generation.set(self_generation);
        self.notify_write(self_generation, name, ValueKind::Ref);
        let generation = child_handle.lock().unwrap().generation();
        Ok(StorageObject::new(self.storage.clone(), child_id, generation))
    }

    pub fn try_get_object(&self, name: &str) -> Result<Option<StorageObject>> {
        fold_not_found(self.get_object(name))
    }

    // -- schema edits ---------------------------------------------------

    /// Remove a field. If it held a reference (scalar or array), every
    /// referenced child is unregistered and a `Delete` event fires for each
    /// slot as well as for the field itself.
    pub fn delete(&self, name: &str) -> Result<()> {
        let handle = self.handle()?;
        let (slot_ids, is_array, field_kind, generation) = {
            let mut guard = self.lock_checked(&handle)?;
            let idx = guard.index_of(name)?;
            if idx < 0 {
                return Err(Error::NotFound { name: name.to_string() });
            }
            let descriptor = guard.field_descriptor(idx as u32)?;
            let field_kind = descriptor.field_kind.kind;
            let is_array = descriptor.field_kind.is_array;
            let slot_ids = if field_kind == ValueKind::Ref {
                guard
                    .read_bytes(name)?
                    .chunks_exact(8)
                    .map(LittleEndian::read_u64)
                    .collect::<Vec<_>>()
            } else {
                Vec::new()
            };
            let mut builder = guard.layout_builder()?;
            builder.remove(name);
            guard.rescheme(self.storage.pool(), builder.build())?;
            (slot_ids, is_array, field_kind, guard.generation())
        };
        self.generation.set(generation);

        if field_kind == ValueKind::Ref && is_array {
            for (i, id) in slot_ids.iter().enumerate() {
                if *id == NULL_ID {
                    continue;
                }
                self.storage.registry().unregister(self.storage.pool(), *id);
                self.storage.events().dispatch_delete(
                    self.storage.registry(),
                    self.id,
                    generation,
                    &format!("{name}[{i}]"),
                    Some(field_kind),
                );
            }
        } else {
            self.unregister_all(slot_ids.into_iter().filter(|&id| id != NULL_ID).collect());
        }
        self.storage.events().dispatch_delete(
            self.storage.registry(),
            self.id,
            generation,
            name,
            Some(field_kind),
        );
        Ok(())
    }

    pub fn try_delete(&self, name: &str) -> Result<bool> {
        Ok(fold_not_found(self.delete(name))?.is_some())
    }

    /// Rename a field, keeping its value and moving its subscribers to the
    /// new name before the `Rename` event goes out.
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let handle = self.handle()?;
        let generation = {
            let mut guard = self.lock_checked(&handle)?;
            guard.rename_field(self.storage.pool(), old_name, new_name)?;
            guard.generation()
        };
        self.generation.set(generation);
        self.storage.events().dispatch_rename(
            self.storage.registry(),
            self.id,
            generation,
            old_name,
            new_name,
        );
        Ok(())
    }

    // -- path navigation ---------------------------------------------------

    /// Resolve every segment but the last, creating intermediate objects
    /// (and reference-array slots) along the way when `create_if_missing`.
    fn navigate(&self, path: &str, create_if_missing: bool) -> Result<(StorageObject, String, Option<u32>)> {
        let segments = parse_path(path)?;
        let mut current = self.clone();
        for segment in &segments[..segments.len() - 1] {
            current = current.step(segment, create_if_missing)?;
        }
        let last = segments.last().expect("parse_path never returns an empty Vec");
        Ok((current, last.name.to_string(), last.index))
    }

    fn step(&self, segment: &Segment<'_>, create_if_missing: bool) -> Result<StorageObject> {
        match segment.index {
            None => {
                if create_if_missing {
                    self.get_object(segment.name)
                } else {
                    let handle = self.handle()?;
                    let slot = {
                        let guard = self.lock_checked(&handle)?;
                        let idx = guard.index_of(segment.name)?;
                        if idx < 0 {
                            return Err(Error::NotFound { name: segment.name.to_string() });
                        }
                        let descriptor = guard.field_descriptor(idx as u32)?;
                        if descriptor.field_kind.kind != ValueKind::Ref || descriptor.field_kind.is_array {
                            return Err(Error::ReferenceKindMismatch {
                                name: segment.name.to_string(),
                                expected: "reference",
                                actual: "value",
                            });
                        }
                        let bytes = guard.read_bytes(segment.name)?;
                        LittleEndian::read_u64(&bytes)
                    };
                    if slot == NULL_ID {
                        return Err(Error::NotFound { name: segment.name.to_string() });
                    }
                    let child_handle = self.storage.registry().lookup(slot).ok_or(Error::Disposed {
                        id: slot,
                        handle_generation: 0,
                        current_generation: 0,
                    })?;
                    let generation = child_handle.lock().unwrap().generation();
                    Ok(StorageObject::new(self.storage.clone(), slot, generation))
                }
            }
            Some(index) => self.ref_array_slot(segment.name, index, create_if_missing),
        }
    }

    /// Navigate into the `index`-th element of a `Ref[]` array field,
    /// creating the array, growing it, and/or creating the child container
    /// when `create_if_missing`.
    fn ref_array_slot(&self, name: &str, index: u32, create_if_missing: bool) -> Result<StorageObject> {
        let handle = self.handle()?;
        let child_id = if create_if_missing {
            let mut guard = self.lock_checked(&handle)?;
            guard.ensure_ref_array_slot(self.storage.pool(), name, index)?
        } else {
            let guard = self.lock_checked(&handle)?;
            let idx = guard.index_of(name)?;
            if idx < 0 {
                return Err(Error::NotFound { name: name.to_string() });
            }
            let descriptor = guard.field_descriptor(idx as u32)?;
            if descriptor.field_kind.kind != ValueKind::Ref {
                return Err(Error::ReferenceKindMismatch {
                    name: name.to_string(),
                    expected: "reference array",
                    actual: "value",
                });
            }
            guard.read_array_element::<RefId>(name, index)?.0
        };

        if child_id != NULL_ID {
            let child_handle = self.storage.registry().lookup(child_id).ok_or(Error::Disposed {
                id: child_id,
                handle_generation: 0,
                current_generation: 0,
            })?;
            let generation = child_handle.lock().unwrap().generation();
            return Ok(StorageObject::new(self.storage.clone(), child_id, generation));
        }
        if !create_if_missing {
            return Err(Error::NotFound {
                name: format!("{name}[{index}]"),
            });
        }

        let child = Container::from_layout(self.storage.pool(), LayoutBuilder::new().build());
        let (new_id, child_handle) = self.storage.registry().register(child)?;
        let self_generation = {
            let mut guard = self.lock_checked(&handle)?;
            guard.set_ref_array_slot(name, index, new_id)?;
            guard.generation()
        };
        self.generation.set(self_generation);
        self.storage.registry().set_parent(new_id, self.id);
        self.notify_write(self_generation, &format!("{name}[{index}]"), ValueKind::Ref);
        let generation = child_handle.lock().unwrap().generation();
        Ok(StorageObject::new(self.storage.clone(), new_id, generation))
    }

    pub fn write_path<T: Scalar>(&self, path: &str, value: T) -> Result<()> {
        let (object, name, index) = self.navigate(path, true)?;
        match index {
            None => object.write(&name, value, true),
            Some(i) => {
                // the final segment is itself an array element: ensure
                // there's room, then write straight into the slot.
                let handle = object.handle()?;
                let generation = {
                    let mut guard = object.lock_checked(&handle)?;
                    let idx = guard.index_of(&name)?;
                    let needed = i + 1;
                    if idx < 0 {
                        let mut builder = guard.layout_builder()?;
                        builder.set_array(&name, T::KIND, needed);
                        guard.rescheme(object.storage.pool(), builder.build())?;
                    } else {
                        let descriptor = guard.field_descriptor(idx as u32)?;
                        let element_size = descriptor.element_size.max(1) as u32;
                        let cur_count = descriptor.data_length / element_size;
                        if cur_count < needed {
                            let mut builder = guard.layout_builder()?;
                            builder.set_array(&name, descriptor.field_kind.kind, needed);
                            guard.rescheme(object.storage.pool(), builder.build())?;
                        }
                    }
                    guard.write_array_element(&name, i, value)?;
                    guard.generation()
                };
                object.generation.set(generation);
                object.notify_write(generation, &format!("{name}[{i}]"), T::KIND);
                Ok(())
            }
        }
    }

    pub fn read_path<T: Scalar>(&self, path: &str) -> Result<T> {
        let (object, name, index) = self.navigate(path, false)?;
        match index {
            None => object.read(&name),
            Some(i) => object.read_array::<T>(&name)?.into_iter().nth(i as usize).ok_or(Error::OutOfRange {
                what: "path array index",
                index: i as i64,
                bound: 0,
            }),
        }
    }

    pub fn try_write_path<T: Scalar>(&self, path: &str, value: T) -> Result<bool> {
        Ok(fold_not_found(self.write_path(path, value))?.is_some())
    }

    pub fn try_read_path<T: Scalar>(&self, path: &str) -> Result<Option<T>> {
        fold_not_found(self.read_path(path))
    }

    // -- subscriptions --------------------------------------------------

    pub fn subscribe_field(&self, field_name: &str, callback: Subscriber) -> Result<SubscriptionId> {
        let handle = self.handle()?;
        let guard = self.lock_checked(&handle)?;
        Ok(self
            .storage
            .events()
            .subscribe_field(self.id, guard.generation(), field_name, callback))
    }

    pub fn subscribe(&self, callback: Subscriber) -> Result<SubscriptionId> {
        let handle = self.handle()?;
        let guard = self.lock_checked(&handle)?;
        Ok(self.storage.events().subscribe_container(self.id, guard.generation(), callback))
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.storage.events().unsubscribe(self.id, subscription);
    }

    fn unregister_all(&self, ids: Vec<u64>) {
        for id in ids {
            self.storage.registry().unregister(self.storage.pool(), id);
        }
    }
}

/// `NotFound` and `TypeMismatch` fold into `Ok(None)`; every other error
/// still propagates (spec §7's `Try*` policy).
fn fold_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(Error::NotFound { .. }) | Err(Error::TypeMismatch { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn string_roundtrip() {
        let storage = Storage::new();
        let root = storage.root();
        root.write_string("name", "Alice").unwrap();
        assert_eq!(root.read_string("name").unwrap(), "Alice");
        let child: Vec<Char16> = root.read_array("name").unwrap();
        assert_eq!(child.len(), 5);
    }

    #[test]
    fn schema_migration_by_value() {
        let storage = Storage::new();
        let root = storage.root();
        root.write("hp", 42i16, true).unwrap();
        root.write("hp", 70000i64, true).unwrap();
        assert_eq!(root.read::<i64>("hp").unwrap(), 70000);
    }

    #[test]
    fn ref_array_cascade_on_delete() {
        let storage = Storage::new();
        let root = storage.root();
        let mut ids = Vec::new();
        for i in 0..3u32 {
            let slot = root
                .step(&Segment { name: "children", index: Some(i) }, true)
                .unwrap();
            ids.push(slot.id());
        }
        root.delete("children").unwrap();
        for id in ids {
            assert!(storage.registry().lookup(id).is_none());
        }
    }

    #[test]
    fn ref_array_delete_with_null_gap_reports_correct_slot_index() {
        let storage = Storage::new();
        let root = storage.root();
        let slot0 = root.step(&Segment { name: "children", index: Some(0) }, true).unwrap();
        // slot 1 is left null; only slots 0 and 2 hold a child.
        let slot2 = root.step(&Segment { name: "children", index: Some(2) }, true).unwrap();

        let seen_paths = Arc::new(Mutex::new(Vec::new()));
        let seen = seen_paths.clone();
        root.subscribe(Arc::new(move |e: &Event| {
            if e.kind == EventKind::Delete && e.path.starts_with("children[") {
                seen.lock().unwrap().push(e.path.clone());
            }
        }))
        .unwrap();

        root.delete("children").unwrap();
        assert!(storage.registry().lookup(slot0.id()).is_none());
        assert!(storage.registry().lookup(slot2.id()).is_none());
        assert_eq!(seen_paths.lock().unwrap().as_slice(), ["children[0]", "children[2]"]);
    }

    #[test]
    fn scalar_ref_delete_fires_exactly_one_delete_event() {
        let storage = Storage::new();
        let root = storage.root();
        let child = root.get_object("inventory").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        root.subscribe(Arc::new(move |e: &Event| {
            if e.kind == EventKind::Delete {
                h.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .unwrap();

        root.delete("inventory").unwrap();
        assert!(storage.registry().lookup(child.id()).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn path_creation_builds_reference_chain() {
        let storage = Storage::new();
        let root = storage.root();
        root.write_path("a.b.c", 5i32).unwrap();
        assert_eq!(root.read_path::<i32>("a.b.c").unwrap(), 5);
        assert!(root.try_get_object("a").unwrap().is_some());
    }

    #[test]
    fn explicit_cast_allows_narrowing_implicit_does_not() {
        let storage = Storage::new();
        let root = storage.root();
        root.write("x", 3.7f64, true).unwrap();

        assert!(root.try_read_implicit::<i32>("x").unwrap().is_none());
        assert_eq!(root.try_read_explicit::<i32>("x").unwrap(), Some(3));
    }

    #[test]
    fn rename_moves_subscribers_before_write() {
        let storage = Storage::new();
        let root = storage.root();
        root.write("old", 1i32, true).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        root.subscribe_field(
            "old",
            Arc::new(move |e: &Event| {
                if e.path == "new" && e.kind == EventKind::Write {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

        root.rename("old", "new").unwrap();
        root.write("new", 2i32, true).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispose_invalidates_handle() {
        let storage = Storage::new();
        let root = storage.root();
        let child = root.get_object("inventory").unwrap();
        storage.registry().unregister(storage.pool(), child.id());
        let err = child.read::<i32>("count").unwrap_err();
        assert!(matches!(err, Error::Disposed { .. }));
    }
}
