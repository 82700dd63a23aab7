//! A single buffer and the typed operations over it (spec §4.E).
//!
//! `Container` does not know about the registry or the event bus; it owns
//! exactly one buffer and reports, via return values, when an operation
//! orphaned reference ids (so a higher layer can unregister them) or
//! changed identity in a way subscribers should hear about. [`crate::registry`]
//! and [`crate::events`] are the layers that react to those return values.

use crate::byte_pool::BytePool;
use crate::error::{Error, Result};
use crate::kind::{FieldKind, Scalar, ValueKind};
use crate::layout::{codec, FieldDescriptor, LayoutBuilder};

/// Sentinel used for a container that has never been handed to a registry.
pub const WILD_ID: u64 = u64::MAX;
/// Sentinel for "no reference" / "empty slot".
pub const NULL_ID: u64 = 0;

/// Owns one tightly packed buffer and the typed operations over it.
#[derive(Debug)]
pub struct Container {
    id: u64,
    generation: u64,
    schema_version: u32,
    buffer: Vec<u8>,
    disposed: bool,
}

impl Container {
    /// Allocate an empty container (zero fields) from `pool`.
    pub fn create(pool: &BytePool) -> Container {
        Self::from_layout(pool, LayoutBuilder::new().build())
    }

    pub(crate) fn from_layout(pool: &BytePool, layout: Vec<u8>) -> Container {
        let mut buffer = pool.rent(layout.len());
        buffer.truncate(layout.len());
        buffer.copy_from_slice(&layout);
        Container {
            id: WILD_ID,
            generation: 1,
            schema_version: 0,
            buffer,
            disposed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Set only by the registry, on `Register`.
    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn check_alive(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed {
                id: self.id,
                handle_generation: self.generation,
                current_generation: self.generation,
            });
        }
        Ok(())
    }

    pub fn field_count(&self) -> Result<u32> {
        self.check_alive()?;
        codec::field_count(&self.buffer)
    }

    pub fn field_descriptor(&self, index: u32) -> Result<FieldDescriptor> {
        self.check_alive()?;
        codec::field_descriptor(&self.buffer, index)
    }

    pub fn field_name(&self, index: u32) -> Result<String> {
        let descriptor = self.field_descriptor(index)?;
        codec::field_name(&self.buffer, &descriptor)
    }

    pub fn container_name(&self) -> Result<Option<String>> {
        self.check_alive()?;
        codec::container_name(&self.buffer)
    }

    /// Binary search by name; negative (bitwise-complement of the insertion
    /// index) when absent.
    pub fn index_of(&self, name: &str) -> Result<i64> {
        self.check_alive()?;
        codec::index_of(&self.buffer, name)
    }

    /// Read a typed scalar, growing the schema with a zero-initialized field
    /// of `T::KIND` if `name` is absent. Narrowing, float<->int and the
    /// bool/char16 bridges are all permitted (explicit mode).
    pub fn read<T: Scalar>(&mut self, pool: &BytePool, name: &str) -> Result<T> {
        self.read_mode(pool, name, true)
    }

    /// Read a typed scalar, rejecting any conversion outside the implicit
    /// widening lattice (spec §4.B, §8 scenario E). The schema is still
    /// grown with a zero-initialized field when `name` is absent, same as
    /// [`Container::read`].
    pub fn read_implicit<T: Scalar>(&mut self, pool: &BytePool, name: &str) -> Result<T> {
        self.read_mode(pool, name, false)
    }

    fn read_mode<T: Scalar>(&mut self, pool: &BytePool, name: &str, explicit: bool) -> Result<T> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            self.add_scalar_field(pool, name, T::KIND)?;
            return Ok(T::default());
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        if descriptor.field_kind.kind == ValueKind::Ref && T::KIND != ValueKind::Ref {
            return Err(Error::ReferenceKindMismatch {
                name: name.to_string(),
                expected: "value",
                actual: "reference",
            });
        }
        let data = codec::field_data(&self.buffer, &descriptor)?;
        let mut scratch = [0u8; 8];
        let n = T::KIND.size_of();
        crate::migrate::migrate(data, descriptor.field_kind.kind, &mut scratch[..n], T::KIND, explicit)?;
        Ok(T::from_le_bytes(&scratch[..n]))
    }

    /// Write a typed scalar. Returns any reference ids orphaned by a rebuild
    /// (only possible when the field previously held a reference of a
    /// different kind and was rebuilt to hold `T`); the caller must
    /// unregister them.
    pub fn write<T: Scalar>(
        &mut self,
        pool: &BytePool,
        name: &str,
        value: T,
        allow_rescheme: bool,
    ) -> Result<Vec<u64>> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            if !allow_rescheme {
                return Err(Error::NotFound {
                    name: name.to_string(),
                });
            }
            self.add_scalar_field(pool, name, T::KIND)?;
            let idx2 = codec::index_of(&self.buffer, name)?;
            return self.write_at_index(pool, idx2 as u32, name, value, allow_rescheme);
        }
        self.write_at_index(pool, idx as u32, name, value, allow_rescheme)
    }

    fn write_at_index<T: Scalar>(
        &mut self,
        pool: &BytePool,
        index: u32,
        name: &str,
        value: T,
        allow_rescheme: bool,
    ) -> Result<Vec<u64>> {
        let descriptor = codec::field_descriptor(&self.buffer, index)?;
        if descriptor.field_kind.kind == ValueKind::Ref && T::KIND != ValueKind::Ref {
            return Err(Error::ReferenceKindMismatch {
                name: name.to_string(),
                expected: "value",
                actual: "reference",
            });
        }
        let mut value_bytes = [0u8; 8];
        let value_len = T::KIND.size_of();
        value.write_le_bytes(&mut value_bytes[..value_len]);

        let field_len = descriptor.data_length as usize;

        if field_len == value_len {
            let data = codec::field_data_mut(&mut self.buffer, &descriptor)?;
            data.copy_from_slice(&value_bytes[..value_len]);
            codec::set_field_kind_byte(&mut self.buffer, index, FieldKind::scalar(T::KIND))?;
            return Ok(Vec::new());
        }

        if field_len < value_len {
            if !allow_rescheme {
                return Err(Error::SizeMismatch {
                    expected: field_len,
                    actual: value_len,
                });
            }
            let mut builder = LayoutBuilder::from_buffer(&self.buffer)?;
            builder.set_scalar(name, T::KIND);
            let orphaned = self.rescheme(pool, builder.build())?;
            let idx2 = codec::index_of(&self.buffer, name)?;
            let descriptor2 = codec::field_descriptor(&self.buffer, idx2 as u32)?;
            let data = codec::field_data_mut(&mut self.buffer, &descriptor2)?;
            data.copy_from_slice(&value_bytes[..value_len]);
            return Ok(orphaned);
        }

        // field_len > value_len: widen/convert through the migration kernel;
        // only retag when the slot was untyped.
        let data = codec::field_data_mut(&mut self.buffer, &descriptor)?;
        crate::migrate::migrate(&value_bytes[..value_len], T::KIND, data, descriptor.field_kind.kind, true)?;
        if descriptor.field_kind.kind == ValueKind::Unknown {
            codec::set_field_kind_byte(&mut self.buffer, index, FieldKind::scalar(T::KIND))?;
        }
        Ok(Vec::new())
    }

    /// Raw read of a field's current bytes.
    pub fn read_bytes(&self, name: &str) -> Result<Vec<u8>> {
        self.check_alive()?;
        let idx = self.index_of(name)?;
        if idx < 0 {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        Ok(codec::field_data(&self.buffer, &descriptor)?.to_vec())
    }

    /// Raw overwrite; `src.len()` must equal the field's declared data length.
    pub fn write_bytes(&mut self, name: &str, src: &[u8]) -> Result<()> {
        self.check_alive()?;
        let idx = self.index_of(name)?;
        if idx < 0 {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        if src.len() != descriptor.data_length as usize {
            return Err(Error::SizeMismatch {
                expected: descriptor.data_length as usize,
                actual: src.len(),
            });
        }
        let data = codec::field_data_mut(&mut self.buffer, &descriptor)?;
        data.copy_from_slice(src);
        Ok(())
    }

    /// The current value of a reference field, creating the slot (as
    /// `NULL_ID`) if absent. Fails if `name` exists as a non-reference field.
    pub fn get_ref(&mut self, pool: &BytePool, name: &str) -> Result<u64> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            self.add_scalar_field(pool, name, ValueKind::Ref)?;
            return Ok(NULL_ID);
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        if descriptor.field_kind.kind != ValueKind::Ref {
            return Err(Error::ReferenceKindMismatch {
                name: name.to_string(),
                expected: "reference",
                actual: "value",
            });
        }
        let data = codec::field_data(&self.buffer, &descriptor)?;
        Ok(byteorder::LittleEndian::read_u64(data))
    }

    /// Overwrite a reference slot's id. `name` must already be a reference
    /// field (call [`Container::get_ref`] first to create it).
    pub fn set_ref(&mut self, name: &str, id: u64) -> Result<()> {
        self.write_bytes(name, &id.to_le_bytes())
    }

    /// Every non-zero id currently held in any reference field (scalar or
    /// array), used by the registry's cascading unregister.
    pub fn ref_child_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        let count = match codec::field_count(&self.buffer) {
            Ok(c) => c,
            Err(_) => return ids,
        };
        for i in 0..count {
            let Ok(descriptor) = codec::field_descriptor(&self.buffer, i) else {
                continue;
            };
            if descriptor.field_kind.kind != ValueKind::Ref {
                continue;
            }
            let Ok(data) = codec::field_data(&self.buffer, &descriptor) else {
                continue;
            };
            for chunk in data.chunks_exact(8) {
                let id = byteorder::LittleEndian::read_u64(chunk);
                if id != NULL_ID {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Find the reference field through which `child_id` is reachable from
    /// this container: `(field_name, Some(array_index))` for an inline
    /// reference array, `(field_name, None)` for a scalar reference field.
    /// Used by the event registry to build bubbled paths.
    pub fn find_ref_slot(&self, child_id: u64) -> Option<(String, Option<u32>)> {
        let count = codec::field_count(&self.buffer).ok()?;
        for i in 0..count {
            let descriptor = codec::field_descriptor(&self.buffer, i).ok()?;
            if descriptor.field_kind.kind != ValueKind::Ref {
                continue;
            }
            let data = codec::field_data(&self.buffer, &descriptor).ok()?;
            if !descriptor.field_kind.is_array {
                if byteorder::LittleEndian::read_u64(data) == child_id {
                    return Some((codec::field_name(&self.buffer, &descriptor).ok()?, None));
                }
                continue;
            }
            for (idx, chunk) in data.chunks_exact(8).enumerate() {
                if byteorder::LittleEndian::read_u64(chunk) == child_id {
                    return Some((codec::field_name(&self.buffer, &descriptor).ok()?, Some(idx as u32)));
                }
            }
        }
        None
    }

    /// A builder seeded from this container's current descriptor table, for
    /// callers that need to edit the schema before a rescheme (spec: facade
    /// `Delete`, `GetObject`'s "does the array need to grow" checks).
    pub fn layout_builder(&self) -> Result<LayoutBuilder> {
        self.check_alive()?;
        LayoutBuilder::from_buffer(&self.buffer)
    }

    /// Element count of an inline array field (or `1` for a scalar field,
    /// generalizing the two the way `ToArray`/`ReadArray` need to).
    pub fn array_len(&self, name: &str) -> Result<usize> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            return Err(Error::NotFound { name: name.to_string() });
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        let element_size = descriptor.element_size.max(1) as u32;
        Ok((descriptor.data_length / element_size) as usize)
    }

    pub fn array_element_kind(&self, name: &str) -> Result<ValueKind> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            return Err(Error::NotFound { name: name.to_string() });
        }
        Ok(codec::field_descriptor(&self.buffer, idx as u32)?.field_kind.kind)
    }

    /// Read every element of an inline array field, converting each one
    /// through the migration kernel into `T::KIND` (explicit mode, same
    /// rule `Read<T>` uses for scalars).
    pub fn read_array<T: Scalar>(&self, name: &str) -> Result<Vec<T>> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            return Err(Error::NotFound { name: name.to_string() });
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        let data = codec::field_data(&self.buffer, &descriptor)?;
        let src_kind = descriptor.field_kind.kind;
        let src_size = src_kind.size_of().max(1);
        let dst_size = T::KIND.size_of();
        let count = data.len() / src_size;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let chunk = &data[i * src_size..(i + 1) * src_size];
            let mut scratch = [0u8; 8];
            crate::migrate::migrate(chunk, src_kind, &mut scratch[..dst_size], T::KIND, true)?;
            out.push(T::from_le_bytes(&scratch[..dst_size]));
        }
        Ok(out)
    }

    /// Read a single array element by index, without materializing the
    /// whole array.
    pub fn read_array_element<T: Scalar>(&self, name: &str, index: u32) -> Result<T> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            return Err(Error::NotFound { name: name.to_string() });
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        let data = codec::field_data(&self.buffer, &descriptor)?;
        let src_kind = descriptor.field_kind.kind;
        let src_size = src_kind.size_of().max(1);
        let start = index as usize * src_size;
        let end = start + src_size;
        if end > data.len() {
            return Err(Error::OutOfRange {
                what: "array index",
                index: index as i64,
                bound: (data.len() / src_size) as i64,
            });
        }
        let dst_size = T::KIND.size_of();
        let mut scratch = [0u8; 8];
        crate::migrate::migrate(&data[start..end], src_kind, &mut scratch[..dst_size], T::KIND, true)?;
        Ok(T::from_le_bytes(&scratch[..dst_size]))
    }

    /// Write a single array element by index in place (no rescheme: the
    /// slot must already exist at this length and kind).
    pub fn write_array_element<T: Scalar>(&mut self, name: &str, index: u32, value: T) -> Result<()> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            return Err(Error::NotFound { name: name.to_string() });
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        let dst_kind = descriptor.field_kind.kind;
        let dst_size = dst_kind.size_of().max(1);
        let start = index as usize * dst_size;
        let end = start + dst_size;
        if end > descriptor.data_length as usize {
            return Err(Error::OutOfRange {
                what: "array index",
                index: index as i64,
                bound: (descriptor.data_length as usize / dst_size) as i64,
            });
        }
        let mut value_bytes = [0u8; 8];
        let value_len = T::KIND.size_of();
        value.write_le_bytes(&mut value_bytes[..value_len]);
        let data = codec::field_data_mut(&mut self.buffer, &descriptor)?;
        crate::migrate::migrate(&value_bytes[..value_len], T::KIND, &mut data[start..end], dst_kind, true)
    }

    /// Replace an inline array field wholesale, rescheming (add, or resize
    /// to a different length/kind) when `allow_rescheme` permits it. Returns
    /// ids orphaned by a kind change on a field that used to be a reference
    /// array.
    pub fn write_array<T: Scalar>(
        &mut self,
        pool: &BytePool,
        name: &str,
        items: &[T],
        allow_rescheme: bool,
    ) -> Result<Vec<u64>> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        let need_count = items.len() as u32;

        let (final_idx, orphaned) = if idx < 0 {
            if !allow_rescheme {
                return Err(Error::NotFound { name: name.to_string() });
            }
            let mut builder = LayoutBuilder::from_buffer(&self.buffer)?;
            builder.set_array(name, T::KIND, need_count);
            let orphaned = self.rescheme(pool, builder.build())?;
            (codec::index_of(&self.buffer, name)? as u32, orphaned)
        } else {
            let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
            let element_size = descriptor.element_size.max(1) as u32;
            let cur_count = descriptor.data_length / element_size;
            if descriptor.field_kind.kind == T::KIND && cur_count == need_count {
                (idx as u32, Vec::new())
            } else {
                if !allow_rescheme {
                    return Err(Error::SizeMismatch {
                        expected: descriptor.data_length as usize,
                        actual: need_count as usize * T::KIND.size_of(),
                    });
                }
                let mut builder = LayoutBuilder::from_buffer(&self.buffer)?;
                builder.set_array(name, T::KIND, need_count);
                let orphaned = self.rescheme(pool, builder.build())?;
                (codec::index_of(&self.buffer, name)? as u32, orphaned)
            }
        };

        let descriptor = codec::field_descriptor(&self.buffer, final_idx)?;
        let elem_size = T::KIND.size_of();
        let data = codec::field_data_mut(&mut self.buffer, &descriptor)?;
        for (i, item) in items.iter().enumerate() {
            item.write_le_bytes(&mut data[i * elem_size..(i + 1) * elem_size]);
        }
        codec::set_field_kind_byte(&mut self.buffer, final_idx, FieldKind::array(T::KIND))?;
        Ok(orphaned)
    }

    /// Read or create-and-grow a `Ref[]` array field so that `index` is a
    /// valid slot, returning whatever id (possibly `NULL_ID`) currently sits
    /// there. Existing ids are preserved across the grow (spec rescheme rule
    /// 1: same field kind/refness survives by a `min(old, new)` byte copy).
    pub fn ensure_ref_array_slot(&mut self, pool: &BytePool, name: &str, index: u32) -> Result<u64> {
        self.check_alive()?;
        let needed_count = index + 1;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            let mut builder = LayoutBuilder::from_buffer(&self.buffer)?;
            builder.set_array(name, ValueKind::Ref, needed_count);
            self.rescheme(pool, builder.build())?;
        } else {
            let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
            if descriptor.field_kind.kind != ValueKind::Ref {
                return Err(Error::ReferenceKindMismatch {
                    name: name.to_string(),
                    expected: "reference array",
                    actual: "value",
                });
            }
            let element_size = descriptor.element_size.max(1) as u32;
            let cur_count = descriptor.data_length / element_size;
            if cur_count < needed_count {
                let mut builder = LayoutBuilder::from_buffer(&self.buffer)?;
                builder.set_array(name, ValueKind::Ref, needed_count);
                self.rescheme(pool, builder.build())?;
            }
        }
        let idx2 = codec::index_of(&self.buffer, name)?;
        let descriptor2 = codec::field_descriptor(&self.buffer, idx2 as u32)?;
        let data = codec::field_data(&self.buffer, &descriptor2)?;
        let offset = index as usize * 8;
        Ok(byteorder::LittleEndian::read_u64(&data[offset..offset + 8]))
    }

    /// Overwrite one slot of an existing `Ref[]` array field.
    pub fn set_ref_array_slot(&mut self, name: &str, index: u32, id: u64) -> Result<()> {
        self.check_alive()?;
        let idx = codec::index_of(&self.buffer, name)?;
        if idx < 0 {
            return Err(Error::NotFound { name: name.to_string() });
        }
        let descriptor = codec::field_descriptor(&self.buffer, idx as u32)?;
        if descriptor.field_kind.kind != ValueKind::Ref {
            return Err(Error::ReferenceKindMismatch {
                name: name.to_string(),
                expected: "reference array",
                actual: "value",
            });
        }
        let offset = index as usize * 8;
        if offset + 8 > descriptor.data_length as usize {
            return Err(Error::OutOfRange {
                what: "ref array index",
                index: index as i64,
                bound: descriptor.data_length as i64 / 8,
            });
        }
        let data = codec::field_data_mut(&mut self.buffer, &descriptor)?;
        byteorder::LittleEndian::write_u64(&mut data[offset..offset + 8], id);
        Ok(())
    }

    /// Rename a field in place, preserving its bytes, kind and array length.
    /// Generation still advances (rescheme always rebuilds the buffer) but
    /// no reference ids are orphaned: the field itself is unchanged, only
    /// its name.
    pub fn rename_field(&mut self, pool: &BytePool, old_name: &str, new_name: &str) -> Result<()> {
        self.check_alive()?;
        let idx = self.index_of(old_name)?;
        if idx < 0 {
            return Err(Error::NotFound {
                name: old_name.to_string(),
            });
        }
        let old_bytes = self.read_bytes(old_name)?;
        let mut builder = self.layout_builder()?;
        builder.rename(old_name, new_name);
        self.rescheme(pool, builder.build())?;
        self.write_bytes(new_name, &old_bytes)
    }

    fn add_scalar_field(&mut self, pool: &BytePool, name: &str, kind: ValueKind) -> Result<()> {
        let mut builder = LayoutBuilder::from_buffer(&self.buffer)?;
        builder.set_scalar(name, kind);
        self.rescheme(pool, builder.build())?;
        Ok(())
    }

    /// Replace the buffer with one matching `new_layout`, migrating each
    /// surviving field by name. Returns reference ids orphaned by fields
    /// that were dropped or changed kind/refness, for the caller to
    /// unregister.
    pub fn rescheme(&mut self, pool: &BytePool, new_layout: Vec<u8>) -> Result<Vec<u64>> {
        self.check_alive()?;
        let span = tracing::trace_span!("container.rescheme", id = self.id, generation = self.generation);
        let _enter = span.enter();

        let old_count = codec::field_count(&self.buffer)?;
        let mut orphaned = Vec::new();
        let mut new_buffer = pool.rent(new_layout.len());
        new_buffer.truncate(new_layout.len());
        new_buffer.copy_from_slice(&new_layout);

        for i in 0..old_count {
            let old_descriptor = codec::field_descriptor(&self.buffer, i)?;
            let name = codec::field_name(&self.buffer, &old_descriptor)?;
            let old_data = codec::field_data(&self.buffer, &old_descriptor)?.to_vec();

            let new_idx = codec::index_of(&new_buffer, &name)?;
            if new_idx < 0 {
                if old_descriptor.field_kind.kind == ValueKind::Ref {
                    orphaned.extend(ids_in(&old_data));
                }
                continue;
            }
            let new_descriptor = codec::field_descriptor(&new_buffer, new_idx as u32)?;
            if new_descriptor.field_kind == old_descriptor.field_kind {
                let n = old_data.len().min(new_descriptor.data_length as usize);
                let dst = codec::field_data_mut(&mut new_buffer, &new_descriptor)?;
                dst[..n].copy_from_slice(&old_data[..n]);
            } else if old_descriptor.field_kind.kind == ValueKind::Ref {
                orphaned.extend(ids_in(&old_data));
            }
            // else: kind changed but wasn't a reference; new slot stays zeroed.
        }

        if !orphaned.is_empty() {
            tracing::warn!(
                id = self.id,
                count = orphaned.len(),
                "rescheme dropped reference field(s); cascading unregister required"
            );
        }

        let old_buffer = std::mem::replace(&mut self.buffer, new_buffer);
        pool.return_buffer(old_buffer);
        self.schema_version += 1;
        self.generation += 1;
        Ok(orphaned)
    }

    /// Convert a single non-reference field to `target_kind` in place or via
    /// a rebuild when the element size changes.
    pub fn migrate_field(&mut self, pool: &BytePool, index: u32, target_kind: ValueKind) -> Result<()> {
        self.check_alive()?;
        let span = tracing::trace_span!("container.migrate", id = self.id, generation = self.generation);
        let _enter = span.enter();

        let descriptor = codec::field_descriptor(&self.buffer, index)?;
        if descriptor.field_kind.kind == ValueKind::Ref || target_kind == ValueKind::Ref {
            return Err(Error::Unsupported {
                from: descriptor.field_kind.kind,
                to: target_kind,
            });
        }

        let old_element_size = descriptor.element_size.max(1) as usize;
        let new_element_size = target_kind.size_of().max(1);
        let element_count = (descriptor.data_length as usize / old_element_size).max(1);

        if old_element_size == new_element_size {
            let data = codec::field_data_mut(&mut self.buffer, &descriptor)?;
            if descriptor.field_kind.is_array {
                crate::migrate::convert_in_place_same_size(
                    data,
                    element_count,
                    descriptor.field_kind.kind,
                    target_kind,
                )?;
            } else {
                let mut scratch = [0u8; 8];
                scratch[..data.len()].copy_from_slice(data);
                crate::migrate::migrate(&scratch[..data.len()], descriptor.field_kind.kind, data, target_kind, true)?;
            }
            codec::set_field_kind_byte(
                &mut self.buffer,
                index,
                FieldKind {
                    kind: target_kind,
                    is_array: descriptor.field_kind.is_array,
                },
            )?;
            return Ok(());
        }

        let name = codec::field_name(&self.buffer, &descriptor)?;
        let old_data = codec::field_data(&self.buffer, &descriptor)?.to_vec();
        let old_kind = descriptor.field_kind.kind;
        let is_array = descriptor.field_kind.is_array;

        let mut builder = LayoutBuilder::from_buffer(&self.buffer)?;
        if is_array {
            builder.set_array(&name, target_kind, element_count as u32);
        } else {
            builder.set_scalar(&name, target_kind);
        }
        self.rescheme(pool, builder.build())?;

        let new_idx = codec::index_of(&self.buffer, &name)?;
        let new_descriptor = codec::field_descriptor(&self.buffer, new_idx as u32)?;
        let new_data = codec::field_data_mut(&mut self.buffer, &new_descriptor)?;
        if is_array {
            for i in 0..element_count {
                let src = &old_data[i * old_element_size..(i + 1) * old_element_size];
                let dst = &mut new_data[i * new_element_size..(i + 1) * new_element_size];
                crate::migrate::migrate(src, old_kind, dst, target_kind, true)?;
            }
        } else {
            crate::migrate::migrate(&old_data, old_kind, new_data, target_kind, true)?;
        }
        Ok(())
    }

    /// If the field's current kind already matches `T::KIND`, do nothing.
    /// If `Unknown`, stamp the kind without touching bytes. Otherwise
    /// convert via [`Container::migrate_field`].
    pub fn ensure_field_for_read<T: Scalar>(&mut self, pool: &BytePool, index: u32) -> Result<()> {
        let descriptor = self.field_descriptor(index)?;
        if descriptor.field_kind.kind == T::KIND {
            return Ok(());
        }
        if descriptor.field_kind.kind == ValueKind::Unknown {
            return codec::set_field_kind_byte(
                &mut self.buffer,
                index,
                FieldKind {
                    kind: T::KIND,
                    is_array: descriptor.field_kind.is_array,
                },
            );
        }
        self.migrate_field(pool, index, T::KIND)
    }

    /// Return the buffer to `pool` and mark this container unusable. Any
    /// generation captured by a handle before this call will subsequently
    /// mismatch.
    pub fn dispose(&mut self, pool: &BytePool) {
        if self.disposed {
            return;
        }
        let buffer = std::mem::take(&mut self.buffer);
        pool.return_buffer(buffer);
        self.disposed = true;
        self.generation += 1;
    }
}

fn ids_in(data: &[u8]) -> Vec<u64> {
    data.chunks_exact(8)
        .map(byteorder::LittleEndian::read_u64)
        .filter(|&id| id != NULL_ID)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{Char16, RefId};

    #[test]
    fn read_absent_field_schemes_it_in_as_zero() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        let value: i32 = c.read(&pool, "hp").unwrap();
        assert_eq!(value, 0);
        assert!(c.index_of("hp").unwrap() >= 0);
    }

    #[test]
    fn read_implicit_rejects_narrowing_that_explicit_read_allows() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "x", 3.7f64, true).unwrap();

        let err = c.read_implicit::<i32>(&pool, "x").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));

        let value: i32 = c.read(&pool, "x").unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "hp", 42i32, true).unwrap();
        let value: i32 = c.read(&pool, "hp").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn write_changes_type_when_size_matches() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "x", 1i32, true).unwrap();
        c.write(&pool, "x", 1.5f32, true).unwrap();
        let value: f32 = c.read(&pool, "x").unwrap();
        assert_eq!(value, 1.5);
    }

    #[test]
    fn write_widens_into_larger_existing_slot() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "x", 1i64, true).unwrap();
        c.write(&pool, "x", 7i32, true).unwrap();
        let value: i64 = c.read(&pool, "x").unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn write_without_rescheme_fails_on_missing_field() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        let err = c.write(&pool, "x", 1i32, false).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn get_ref_creates_and_rejects_value_field() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        assert_eq!(c.get_ref(&pool, "child").unwrap(), NULL_ID);
        c.set_ref("child", 9).unwrap();
        assert_eq!(c.get_ref(&pool, "child").unwrap(), 9);

        c.write(&pool, "scalar", 1i32, true).unwrap();
        let err = c.get_ref(&pool, "scalar").unwrap_err();
        assert!(matches!(err, Error::ReferenceKindMismatch { .. }));
    }

    #[test]
    fn rescheme_drops_and_orphans_reference_field() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.get_ref(&pool, "child").unwrap();
        c.set_ref("child", 5).unwrap();

        let layout = LayoutBuilder::new().build(); // drop every field
        let orphaned = c.rescheme(&pool, layout).unwrap();
        assert_eq!(orphaned, vec![5]);
        assert!(c.index_of("child").unwrap() < 0);
    }

    #[test]
    fn rescheme_with_changed_kind_zeroes_rather_than_converts() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "x", 42i32, true).unwrap();

        // A global rescheme that retypes "x" in place, bypassing write/migrate.
        let mut builder = c.layout_builder().unwrap();
        builder.set_scalar("x", ValueKind::Int64);
        let orphaned = c.rescheme(&pool, builder.build()).unwrap();
        assert!(orphaned.is_empty());

        // Rule 3 (§4.E): rescheme never runs the migration kernel on a
        // retyped field; the new slot is zeroed, not a converted 42.
        let value: i64 = c.read(&pool, "x").unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn migrate_field_same_size_in_place() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "x", -1i32, true).unwrap();
        let idx = c.index_of("x").unwrap() as u32;
        c.migrate_field(&pool, idx, ValueKind::UInt32).unwrap();
        let value: u32 = c.read(&pool, "x").unwrap();
        assert_eq!(value, u32::MAX);
    }

    #[test]
    fn migrate_field_different_size_rebuilds() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "x", 70000i32, true).unwrap();
        let idx = c.index_of("x").unwrap() as u32;
        c.migrate_field(&pool, idx, ValueKind::Int64).unwrap();
        let value: i64 = c.read(&pool, "x").unwrap();
        assert_eq!(value, 70000);
    }

    #[test]
    fn ensure_field_for_read_stamps_unknown_without_touching_bytes() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        let mut builder = LayoutBuilder::new();
        builder.set_scalar("x", ValueKind::Unknown);
        c.rescheme(&pool, builder.build()).unwrap();
        c.write_bytes("x", &1i32.to_le_bytes()).unwrap();

        let idx = c.index_of("x").unwrap() as u32;
        c.ensure_field_for_read::<i32>(&pool, idx).unwrap();
        let value: i32 = c.read(&pool, "x").unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn dispose_is_idempotent_and_flags_stale_ops() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.dispose(&pool);
        c.dispose(&pool);
        let err = c.index_of("x").unwrap_err();
        assert!(matches!(err, Error::Disposed { .. }));
    }

    #[test]
    fn write_array_then_read_array_roundtrip() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write_array(&pool, "scores", &[1i32, 2, 3], true).unwrap();
        assert_eq!(c.array_len("scores").unwrap(), 3);
        let widened: Vec<i64> = c.read_array("scores").unwrap();
        assert_eq!(widened, vec![1, 2, 3]);
    }

    #[test]
    fn write_array_element_updates_single_slot() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write_array(&pool, "items", &[0i32, 0, 0], true).unwrap();
        c.write_array_element("items", 1, 9i32).unwrap();
        assert_eq!(c.read_array_element::<i32>("items", 1).unwrap(), 9);
        assert_eq!(c.read_array_element::<i32>("items", 0).unwrap(), 0);
    }

    #[test]
    fn ensure_ref_array_slot_grows_and_preserves_existing() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        assert_eq!(c.ensure_ref_array_slot(&pool, "children", 0).unwrap(), NULL_ID);
        c.set_ref_array_slot("children", 0, 7).unwrap();
        assert_eq!(c.ensure_ref_array_slot(&pool, "children", 2).unwrap(), NULL_ID);
        assert_eq!(c.read_array_element::<RefId>("children", 0).unwrap().0, 7);
    }

    #[test]
    fn rename_field_preserves_value() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "old", 42i32, true).unwrap();
        c.rename_field(&pool, "old", "new").unwrap();
        assert!(c.index_of("old").unwrap() < 0);
        let value: i32 = c.read(&pool, "new").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn char16_and_ref_scalars_roundtrip() {
        let pool = BytePool::new();
        let mut c = Container::create(&pool);
        c.write(&pool, "ch", Char16(b'Q' as u16), true).unwrap();
        let back: Char16 = c.read(&pool, "ch").unwrap();
        assert_eq!(back.0, b'Q' as u16);

        c.get_ref(&pool, "child").unwrap();
        c.set_ref("child", 3).unwrap();
        let back_ref: RefId = c.read(&pool, "child").unwrap();
        assert_eq!(back_ref.0, 3);
    }
}
