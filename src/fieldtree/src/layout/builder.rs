//! Describes a desired schema and produces the bytes of a fresh header +
//! field descriptor table with a zero-filled data region (spec §4.G).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use byteorder::{ByteOrder, LittleEndian};

use crate::kind::{FieldKind, ValueKind};
use crate::layout::codec::{FIELD_DESCRIPTOR_SIZE, HEADER_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FieldSpec {
    name: String,
    kind: ValueKind,
    is_array: bool,
    /// Element count for arrays (including byte-length for `Blob`, which is
    /// always carried as a 1-byte-element array); `1` for scalars.
    element_count: u32,
}

impl FieldSpec {
    fn element_size(&self) -> u32 {
        if self.kind == ValueKind::Blob {
            1
        } else {
            self.kind.size_of() as u32
        }
    }

    fn data_length(&self) -> u32 {
        self.element_size() * self.element_count.max(1)
    }
}

/// Builds an immutable layout (header + field descriptor table, zero-filled
/// data region) from a set of named, typed field specs.
#[derive(Debug, Clone, Default)]
pub struct LayoutBuilder {
    fields: Vec<FieldSpec>,
    container_name: Option<String>,
    cache: Option<(u64, Vec<u8>)>,
}

impl LayoutBuilder {
    pub fn new() -> Self {
        LayoutBuilder::default()
    }

    pub fn with_container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = Some(name.into());
        self.cache = None;
        self
    }

    fn upsert(&mut self, spec: FieldSpec) {
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == spec.name) {
            *existing = spec;
        } else {
            self.fields.push(spec);
        }
        self.cache = None;
    }

    pub fn set_scalar(&mut self, name: impl Into<String>, kind: ValueKind) -> &mut Self {
        debug_assert!(
            kind != ValueKind::Blob,
            "Blob fields must go through set_array (variable length)"
        );
        self.upsert(FieldSpec {
            name: name.into(),
            kind,
            is_array: false,
            element_count: 1,
        });
        self
    }

    pub fn set_array(
        &mut self,
        name: impl Into<String>,
        kind: ValueKind,
        length: u32,
    ) -> &mut Self {
        self.upsert(FieldSpec {
            name: name.into(),
            kind,
            is_array: true,
            element_count: length,
        });
        self
    }

    pub fn remove(&mut self, name: &str) -> &mut Self {
        if let Some(pos) = self.fields.iter().position(|f| f.name == name) {
            self.fields.remove(pos);
            self.cache = None;
        }
        self
    }

    pub fn rename(&mut self, old: &str, new: impl Into<String>) -> &mut Self {
        if let Some(field) = self.fields.iter_mut().find(|f| f.name == old) {
            field.name = new.into();
            self.cache = None;
        }
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// A fresh builder seeded with the same field set, for chained edits that
    /// should not mutate the original (spec: `Variate(edits)`).
    pub fn variate(&self) -> LayoutBuilder {
        self.clone()
    }

    /// Seed a builder from an existing container buffer's descriptor table,
    /// for editing before a rescheme (spec: `FromContainer(c)`).
    pub fn from_buffer(buffer: &[u8]) -> crate::error::Result<LayoutBuilder> {
        use crate::layout::codec;

        let mut builder = LayoutBuilder::new();
        if let Some(name) = codec::container_name(buffer)? {
            builder.container_name = Some(name);
        }
        let count = codec::field_count(buffer)?;
        for i in 0..count {
            let descriptor = codec::field_descriptor(buffer, i)?;
            let name = codec::field_name(buffer, &descriptor)?;
            let element_size = descriptor.element_size.max(1) as u32;
            let element_count = if descriptor.field_kind.is_array {
                descriptor.data_length / element_size
            } else {
                1
            };
            builder.upsert(FieldSpec {
                name,
                kind: descriptor.field_kind.kind,
                is_array: descriptor.field_kind.is_array,
                element_count,
            });
        }
        Ok(builder)
    }

    fn cache_key(&self) -> u64 {
        let mut sorted: Vec<&FieldSpec> = self.fields.iter().collect();
        sorted.sort_by(|a, b| utf16_of(&a.name).cmp(&utf16_of(&b.name)));
        let mut hasher = DefaultHasher::new();
        sorted.hash(&mut hasher);
        self.container_name.hash(&mut hasher);
        hasher.finish()
    }

    /// Build the layout bytes. Sorting is by ordinal UTF-16 comparison of
    /// field names, matching lookup's binary search order (spec invariant 1).
    /// Two builders with the same field set (name, kind, array length)
    /// produce byte-identical output (spec: deterministic alignment).
    pub fn build(&mut self) -> Vec<u8> {
        let key = self.cache_key();
        if let Some((cached_key, cached_bytes)) = &self.cache {
            if *cached_key == key {
                return cached_bytes.clone();
            }
        }
        let bytes = self.build_uncached();
        self.cache = Some((key, bytes.clone()));
        bytes
    }

    fn build_uncached(&self) -> Vec<u8> {
        let mut fields: Vec<&FieldSpec> = self.fields.iter().collect();
        fields.sort_by(|a, b| utf16_of(&a.name).cmp(&utf16_of(&b.name)));

        let count = fields.len();
        let descriptor_table_size = count * FIELD_DESCRIPTOR_SIZE;
        let name_region_offset = HEADER_SIZE + descriptor_table_size;

        // Lay out names contiguously first (byte-addressed, no alignment need).
        let mut name_offsets = Vec::with_capacity(count);
        let mut cursor = name_region_offset as u32;
        for field in &fields {
            name_offsets.push(cursor);
            cursor += (utf16_of(&field.name).len() * 2) as u32;
        }
        let (container_name_offset, container_name_length) =
            if let Some(name) = &self.container_name {
                let offset = cursor;
                let units = utf16_of(name);
                cursor += (units.len() * 2) as u32;
                (offset, units.len() as u16)
            } else {
                (0, 0)
            };

        let data_region_offset = cursor;

        // Data region: align each field's slot to its natural element size.
        let mut data_offsets = Vec::with_capacity(count);
        let mut cursor = data_region_offset;
        for field in &fields {
            let align = field.element_size().max(1);
            let remainder = cursor % align;
            if remainder != 0 {
                cursor += align - remainder;
            }
            data_offsets.push(cursor);
            cursor += field.data_length();
        }

        let total_length = cursor;
        let mut bytes = vec![0u8; total_length as usize];

        LittleEndian::write_u32(&mut bytes[0..4], total_length);
        LittleEndian::write_u32(&mut bytes[4..8], 0); // version tag, caller bumps on rescheme
        LittleEndian::write_u32(&mut bytes[8..12], count as u32);
        LittleEndian::write_u32(&mut bytes[12..16], name_region_offset as u32);
        LittleEndian::write_u32(&mut bytes[16..20], data_region_offset);
        LittleEndian::write_u32(&mut bytes[20..24], container_name_offset);
        LittleEndian::write_u16(&mut bytes[24..26], container_name_length);

        for (i, field) in fields.iter().enumerate() {
            let descriptor_offset = HEADER_SIZE + i * FIELD_DESCRIPTOR_SIZE;
            let name_units = utf16_of(&field.name);
            let name_hash = fnv1a(&field.name);
            let field_kind = FieldKind {
                kind: field.kind,
                is_array: field.is_array,
            };

            LittleEndian::write_u32(
                &mut bytes[descriptor_offset..descriptor_offset + 4],
                name_hash,
            );
            LittleEndian::write_u32(
                &mut bytes[descriptor_offset + 4..descriptor_offset + 8],
                name_offsets[i],
            );
            LittleEndian::write_u16(
                &mut bytes[descriptor_offset + 8..descriptor_offset + 10],
                name_units.len() as u16,
            );
            bytes[descriptor_offset + 10] = field_kind.to_byte();
            bytes[descriptor_offset + 11] = 0;
            LittleEndian::write_u32(
                &mut bytes[descriptor_offset + 12..descriptor_offset + 16],
                data_offsets[i],
            );
            LittleEndian::write_u16(
                &mut bytes[descriptor_offset + 16..descriptor_offset + 18],
                field.element_size() as u16,
            );
            LittleEndian::write_u16(&mut bytes[descriptor_offset + 18..descriptor_offset + 20], 0);
            LittleEndian::write_u32(
                &mut bytes[descriptor_offset + 20..descriptor_offset + 24],
                field.data_length(),
            );

            for (j, unit) in name_units.iter().enumerate() {
                let at = name_offsets[i] as usize + j * 2;
                LittleEndian::write_u16(&mut bytes[at..at + 2], *unit);
            }
        }

        if let Some(name) = &self.container_name {
            let units = utf16_of(name);
            for (j, unit) in units.iter().enumerate() {
                let at = container_name_offset as usize + j * 2;
                LittleEndian::write_u16(&mut bytes[at..at + 2], *unit);
            }
        }

        bytes
    }
}

fn utf16_of(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

fn fnv1a(name: &str) -> u32 {
    const PRIME: u32 = 16_777_619;
    let mut hash: u32 = 2_166_136_261;
    for unit in name.encode_utf16() {
        for byte in unit.to_le_bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}
