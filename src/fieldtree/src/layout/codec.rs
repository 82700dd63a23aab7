//! Reads the container header and field descriptor table inside a byte
//! buffer (spec §4.C, wire format in §6). Every accessor bounds-checks
//! against the buffer it was handed; out-of-range access fails with
//! [`Error::OutOfRange`].

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::kind::FieldKind;

/// Fixed container header size: total length, version, field count, name
/// region offset, data region offset, optional container-name offset/length.
pub const HEADER_SIZE: usize = 28;
/// Fixed field descriptor size (spec §6).
pub const FIELD_DESCRIPTOR_SIZE: usize = 24;

fn require(buffer: &[u8], offset: usize, len: usize, what: &'static str) -> Result<()> {
    let in_bounds = offset
        .checked_add(len)
        .map(|end| end <= buffer.len())
        .unwrap_or(false);
    if !in_bounds {
        return Err(Error::OutOfRange {
            what,
            index: offset as i64,
            bound: buffer.len() as i64,
        });
    }
    Ok(())
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&buffer[offset..offset + 4])
}

fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    LittleEndian::read_u16(&buffer[offset..offset + 2])
}

fn write_u32(buffer: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut buffer[offset..offset + 4], value);
}

fn write_u16(buffer: &mut [u8], offset: usize, value: u16) {
    LittleEndian::write_u16(&mut buffer[offset..offset + 2], value);
}

/// A single field's descriptor row, decoded from the table (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name_hash: u32,
    pub name_offset: u32,
    pub name_length: u16,
    pub field_kind: FieldKind,
    pub data_offset: u32,
    pub element_size: u16,
    pub data_length: u32,
}

pub fn total_length(buffer: &[u8]) -> Result<u32> {
    require(buffer, 0, 4, "header.total_length")?;
    Ok(read_u32(buffer, 0))
}

pub fn version(buffer: &[u8]) -> Result<u32> {
    require(buffer, 4, 4, "header.version")?;
    Ok(read_u32(buffer, 4))
}

pub fn set_version(buffer: &mut [u8], value: u32) -> Result<()> {
    require(buffer, 4, 4, "header.version")?;
    write_u32(buffer, 4, value);
    Ok(())
}

pub fn field_count(buffer: &[u8]) -> Result<u32> {
    require(buffer, 8, 4, "header.field_count")?;
    Ok(read_u32(buffer, 8))
}

pub fn name_region_offset(buffer: &[u8]) -> Result<u32> {
    require(buffer, 12, 4, "header.name_region_offset")?;
    Ok(read_u32(buffer, 12))
}

pub fn data_region_offset(buffer: &[u8]) -> Result<u32> {
    require(buffer, 16, 4, "header.data_region_offset")?;
    Ok(read_u32(buffer, 16))
}

pub fn container_name(buffer: &[u8]) -> Result<Option<String>> {
    require(buffer, 20, 8, "header.container_name")?;
    let offset = read_u32(buffer, 20);
    let length = read_u16(buffer, 24);
    if length == 0 {
        return Ok(None);
    }
    Ok(Some(read_utf16(buffer, offset as usize, length as usize)?))
}

pub fn set_container_name(buffer: &mut [u8], offset: u32, length_chars: u16) -> Result<()> {
    require(buffer, 20, 8, "header.container_name")?;
    write_u32(buffer, 20, offset);
    write_u16(buffer, 24, length_chars);
    Ok(())
}

/// Decode the `index`-th field descriptor row.
pub fn field_descriptor(buffer: &[u8], index: u32) -> Result<FieldDescriptor> {
    let count = field_count(buffer)?;
    if index >= count {
        return Err(Error::OutOfRange {
            what: "field index",
            index: index as i64,
            bound: count as i64,
        });
    }
    let offset = HEADER_SIZE + index as usize * FIELD_DESCRIPTOR_SIZE;
    require(buffer, offset, FIELD_DESCRIPTOR_SIZE, "field descriptor")?;

    let name_hash = read_u32(buffer, offset);
    let name_offset = read_u32(buffer, offset + 4);
    let name_length = read_u16(buffer, offset + 8);
    let field_kind = FieldKind::from_byte(buffer[offset + 10]).ok_or(Error::OutOfRange {
        what: "field kind byte",
        index: buffer[offset + 10] as i64,
        bound: 0,
    })?;
    let data_offset = read_u32(buffer, offset + 12);
    let element_size = read_u16(buffer, offset + 16);
    let data_length = read_u32(buffer, offset + 20);

    Ok(FieldDescriptor {
        name_hash,
        name_offset,
        name_length,
        field_kind,
        data_offset,
        element_size,
        data_length,
    })
}

pub fn set_field_kind_byte(buffer: &mut [u8], index: u32, field_kind: FieldKind) -> Result<()> {
    let offset = HEADER_SIZE + index as usize * FIELD_DESCRIPTOR_SIZE + 10;
    require(buffer, offset, 1, "field kind byte")?;
    buffer[offset] = field_kind.to_byte();
    Ok(())
}

fn read_utf16(buffer: &[u8], offset: usize, length_chars: usize) -> Result<String> {
    require(buffer, offset, length_chars * 2, "utf16 name/string region")?;
    let units: Vec<u16> = buffer[offset..offset + length_chars * 2]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// The raw UTF-16 code units backing a field's name, decoded pairwise (the
/// buffer has no alignment guarantee, so this is not a zero-copy `&[u16]`).
pub fn field_name_units(buffer: &[u8], descriptor: &FieldDescriptor) -> Result<Vec<u16>> {
    let offset = descriptor.name_offset as usize;
    let length = descriptor.name_length as usize;
    require(buffer, offset, length * 2, "field name")?;
    Ok(buffer[offset..offset + length * 2]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect())
}

pub fn field_name(buffer: &[u8], descriptor: &FieldDescriptor) -> Result<String> {
    read_utf16(buffer, descriptor.name_offset as usize, descriptor.name_length as usize)
}

pub fn field_data<'a>(buffer: &'a [u8], descriptor: &FieldDescriptor) -> Result<&'a [u8]> {
    let offset = descriptor.data_offset as usize;
    let length = descriptor.data_length as usize;
    require(buffer, offset, length, "field data")?;
    Ok(&buffer[offset..offset + length])
}

pub fn field_data_mut<'a>(
    buffer: &'a mut [u8],
    descriptor: &FieldDescriptor,
) -> Result<&'a mut [u8]> {
    let offset = descriptor.data_offset as usize;
    let length = descriptor.data_length as usize;
    require(buffer, offset, length, "field data")?;
    Ok(&mut buffer[offset..offset + length])
}

/// Binary search over the sorted field descriptor table for `name`. Mirrors
/// the convention used throughout: if absent, returns the bitwise complement
/// of the insertion index (so `!result as usize` recovers it, and `result >=
/// 0` tests presence).
pub fn index_of(buffer: &[u8], name: &str) -> Result<i64> {
    let count = field_count(buffer)?;
    let target: Vec<u16> = name.encode_utf16().collect();

    let mut lo: i64 = 0;
    let mut hi: i64 = count as i64 - 1;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let descriptor = field_descriptor(buffer, mid as u32)?;
        let candidate = field_name_units(buffer, &descriptor)?;
        match candidate.cmp(&target) {
            std::cmp::Ordering::Equal => return Ok(mid),
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid - 1,
        }
    }
    Ok(!lo)
}

/// Well-formedness checks used by tests (spec §8 property 2): every field's
/// data range is within the buffer and no two fields' data ranges overlap.
pub fn validate_layout(buffer: &[u8]) -> Result<()> {
    let total = total_length(buffer)? as usize;
    if total != buffer.len() {
        return Err(Error::SizeMismatch {
            expected: total,
            actual: buffer.len(),
        });
    }
    let count = field_count(buffer)?;
    let mut ranges = Vec::with_capacity(count as usize);
    let mut previous_name: Option<Vec<u16>> = None;
    for i in 0..count {
        let descriptor = field_descriptor(buffer, i)?;
        let start = descriptor.data_offset as usize;
        let end = start + descriptor.data_length as usize;
        if end > total {
            return Err(Error::OutOfRange {
                what: "field data range",
                index: end as i64,
                bound: total as i64,
            });
        }
        let name = field_name_units(buffer, &descriptor)?;
        if let Some(prev) = &previous_name {
            if prev >= &name {
                return Err(Error::OutOfRange {
                    what: "field name ordering",
                    index: i as i64,
                    bound: count as i64,
                });
            }
        }
        previous_name = Some(name);
        ranges.push((start, end));
    }
    ranges.sort_unstable();
    for window in ranges.windows(2) {
        if window[0].1 > window[1].0 {
            return Err(Error::OutOfRange {
                what: "overlapping field data ranges",
                index: window[1].0 as i64,
                bound: window[0].1 as i64,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::builder::LayoutBuilder;
    use crate::kind::ValueKind;

    #[test]
    fn empty_container_header() {
        let bytes = LayoutBuilder::new().build();
        assert_eq!(total_length(&bytes).unwrap() as usize, bytes.len());
        assert_eq!(field_count(&bytes).unwrap(), 0);
        assert_eq!(
            name_region_offset(&bytes).unwrap(),
            data_region_offset(&bytes).unwrap()
        );
        validate_layout(&bytes).unwrap();
    }

    #[test]
    fn index_of_binary_search_and_complement() {
        let mut builder = LayoutBuilder::new();
        builder.set_scalar("b", ValueKind::Int32);
        builder.set_scalar("a", ValueKind::Int32);
        builder.set_scalar("z", ValueKind::Int32);
        let bytes = builder.build();
        validate_layout(&bytes).unwrap();

        assert_eq!(index_of(&bytes, "a").unwrap(), 0);
        assert_eq!(index_of(&bytes, "b").unwrap(), 1);
        assert_eq!(index_of(&bytes, "z").unwrap(), 2);

        let missing = index_of(&bytes, "m").unwrap();
        assert!(missing < 0);
        assert_eq!(!missing, 2);
    }
}
