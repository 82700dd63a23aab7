//! The value migration kernel (spec §4.D): converts a raw byte span of one
//! [`ValueKind`] into a raw byte span of another. This is the single place
//! that fans out over the closed set of primitive kinds; `Container` and
//! `StorageObject` never duplicate this logic, they call into it.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::kind::{classify, Classification, ValueKind};

/// Convert `src` (tagged `src_kind`) into `dst` (tagged `dst_kind`).
///
/// `explicit = false` rejects any conversion outside the implicit widening
/// lattice; `explicit = true` additionally permits narrowing, float<->int,
/// and the bool/char16 bridges described in spec §4.D. On failure `dst` is
/// left untouched.
pub fn migrate(
    src: &[u8],
    src_kind: ValueKind,
    dst: &mut [u8],
    dst_kind: ValueKind,
    explicit: bool,
) -> Result<()> {
    if src_kind == dst_kind {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        for byte in &mut dst[n..] {
            *byte = 0;
        }
        return Ok(());
    }

    if !explicit && !src_kind.is_implicitly_convertible(dst_kind) {
        tracing::debug!(?src_kind, ?dst_kind, explicit, "implicit conversion rejected");
        return Err(Error::TypeMismatch {
            from: src_kind,
            to: dst_kind,
            explicit,
        });
    }

    if classify(src_kind) == Classification::Opaque || classify(dst_kind) == Classification::Opaque
    {
        tracing::debug!(?src_kind, ?dst_kind, "kernel rejects opaque-kind conversion");
        return Err(Error::Unsupported {
            from: src_kind,
            to: dst_kind,
        });
    }

    let expected = src_kind.size_of();
    if src.len() < expected {
        return Err(Error::SizeMismatch {
            expected,
            actual: src.len(),
        });
    }
    let needed = dst_kind.size_of();
    if dst.len() < needed {
        return Err(Error::SizeMismatch {
            expected: needed,
            actual: dst.len(),
        });
    }

    let decoded = decode_source(src, src_kind);
    write_destination(dst, dst_kind, &decoded);
    Ok(())
}

/// Convert every element of an inline array in place, where source and
/// destination element sizes are equal (spec §4.D
/// `convertInPlaceSameSize`). Always runs in explicit mode: this path only
/// exists for same-width reinterpretation casts (`int32<->uint32`,
/// `int16<->char16`, ...).
pub fn convert_in_place_same_size(
    span: &mut [u8],
    element_count: usize,
    src_kind: ValueKind,
    dst_kind: ValueKind,
) -> Result<()> {
    let size = src_kind.size_of();
    debug_assert_eq!(size, dst_kind.size_of());
    for i in 0..element_count {
        let start = i * size;
        let end = start + size;
        let mut scratch = [0u8; 8];
        scratch[..size].copy_from_slice(&span[start..end]);
        migrate(&scratch[..size], src_kind, &mut span[start..end], dst_kind, true)?;
    }
    Ok(())
}

struct Decoded {
    /// Source value reinterpreted as an unsigned 64-bit integer, sign- or
    /// zero-extended as appropriate. Used for all integer destinations.
    int_bits: u64,
    /// Source value as `f64`. Used for all float destinations.
    as_f64: f64,
    /// Byte-level nonzero test over exactly the source's declared size
    /// (spec: "Numeric → bool: nonzero test on source bytes").
    raw_nonzero: bool,
}

fn decode_source(src: &[u8], kind: ValueKind) -> Decoded {
    let size = kind.size_of();
    let raw_nonzero = src[..size].iter().any(|&b| b != 0);

    match kind {
        ValueKind::Bool => {
            let v = if src[0] != 0 { 1u64 } else { 0 };
            Decoded {
                int_bits: v,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::Int8 => {
            let v = src[0] as i8;
            Decoded {
                int_bits: (v as i64) as u64,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::UInt8 => {
            let v = src[0];
            Decoded {
                int_bits: v as u64,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::Char16 | ValueKind::UInt16 => {
            let v = LittleEndian::read_u16(src);
            Decoded {
                int_bits: v as u64,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::Int16 => {
            let v = LittleEndian::read_i16(src);
            Decoded {
                int_bits: (v as i64) as u64,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::Int32 => {
            let v = LittleEndian::read_i32(src);
            Decoded {
                int_bits: (v as i64) as u64,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::UInt32 => {
            let v = LittleEndian::read_u32(src);
            Decoded {
                int_bits: v as u64,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::Int64 => {
            let v = LittleEndian::read_i64(src);
            Decoded {
                int_bits: v as u64,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::UInt64 => {
            let v = LittleEndian::read_u64(src);
            Decoded {
                int_bits: v,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::Float32 => {
            let v = LittleEndian::read_f32(src);
            Decoded {
                int_bits: (v.trunc() as i64) as u64,
                as_f64: v as f64,
                raw_nonzero,
            }
        }
        ValueKind::Float64 => {
            let v = LittleEndian::read_f64(src);
            Decoded {
                int_bits: (v.trunc() as i64) as u64,
                as_f64: v,
                raw_nonzero,
            }
        }
        ValueKind::Unknown | ValueKind::Blob | ValueKind::Ref => unreachable!(
            "opaque kinds are rejected before decode_source is reached"
        ),
    }
}

fn write_destination(dst: &mut [u8], kind: ValueKind, decoded: &Decoded) {
    match kind {
        ValueKind::Bool => {
            dst[0] = if decoded.raw_nonzero { 1 } else { 0 };
        }
        ValueKind::Int8 | ValueKind::UInt8 => {
            dst[0] = decoded.int_bits as u8;
        }
        ValueKind::Char16 | ValueKind::UInt16 | ValueKind::Int16 => {
            LittleEndian::write_u16(dst, decoded.int_bits as u16);
        }
        ValueKind::Int32 | ValueKind::UInt32 => {
            LittleEndian::write_u32(dst, decoded.int_bits as u32);
        }
        ValueKind::Int64 | ValueKind::UInt64 => {
            LittleEndian::write_u64(dst, decoded.int_bits);
        }
        ValueKind::Float32 => {
            LittleEndian::write_f32(dst, decoded.as_f64 as f32);
        }
        ValueKind::Float64 => {
            LittleEndian::write_f64(dst, decoded.as_f64);
        }
        ValueKind::Unknown | ValueKind::Blob | ValueKind::Ref => unreachable!(
            "opaque kinds are rejected before write_destination is reached"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_of(kind: ValueKind, value_bytes: &[u8]) -> Vec<u8> {
        let mut v = vec![0u8; kind.size_of()];
        v[..value_bytes.len().min(v.len())].copy_from_slice(value_bytes);
        v
    }

    #[test]
    fn same_kind_copies_and_zeroes_trailing() {
        let src = 42i32.to_le_bytes();
        let mut dst = vec![0xFFu8; 8];
        migrate(&src, ValueKind::Int32, &mut dst, ValueKind::Int32, false).unwrap();
        assert_eq!(&dst[..4], &src);
        assert_eq!(&dst[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn implicit_widening_int32_to_int64() {
        let src = (-7i32).to_le_bytes();
        let mut dst = [0u8; 8];
        migrate(&src, ValueKind::Int32, &mut dst, ValueKind::Int64, false).unwrap();
        assert_eq!(i64::from_le_bytes(dst), -7);
    }

    #[test]
    fn implicit_rejects_narrowing() {
        let src = 70000i64.to_le_bytes();
        let mut dst = [0u8; 4];
        let err = migrate(&src, ValueKind::Int64, &mut dst, ValueKind::Int32, false).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn explicit_narrowing_truncates_without_saturation() {
        let src = 70000i64.to_le_bytes();
        let mut dst = [0u8; 4];
        migrate(&src, ValueKind::Int64, &mut dst, ValueKind::Int32, true).unwrap();
        assert_eq!(i32::from_le_bytes(dst), 70000i64 as i32);
    }

    #[test]
    fn bool_to_numeric_and_back() {
        let mut dst = [0u8; 4];
        migrate(&[1], ValueKind::Bool, &mut dst, ValueKind::Int32, true).unwrap();
        assert_eq!(i32::from_le_bytes(dst), 1);

        let mut back = [0u8; 1];
        migrate(&5i32.to_le_bytes(), ValueKind::Int32, &mut back, ValueKind::Bool, true).unwrap();
        assert_eq!(back[0], 1);

        let mut zero = [0u8; 1];
        migrate(&0i32.to_le_bytes(), ValueKind::Int32, &mut zero, ValueKind::Bool, true).unwrap();
        assert_eq!(zero[0], 0);
    }

    #[test]
    fn float_to_int_truncates_toward_zero() {
        let src = 3.7f64.to_le_bytes();
        let mut dst = [0u8; 4];
        migrate(&src, ValueKind::Float64, &mut dst, ValueKind::Int32, true).unwrap();
        assert_eq!(i32::from_le_bytes(dst), 3);

        let src_neg = (-3.7f64).to_le_bytes();
        let mut dst_neg = [0u8; 4];
        migrate(&src_neg, ValueKind::Float64, &mut dst_neg, ValueKind::Int32, true).unwrap();
        assert_eq!(i32::from_le_bytes(dst_neg), -3);
    }

    #[test]
    fn int_to_float_widens_through_f64() {
        let src = 9000000000i64.to_le_bytes(); // exceeds f32 precision but fits f64 exactly-ish
        let mut dst32 = [0u8; 4];
        migrate(&src, ValueKind::Int64, &mut dst32, ValueKind::Float32, true).unwrap();
        let mut dst64 = [0u8; 8];
        migrate(&src, ValueKind::Int64, &mut dst64, ValueKind::Float64, true).unwrap();
        assert_eq!(f64::from_le_bytes(dst64), 9000000000.0);
        assert!((f32::from_le_bytes(dst32) - 9000000000.0f32).abs() < 1.0);
    }

    #[test]
    fn char16_bridges_to_integers() {
        let src = 0x4142u16.to_le_bytes();
        let mut dst = [0u8; 4];
        migrate(&src, ValueKind::Char16, &mut dst, ValueKind::UInt32, true).unwrap();
        assert_eq!(u32::from_le_bytes(dst), 0x4142);
    }

    #[test]
    fn blob_and_ref_conversions_are_unsupported() {
        let src = scalar_of(ValueKind::Blob, &[1, 2, 3]);
        let mut dst = [0u8; 4];
        let err = migrate(&src, ValueKind::Blob, &mut dst, ValueKind::Float32, true).unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));

        let src_ref = 7u64.to_le_bytes();
        let mut dst_int = [0u8; 4];
        let err = migrate(&src_ref, ValueKind::Ref, &mut dst_int, ValueKind::Int32, true)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn convert_in_place_same_size_array() {
        let mut span = [1i32.to_le_bytes(), (-1i32).to_le_bytes()].concat();
        convert_in_place_same_size(&mut span, 2, ValueKind::Int32, ValueKind::UInt32).unwrap();
        assert_eq!(u32::from_le_bytes(span[0..4].try_into().unwrap()), 1);
        assert_eq!(
            u32::from_le_bytes(span[4..8].try_into().unwrap()),
            u32::MAX
        );
    }
}
