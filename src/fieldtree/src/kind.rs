//! Value kinds and the implicit/explicit conversion lattice (spec §3, §4.B).

use byteorder::{ByteOrder, LittleEndian};
use strum::{EnumCount, EnumIter};

/// Tagged enumeration of primitive element types stored in a field.
///
/// `Unknown` means "bytes of this size but no interpretation yet": reads
/// against an `Unknown` field fail, writes may stamp the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
#[repr(u8)]
pub enum ValueKind {
    Unknown = 0,
    Bool = 1,
    Int8 = 2,
    UInt8 = 3,
    Char16 = 4,
    Int16 = 5,
    UInt16 = 6,
    Int32 = 7,
    UInt32 = 8,
    Int64 = 9,
    UInt64 = 10,
    Float32 = 11,
    Float64 = 12,
    Blob = 13,
    Ref = 14,
}

impl ValueKind {
    pub const COUNT_TAGS: usize = Self::COUNT;

    /// Declared element size in bytes. `Blob` has no fixed element size; callers
    /// must track its length out of band (the field descriptor's data length).
    pub fn size_of(self) -> usize {
        match self {
            ValueKind::Unknown => 1,
            ValueKind::Bool => 1,
            ValueKind::Int8 => 1,
            ValueKind::UInt8 => 1,
            ValueKind::Char16 => 2,
            ValueKind::Int16 => 2,
            ValueKind::UInt16 => 2,
            ValueKind::Int32 => 4,
            ValueKind::UInt32 => 4,
            ValueKind::Int64 => 8,
            ValueKind::UInt64 => 8,
            ValueKind::Float32 => 4,
            ValueKind::Float64 => 8,
            ValueKind::Blob => 0,
            ValueKind::Ref => 8,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u8) -> Option<ValueKind> {
        use ValueKind::*;
        const TABLE: [ValueKind; ValueKind::COUNT_TAGS] = [
            Unknown, Bool, Int8, UInt8, Char16, Int16, UInt16, Int32, UInt32, Int64, UInt64,
            Float32, Float64, Blob, Ref,
        ];
        TABLE.get(index as usize).copied()
    }

    /// `true` if `self` is allowed to widen implicitly into `to` (spec §4.B).
    pub fn is_implicitly_convertible(self, to: ValueKind) -> bool {
        implicit_lattice()[self.index()][to.index()]
    }

    /// `true` if a conversion from `self` to `to` is ever possible, implicit or
    /// explicit. `exact` additionally requires the conversion to not be lossy
    /// for same-width reinterpretation kinds (currently unused by the kernel
    /// beyond documenting intent; same-size same-signedness conversions are
    /// always exact).
    pub fn can_cast(self, to: ValueKind, exact: bool) -> bool {
        if self == to {
            return true;
        }
        if self.is_implicitly_convertible(to) {
            return true;
        }
        if exact {
            return false;
        }
        castable_lattice()[self.index()][to.index()]
    }

    fn classify(self) -> Classification {
        match self {
            ValueKind::Bool => Classification::Bool,
            ValueKind::Int8 | ValueKind::Int16 | ValueKind::Int32 | ValueKind::Int64 => {
                Classification::Signed
            }
            ValueKind::UInt8 | ValueKind::UInt16 | ValueKind::UInt32 | ValueKind::UInt64 => {
                Classification::Unsigned
            }
            ValueKind::Char16 => Classification::Char16,
            ValueKind::Float32 | ValueKind::Float64 => Classification::Float,
            ValueKind::Unknown | ValueKind::Blob | ValueKind::Ref => Classification::Opaque,
        }
    }

    pub(crate) fn is_numeric_like(self) -> bool {
        !matches!(self.classify(), Classification::Opaque)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Classification {
    Bool,
    Signed,
    Unsigned,
    Char16,
    Float,
    Opaque,
}

pub(crate) fn classify(kind: ValueKind) -> Classification {
    kind.classify()
}

fn build_implicit_lattice() -> [[bool; ValueKind::COUNT_TAGS]; ValueKind::COUNT_TAGS] {
    use ValueKind::*;
    let mut table = [[false; ValueKind::COUNT_TAGS]; ValueKind::COUNT_TAGS];
    let mut set = |from: ValueKind, to: ValueKind| {
        table[from as usize][to as usize] = true;
    };

    // Every kind implicitly converts to itself.
    for kind in [
        Unknown, Bool, Int8, UInt8, Char16, Int16, UInt16, Int32, UInt32, Int64, UInt64, Float32,
        Float64, Blob, Ref,
    ] {
        set(kind, kind);
    }

    // Signed widens to larger signed or float.
    set(Int8, Int16);
    set(Int8, Int32);
    set(Int8, Int64);
    set(Int16, Int32);
    set(Int16, Int64);
    set(Int32, Int64);
    set(Int8, Float32);
    set(Int8, Float64);
    set(Int16, Float32);
    set(Int16, Float64);
    set(Int32, Float32);
    set(Int32, Float64);
    set(Int64, Float32);
    set(Int64, Float64);

    // Unsigned widens to larger unsigned, to larger/equal-width signed, or to float.
    set(UInt8, UInt16);
    set(UInt8, UInt32);
    set(UInt8, UInt64);
    set(UInt16, UInt32);
    set(UInt16, UInt64);
    set(UInt32, UInt64);
    set(UInt8, Int16);
    set(UInt8, Int32);
    set(UInt8, Int64);
    set(UInt16, Int32);
    set(UInt16, Int64);
    set(UInt32, Int64);
    set(UInt8, Float32);
    set(UInt8, Float64);
    set(UInt16, Float32);
    set(UInt16, Float64);
    set(UInt32, Float32);
    set(UInt32, Float64);
    set(UInt64, Float32);
    set(UInt64, Float64);

    // Float widens to a wider float.
    set(Float32, Float64);

    // Char16 widens to int32/uint32/int64/uint64/float32/float64 (treated as u16).
    set(Char16, Int32);
    set(Char16, UInt32);
    set(Char16, Int64);
    set(Char16, UInt64);
    set(Char16, Float32);
    set(Char16, Float64);

    // Bool is implicit only to itself (already set above).

    table
}

fn build_castable_lattice() -> [[bool; ValueKind::COUNT_TAGS]; ValueKind::COUNT_TAGS] {
    use ValueKind::*;
    let mut table = [[false; ValueKind::COUNT_TAGS]; ValueKind::COUNT_TAGS];
    let numeric = [
        Bool, Int8, UInt8, Char16, Int16, UInt16, Int32, UInt32, Int64, UInt64, Float32, Float64,
    ];
    for &from in &numeric {
        for &to in &numeric {
            table[from as usize][to as usize] = true;
        }
    }
    table
}

type Lattice = [[bool; ValueKind::COUNT_TAGS]; ValueKind::COUNT_TAGS];

/// These lattices are a pure function of the closed `ValueKind` enum; build
/// them once behind a `OnceLock` rather than re-deriving per call.
fn implicit_lattice() -> &'static Lattice {
    static CELL: std::sync::OnceLock<Lattice> = std::sync::OnceLock::new();
    CELL.get_or_init(build_implicit_lattice)
}

fn castable_lattice() -> &'static Lattice {
    static CELL: std::sync::OnceLock<Lattice> = std::sync::OnceLock::new();
    CELL.get_or_init(build_castable_lattice)
}

/// A field's on-wire kind byte: bit 7 = inline-array flag, bits 2..6 = kind
/// index (5 bits), bits 0..1 reserved (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldKind {
    pub kind: ValueKind,
    pub is_array: bool,
}

impl FieldKind {
    pub fn scalar(kind: ValueKind) -> Self {
        FieldKind {
            kind,
            is_array: false,
        }
    }

    pub fn array(kind: ValueKind) -> Self {
        FieldKind {
            kind,
            is_array: true,
        }
    }

    pub fn to_byte(self) -> u8 {
        let index = (self.kind as u8) & 0b0001_1111;
        let array_bit = if self.is_array { 0b1000_0000 } else { 0 };
        (index << 2) | array_bit
    }

    pub fn from_byte(byte: u8) -> Option<FieldKind> {
        let is_array = byte & 0b1000_0000 != 0;
        let index = (byte >> 2) & 0b0001_1111;
        ValueKind::from_index(index).map(|kind| FieldKind { kind, is_array })
    }
}

/// A UTF-16 code unit, distinct from `u16` (`UInt16`) so `Scalar::KIND` can
/// tell the two wire kinds apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Char16(pub u16);

/// A registry id stored in a reference-kind field, distinct from `u64`
/// (`UInt64`) for the same reason as [`Char16`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefId(pub u64);

/// A fixed-width value with a declared [`ValueKind`] and an explicit
/// little-endian wire representation. Implemented for every primitive the
/// container format knows how to store inline.
pub trait Scalar: Sized + Copy + Default {
    const KIND: ValueKind;

    fn from_le_bytes(bytes: &[u8]) -> Self;
    fn write_le_bytes(self, dst: &mut [u8]);
}

macro_rules! impl_scalar {
    ($ty:ty, $kind:expr, $read:ident, $write:ident) => {
        impl Scalar for $ty {
            const KIND: ValueKind = $kind;

            fn from_le_bytes(bytes: &[u8]) -> Self {
                LittleEndian::$read(bytes)
            }

            fn write_le_bytes(self, dst: &mut [u8]) {
                LittleEndian::$write(dst, self);
            }
        }
    };
}

impl Scalar for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_le_bytes(self, dst: &mut [u8]) {
        dst[0] = if self { 1 } else { 0 };
    }
}

impl Scalar for i8 {
    const KIND: ValueKind = ValueKind::Int8;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }

    fn write_le_bytes(self, dst: &mut [u8]) {
        dst[0] = self as u8;
    }
}

impl Scalar for u8 {
    const KIND: ValueKind = ValueKind::UInt8;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn write_le_bytes(self, dst: &mut [u8]) {
        dst[0] = self;
    }
}

impl_scalar!(i16, ValueKind::Int16, read_i16, write_i16);
impl_scalar!(u16, ValueKind::UInt16, read_u16, write_u16);
impl_scalar!(i32, ValueKind::Int32, read_i32, write_i32);
impl_scalar!(u32, ValueKind::UInt32, read_u32, write_u32);
impl_scalar!(i64, ValueKind::Int64, read_i64, write_i64);
impl_scalar!(u64, ValueKind::UInt64, read_u64, write_u64);
impl_scalar!(f32, ValueKind::Float32, read_f32, write_f32);
impl_scalar!(f64, ValueKind::Float64, read_f64, write_f64);

impl Scalar for Char16 {
    const KIND: ValueKind = ValueKind::Char16;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        Char16(LittleEndian::read_u16(bytes))
    }

    fn write_le_bytes(self, dst: &mut [u8]) {
        LittleEndian::write_u16(dst, self.0);
    }
}

impl Scalar for RefId {
    const KIND: ValueKind = ValueKind::Ref;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        RefId(LittleEndian::read_u64(bytes))
    }

    fn write_le_bytes(self, dst: &mut [u8]) {
        LittleEndian::write_u64(dst, self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_kind_byte_roundtrip() {
        for kind in [
            ValueKind::Unknown,
            ValueKind::Bool,
            ValueKind::Int32,
            ValueKind::Float64,
            ValueKind::Ref,
        ] {
            for is_array in [false, true] {
                let fk = FieldKind { kind, is_array };
                assert_eq!(FieldKind::from_byte(fk.to_byte()), Some(fk));
            }
        }
    }

    #[test]
    fn bool_is_implicit_only_to_itself() {
        for to in [
            ValueKind::Int8,
            ValueKind::UInt8,
            ValueKind::Int32,
            ValueKind::Float32,
            ValueKind::Char16,
        ] {
            assert!(!ValueKind::Bool.is_implicitly_convertible(to));
        }
        assert!(ValueKind::Bool.is_implicitly_convertible(ValueKind::Bool));
    }

    #[test]
    fn signed_widens_to_float_and_larger_signed() {
        assert!(ValueKind::Int32.is_implicitly_convertible(ValueKind::Int64));
        assert!(ValueKind::Int32.is_implicitly_convertible(ValueKind::Float64));
        assert!(!ValueKind::Int64.is_implicitly_convertible(ValueKind::Int32));
    }

    #[test]
    fn explicit_allows_narrowing_numeric_casts() {
        assert!(!ValueKind::Float64.is_implicitly_convertible(ValueKind::Int32));
        assert!(ValueKind::Float64.can_cast(ValueKind::Int32, false));
        assert!(!ValueKind::Float64.can_cast(ValueKind::Int32, true));
    }

    #[test]
    fn blob_and_ref_cast_only_to_themselves() {
        assert!(!ValueKind::Blob.can_cast(ValueKind::Float32, false));
        assert!(!ValueKind::Ref.can_cast(ValueKind::Int64, false));
        assert!(ValueKind::Blob.can_cast(ValueKind::Blob, true));
    }

    #[test]
    fn scalar_roundtrips_and_kind_tags() {
        let mut buf = [0u8; 8];
        42i32.write_le_bytes(&mut buf);
        assert_eq!(i32::from_le_bytes(&buf), 42);
        assert_eq!(i32::KIND, ValueKind::Int32);

        Char16(b'A' as u16).write_le_bytes(&mut buf);
        assert_eq!(Char16::from_le_bytes(&buf).0, b'A' as u16);
        assert_eq!(Char16::KIND, ValueKind::Char16);

        RefId(7).write_le_bytes(&mut buf);
        assert_eq!(RefId::from_le_bytes(&buf).0, 7);
        assert_eq!(RefId::KIND, ValueKind::Ref);
    }
}
