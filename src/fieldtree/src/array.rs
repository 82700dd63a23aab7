//! `StorageArray`: a handle onto one array field (spec §4.I). Either the
//! field lives directly on the object that produced this handle (`Inline`),
//! or the field was a bare reference and the array actually lives on the
//! referenced child, under its conventional `value` field (`Referenced`),
//! the shape a `Ref[]`-of-scalars entry takes once `GetArray` follows the
//! pointer.

use crate::error::Result;
use crate::kind::{Char16, Scalar, ValueKind};
use crate::object::StorageObject;

/// The conventional field name an array lives under when it's reached
/// through a reference rather than held inline.
const REFERENCED_VALUE_FIELD: &str = "value";

enum Location {
    Inline { owner: StorageObject, field_name: String },
    Referenced { object: StorageObject },
}

pub struct StorageArray {
    location: Location,
}

impl StorageArray {
    pub(crate) fn inline(owner: StorageObject, field_name: String) -> Self {
        StorageArray {
            location: Location::Inline { owner, field_name },
        }
    }

    pub(crate) fn referenced(object: StorageObject) -> Self {
        StorageArray {
            location: Location::Referenced { object },
        }
    }

    fn target(&self) -> (&StorageObject, &str) {
        match &self.location {
            Location::Inline { owner, field_name } => (owner, field_name.as_str()),
            Location::Referenced { object } => (object, REFERENCED_VALUE_FIELD),
        }
    }

    pub fn len(&self) -> Result<usize> {
        let (object, field_name) = self.target();
        object.array_len(field_name)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn element_kind(&self) -> Result<ValueKind> {
        let (object, field_name) = self.target();
        object.array_element_kind(field_name)
    }

    pub fn get<T: Scalar>(&self, index: u32) -> Result<T> {
        let (object, field_name) = self.target();
        object.read_array_element(field_name, index)
    }

    pub fn set<T: Scalar>(&self, index: u32, value: T) -> Result<()> {
        let (object, field_name) = self.target();
        object.write_array_element(field_name, index, value)
    }

    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        let (object, field_name) = self.target();
        object.read_array(field_name)
    }

    pub fn write<T: Scalar>(&self, items: &[T]) -> Result<()> {
        let (object, field_name) = self.target();
        object.write_array(field_name, items)
    }

    pub fn as_string(&self) -> Result<String> {
        let chars: Vec<Char16> = self.to_vec()?;
        Ok(String::from_utf16_lossy(&chars.into_iter().map(|c| c.0).collect::<Vec<_>>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn inline_array_roundtrip() {
        let storage = Storage::new();
        let root = storage.root();
        root.write_array("scores", &[1i32, 2, 3]).unwrap();

        let array = root.get_array("scores").unwrap();
        assert_eq!(array.len().unwrap(), 3);
        assert_eq!(array.get::<i32>(1).unwrap(), 2);
        array.set(1, 9i32).unwrap();
        assert_eq!(array.to_vec::<i32>().unwrap(), vec![1, 9, 3]);
    }

    #[test]
    fn referenced_array_follows_value_field() {
        let storage = Storage::new();
        let root = storage.root();
        let bucket = root.get_object("bucket").unwrap();
        bucket.write_array("value", &[10i64, 20]).unwrap();

        let array = root.get_array("bucket").unwrap();
        assert_eq!(array.to_vec::<i64>().unwrap(), vec![10, 20]);
    }

    #[test]
    fn as_string_decodes_char16_elements() {
        let storage = Storage::new();
        let root = storage.root();
        root.write_string("name", "Hi").unwrap();
        let array = root.get_array("name").unwrap();
        assert_eq!(array.as_string().unwrap(), "Hi");
    }
}
