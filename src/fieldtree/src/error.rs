use crate::kind::ValueKind;

/// Crate-wide error taxonomy (spec §7). Each variant carries just enough
/// context to format a useful message without a debugger.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum Error {
    /// A handle outlived its container: the generation the handle was issued
    /// under no longer matches the container's current generation.
    #[error("container {id} is disposed (handle generation {handle_generation}, current {current_generation})")]
    Disposed {
        id: u64,
        handle_generation: u64,
        current_generation: u64,
    },

    /// Field name missing under a no-create policy.
    #[error("field {name:?} not found")]
    NotFound { name: String },

    /// A value cannot be converted between the given kinds.
    #[error("cannot convert {from:?} -> {to:?} (explicit = {explicit})")]
    TypeMismatch {
        from: ValueKind,
        to: ValueKind,
        explicit: bool,
    },

    /// Raw-byte operation lengths disagree.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Attempt to read a reference field as a value, or vice versa.
    #[error("field {name:?} is {actual:?}, expected {expected:?}")]
    ReferenceKindMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Array index, registry id, or buffer bounds violated.
    #[error("{what} out of range: {index} (bound {bound})")]
    OutOfRange {
        what: &'static str,
        index: i64,
        bound: i64,
    },

    /// Malformed path segment.
    #[error("malformed path at byte {position}: {reason}")]
    PathSyntax { position: usize, reason: &'static str },

    /// Conversion kernel reached an entry it rejects outright (e.g. Blob<->Float).
    #[error("unsupported conversion {from:?} -> {to:?}")]
    Unsupported { from: ValueKind, to: ValueKind },
}

pub type Result<T> = std::result::Result<T, Error>;
