//! A tagged binary container format: fields addressed by name, typed at
//! runtime, convertible along an implicit/explicit widening lattice, and
//! schema-migrated in place as fields are added, resized or removed.
//!
//! [`Storage`] is the entry point: it owns one pool, one id registry and one
//! event bus, and hands out [`StorageObject`] handles over the containers
//! reachable from its root.

pub mod array;
pub mod byte_pool;
pub mod container;
pub mod error;
pub mod events;
pub mod kind;
pub mod layout;
pub mod migrate;
pub mod object;
pub mod path;
pub mod registry;
pub mod storage;

pub use array::StorageArray;
pub use byte_pool::BytePool;
pub use container::Container;
pub use error::{Error, Result};
pub use events::{Event, EventKind, EventRegistry, Subscriber, SubscriptionId};
pub use kind::{Char16, FieldKind, RefId, Scalar, ValueKind};
pub use layout::LayoutBuilder;
pub use object::StorageObject;
pub use path::{parse_path, parse_segment, Segment};
pub use registry::{ContainerHandle, Registry};
pub use storage::Storage;
