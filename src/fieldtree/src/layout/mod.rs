pub mod builder;
pub mod codec;

pub use builder::LayoutBuilder;
pub use codec::{FieldDescriptor, FIELD_DESCRIPTOR_SIZE, HEADER_SIZE};
