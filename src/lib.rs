//! A schema-driven protobuf wire engine.
//!
//! Message types are described at runtime, either compiled from serialized
//! `FileDescriptorSet`s by a [`SchemaContext`] or built directly from
//! [`layout::MessageSpec`]s and compact mini descriptors. A layout drives
//! decoding into arena-allocated [`Message`]s, reflection over their
//! fields, and encoding back to bytes.
//!
//! ```ignore
//! let mut context = SchemaContext::new();
//! context.add_descriptors(&descriptor_set)?;
//! let person = context.find_message("example.Person").unwrap();
//!
//! let mut arena = Arena::new();
//! let message = decode(person.layout(), input, &mut arena, &DecodeOptions::new())?;
//! let name = person.field_by_name("name").unwrap();
//! println!("{:?}", message.get(&arena, name.entry()));
//! let bytes = encode_to_vec(message, &arena, &EncodeOptions::new())?;
//! ```

mod arena;
mod decode;
mod encode;
mod error;
mod message;
mod schema;
mod util;

pub mod layout;
// Publically export `leb128` and `wire` because the primitives are useful on
// their own.
pub mod leb128;
pub mod wire;

pub use arena::{Arena, ArenaOptions, ArenaPtr};
pub use decode::{
    DEFAULT_MAX_DEPTH, DecodeOptions, decode, decode_length_prefixed, decode_partial, merge,
};
pub use encode::{EncodeOptions, UnknownFields, encode, encode_to_vec, encoded_len};
pub use error::{
    ArenaError, DecodeError, DecodeErrorKind, EncodeError, LayoutError, ReflectError, SchemaError,
};
pub use message::{MapKey, Message, Value};
pub use schema::{
    EnumDef, EnumValueDef, ExtensionDef, FieldDef, FileDef, MessageDef, OneofDef, SchemaContext,
    Symbol, Syntax,
};
