//! Hand encoder for `FileDescriptorSet` bytes used by the schema tests.

#![allow(dead_code)]

use protoloom::layout::FieldType;
use protoloom::wire::{self, WireType};

pub const OPTIONAL: u64 = 1;
pub const REQUIRED: u64 = 2;
pub const REPEATED: u64 = 3;

/// Bytes of one message, built field by field.
#[derive(Debug, Default, Clone)]
pub struct Descriptor(Vec<u8>);

impl Descriptor {
    pub fn new() -> Self {
        Descriptor::default()
    }

    pub fn string(mut self, number: u32, value: &str) -> Self {
        self.len_field(number, value.as_bytes());
        self
    }

    pub fn varint(mut self, number: u32, value: u64) -> Self {
        wire::encode_key(number, WireType::Varint, &mut self.0);
        wire::encode_varint(value, &mut self.0);
        self
    }

    pub fn message(mut self, number: u32, value: Descriptor) -> Self {
        self.len_field(number, &value.0);
        self
    }

    fn len_field(&mut self, number: u32, value: &[u8]) {
        wire::encode_key(number, WireType::Len, &mut self.0);
        wire::encode_varint(value.len() as u64, &mut self.0);
        self.0.extend_from_slice(value);
    }

    pub fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// `FileDescriptorProto` header.
pub fn file(name: &str, package: &str, syntax: &str) -> Descriptor {
    Descriptor::new()
        .string(1, name)
        .string(2, package)
        .string(12, syntax)
}

/// `DescriptorProto` with just a name.
pub fn message(name: &str) -> Descriptor {
    Descriptor::new().string(1, name)
}

/// `FieldDescriptorProto` of a scalar type.
pub fn field(name: &str, number: u32, label: u64, field_type: FieldType) -> Descriptor {
    Descriptor::new()
        .string(1, name)
        .varint(3, u64::from(number))
        .varint(4, label)
        .varint(5, field_type as u64)
}

/// `FieldDescriptorProto` referencing a message or enum type.
pub fn typed(
    name: &str,
    number: u32,
    label: u64,
    field_type: FieldType,
    type_name: &str,
) -> Descriptor {
    field(name, number, label, field_type).string(6, type_name)
}

/// `EnumDescriptorProto` with the given values.
pub fn enumeration(name: &str, values: &[(&str, i32)]) -> Descriptor {
    values.iter().fold(Descriptor::new().string(1, name), |proto, (name, number)| {
        proto.message(
            2,
            Descriptor::new()
                .string(1, name)
                .varint(2, i64::from(*number) as u64),
        )
    })
}

/// `FileDescriptorSet` holding `files`.
pub fn file_set(files: impl IntoIterator<Item = Descriptor>) -> Vec<u8> {
    files
        .into_iter()
        .fold(Descriptor::new(), |set, file| set.message(1, file))
        .finish()
}
