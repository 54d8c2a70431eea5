//! Owned copies of the descriptor messages, read out of a decoded
//! `FileDescriptorSet` through the reflection surface.

use bytes::Bytes;

use super::bootstrap::{self, enum_type, enum_value, extension_range, field, field_options, file};
use super::bootstrap::{file_set, message, message_options, oneof};
use crate::arena::Arena;
use crate::decode::{self, DecodeOptions};
use crate::encode::{self, EncodeOptions};
use crate::error::SchemaError;
use crate::message::Message;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FileProto {
    pub(crate) name: String,
    pub(crate) package: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) messages: Vec<MessageProto>,
    pub(crate) enums: Vec<EnumProto>,
    pub(crate) extensions: Vec<FieldProto>,
    pub(crate) syntax: Option<String>,
    pub(crate) edition: Option<i32>,
    /// Deterministic re-encoding, used to tell re-adds from conflicts.
    pub(crate) encoded: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct MessageProto {
    pub(crate) name: String,
    pub(crate) fields: Vec<FieldProto>,
    pub(crate) nested: Vec<MessageProto>,
    pub(crate) enums: Vec<EnumProto>,
    /// Half-open `start..end` ranges.
    pub(crate) extension_ranges: Vec<(i32, i32)>,
    pub(crate) extensions: Vec<FieldProto>,
    pub(crate) oneofs: Vec<String>,
    pub(crate) map_entry: bool,
    pub(crate) message_set_wire_format: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct FieldProto {
    pub(crate) name: String,
    pub(crate) extendee: Option<String>,
    pub(crate) number: Option<i32>,
    pub(crate) label: Option<i32>,
    pub(crate) field_type: Option<i32>,
    pub(crate) type_name: Option<String>,
    pub(crate) default_value: Option<String>,
    pub(crate) oneof_index: Option<i32>,
    pub(crate) json_name: Option<String>,
    pub(crate) proto3_optional: bool,
    pub(crate) packed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct EnumProto {
    pub(crate) name: String,
    pub(crate) values: Vec<(String, i32)>,
}

/// Parse a serialized `FileDescriptorSet`.
pub(crate) fn parse_file_set(input: &[u8]) -> Result<Vec<FileProto>, SchemaError> {
    let layouts = bootstrap::layouts().map_err(|err| SchemaError::from_layout("descriptor", err))?;
    let mut arena = Arena::new();
    let root = decode::decode(
        layouts.file_set(),
        Bytes::copy_from_slice(input),
        &mut arena,
        &DecodeOptions::new(),
    )?;

    let mut encode_options = EncodeOptions::new();
    encode_options.deterministic(true).partial();

    let reader = Reader {
        arena: &arena,
        message: root,
    };
    reader
        .messages(file_set::FILE)
        .map(|proto| {
            let encoded = encode::encode_to_vec(proto.message, &arena, &encode_options)
                .map_err(|err| SchemaError::invalid(&proto.string(file::NAME), err.to_string()))?;
            Ok(read_file(&proto, encoded))
        })
        .collect()
}

/// Typed reads of one decoded descriptor message.
#[derive(Clone, Copy)]
struct Reader<'a> {
    arena: &'a Arena,
    message: Message<'a>,
}

impl<'a> Reader<'a> {
    fn string(&self, number: u32) -> String {
        self.opt_string(number).unwrap_or_default()
    }

    fn opt_string(&self, number: u32) -> Option<String> {
        let field = self.message.field(number)?;
        if !self.message.has(self.arena, field) {
            return None;
        }
        let value = self.message.get(self.arena, field);
        Some(String::from_utf8_lossy(value.as_bytes()?).into_owned())
    }

    fn int32(&self, number: u32) -> Option<i32> {
        let field = self.message.field(number)?;
        if !self.message.has(self.arena, field) {
            return None;
        }
        self.message.get(self.arena, field).as_i32()
    }

    fn bool(&self, number: u32) -> Option<bool> {
        let field = self.message.field(number)?;
        if !self.message.has(self.arena, field) {
            return None;
        }
        self.message.get(self.arena, field).as_bool()
    }

    fn strings(&self, number: u32) -> Vec<String> {
        let Some(field) = self.message.field(number) else {
            return Vec::new();
        };
        self.message
            .array_iter(self.arena, field)
            .filter_map(|value| value.as_bytes().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
            .collect()
    }

    fn sub(&self, number: u32) -> Option<Reader<'a>> {
        let field = self.message.field(number)?;
        let message = self.message.get_submessage(self.arena, field)?;
        Some(Reader {
            arena: self.arena,
            message,
        })
    }

    fn messages(self, number: u32) -> impl Iterator<Item = Reader<'a>> {
        let Reader { arena, message } = self;
        message
            .field(number)
            .into_iter()
            .flat_map(move |field| message.array_iter(arena, field))
            .filter_map(|value| value.as_message())
            .map(move |message| Reader { arena, message })
    }
}

fn read_file(reader: &Reader<'_>, encoded: Vec<u8>) -> FileProto {
    FileProto {
        name: reader.string(file::NAME),
        package: reader.string(file::PACKAGE),
        dependencies: reader.strings(file::DEPENDENCY),
        messages: reader.messages(file::MESSAGE_TYPE).map(|m| read_message(&m)).collect(),
        enums: reader.messages(file::ENUM_TYPE).map(|e| read_enum(&e)).collect(),
        extensions: reader.messages(file::EXTENSION).map(|f| read_field(&f)).collect(),
        syntax: reader.opt_string(file::SYNTAX),
        edition: reader.int32(file::EDITION),
        encoded,
    }
}

fn read_message(reader: &Reader<'_>) -> MessageProto {
    let options = reader.sub(message::OPTIONS);
    let option = |number| {
        options
            .and_then(|options| options.bool(number))
            .unwrap_or(false)
    };
    MessageProto {
        name: reader.string(message::NAME),
        fields: reader.messages(message::FIELD).map(|f| read_field(&f)).collect(),
        nested: reader.messages(message::NESTED_TYPE).map(|m| read_message(&m)).collect(),
        enums: reader.messages(message::ENUM_TYPE).map(|e| read_enum(&e)).collect(),
        extension_ranges: reader
            .messages(message::EXTENSION_RANGE)
            .map(|range| {
                (
                    range.int32(extension_range::START).unwrap_or(0),
                    range.int32(extension_range::END).unwrap_or(0),
                )
            })
            .collect(),
        extensions: reader.messages(message::EXTENSION).map(|f| read_field(&f)).collect(),
        oneofs: reader
            .messages(message::ONEOF_DECL)
            .map(|decl| decl.string(oneof::NAME))
            .collect(),
        map_entry: option(message_options::MAP_ENTRY),
        message_set_wire_format: option(message_options::MESSAGE_SET_WIRE_FORMAT),
    }
}

fn read_field(reader: &Reader<'_>) -> FieldProto {
    FieldProto {
        name: reader.string(field::NAME),
        extendee: reader.opt_string(field::EXTENDEE),
        number: reader.int32(field::NUMBER),
        label: reader.int32(field::LABEL),
        field_type: reader.int32(field::TYPE),
        type_name: reader.opt_string(field::TYPE_NAME),
        default_value: reader.opt_string(field::DEFAULT_VALUE),
        oneof_index: reader.int32(field::ONEOF_INDEX),
        json_name: reader.opt_string(field::JSON_NAME),
        proto3_optional: reader.bool(field::PROTO3_OPTIONAL).unwrap_or(false),
        packed: reader
            .sub(field::OPTIONS)
            .and_then(|options| options.bool(field_options::PACKED)),
    }
}

fn read_enum(reader: &Reader<'_>) -> EnumProto {
    EnumProto {
        name: reader.string(enum_type::NAME),
        values: reader
            .messages(enum_type::VALUE)
            .map(|value| {
                (
                    value.string(enum_value::NAME),
                    value.int32(enum_value::NUMBER).unwrap_or(0),
                )
            })
            .collect(),
    }
}
