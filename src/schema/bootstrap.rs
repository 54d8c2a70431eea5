//! Layouts for the parts of `descriptor.proto` the schema context reads.
//!
//! Descriptor sets are parsed with the engine itself, so the messages that
//! describe them are declared here by hand. Anything not listed (options we
//! don't interpret, source info, services) lands in the unknown fields.

use std::sync::OnceLock;

use crate::error::LayoutError;
use crate::layout::{FieldSpec, FieldType, Label, LayoutId, LayoutRef, LayoutSet, MessageSpec};

/// Field numbers of `FileDescriptorSet`.
pub(crate) mod file_set {
    pub(crate) const FILE: u32 = 1;
}

/// Field numbers of `FileDescriptorProto`.
pub(crate) mod file {
    pub(crate) const NAME: u32 = 1;
    pub(crate) const PACKAGE: u32 = 2;
    pub(crate) const DEPENDENCY: u32 = 3;
    pub(crate) const MESSAGE_TYPE: u32 = 4;
    pub(crate) const ENUM_TYPE: u32 = 5;
    pub(crate) const EXTENSION: u32 = 7;
    pub(crate) const SYNTAX: u32 = 12;
    pub(crate) const EDITION: u32 = 14;
}

/// Field numbers of `DescriptorProto`.
pub(crate) mod message {
    pub(crate) const NAME: u32 = 1;
    pub(crate) const FIELD: u32 = 2;
    pub(crate) const NESTED_TYPE: u32 = 3;
    pub(crate) const ENUM_TYPE: u32 = 4;
    pub(crate) const EXTENSION_RANGE: u32 = 5;
    pub(crate) const EXTENSION: u32 = 6;
    pub(crate) const OPTIONS: u32 = 7;
    pub(crate) const ONEOF_DECL: u32 = 8;
}

/// Field numbers of `DescriptorProto.ExtensionRange`.
pub(crate) mod extension_range {
    pub(crate) const START: u32 = 1;
    pub(crate) const END: u32 = 2;
}

/// Field numbers of `MessageOptions`.
pub(crate) mod message_options {
    pub(crate) const MESSAGE_SET_WIRE_FORMAT: u32 = 1;
    pub(crate) const MAP_ENTRY: u32 = 7;
}

/// Field numbers of `FieldDescriptorProto`.
pub(crate) mod field {
    pub(crate) const NAME: u32 = 1;
    pub(crate) const EXTENDEE: u32 = 2;
    pub(crate) const NUMBER: u32 = 3;
    pub(crate) const LABEL: u32 = 4;
    pub(crate) const TYPE: u32 = 5;
    pub(crate) const TYPE_NAME: u32 = 6;
    pub(crate) const DEFAULT_VALUE: u32 = 7;
    pub(crate) const OPTIONS: u32 = 8;
    pub(crate) const ONEOF_INDEX: u32 = 9;
    pub(crate) const JSON_NAME: u32 = 10;
    pub(crate) const PROTO3_OPTIONAL: u32 = 17;
}

/// Field numbers of `FieldOptions`.
pub(crate) mod field_options {
    pub(crate) const PACKED: u32 = 2;
}

/// Field numbers of `OneofDescriptorProto`.
pub(crate) mod oneof {
    pub(crate) const NAME: u32 = 1;
}

/// Field numbers of `EnumDescriptorProto`.
pub(crate) mod enum_type {
    pub(crate) const NAME: u32 = 1;
    pub(crate) const VALUE: u32 = 2;
}

/// Field numbers of `EnumValueDescriptorProto`.
pub(crate) mod enum_value {
    pub(crate) const NAME: u32 = 1;
    pub(crate) const NUMBER: u32 = 2;
}

/// The descriptor layouts, see [`layouts`].
#[derive(Debug)]
pub(crate) struct Bootstrap {
    set: LayoutSet,
    file_set: LayoutId,
}

impl Bootstrap {
    pub(crate) fn file_set(&self) -> LayoutRef<'_> {
        self.set.message(self.file_set)
    }
}

static BOOTSTRAP: OnceLock<Result<Bootstrap, LayoutError>> = OnceLock::new();

/// The descriptor layouts, built on first use.
pub(crate) fn layouts() -> Result<&'static Bootstrap, LayoutError> {
    BOOTSTRAP.get_or_init(build).as_ref().map_err(Clone::clone)
}

fn optional(number: u32, field_type: FieldType) -> FieldSpec {
    FieldSpec::new(number, field_type)
}

fn repeated(number: u32, field_type: FieldType) -> FieldSpec {
    FieldSpec {
        label: Label::Repeated,
        ..FieldSpec::new(number, field_type)
    }
}

fn plain(set: &mut LayoutSet, fields: Vec<FieldSpec>) -> Result<LayoutId, LayoutError> {
    set.build_message(&MessageSpec {
        fields,
        ..MessageSpec::default()
    })
}

fn build() -> Result<Bootstrap, LayoutError> {
    use FieldType::{Bool, Int32, Message, String};

    let mut set = LayoutSet::new();

    // Enum-typed fields (label, type, edition) are read as plain int32, the
    // wire encoding is the same and nothing has to be linked.
    let file_set = plain(&mut set, vec![repeated(file_set::FILE, Message)])?;
    let file_proto = plain(
        &mut set,
        vec![
            optional(file::NAME, String),
            optional(file::PACKAGE, String),
            repeated(file::DEPENDENCY, String),
            repeated(file::MESSAGE_TYPE, Message),
            repeated(file::ENUM_TYPE, Message),
            repeated(file::EXTENSION, Message),
            optional(file::SYNTAX, String),
            optional(file::EDITION, Int32),
        ],
    )?;
    let descriptor = plain(
        &mut set,
        vec![
            optional(message::NAME, String),
            repeated(message::FIELD, Message),
            repeated(message::NESTED_TYPE, Message),
            repeated(message::ENUM_TYPE, Message),
            repeated(message::EXTENSION_RANGE, Message),
            repeated(message::EXTENSION, Message),
            optional(message::OPTIONS, Message),
            repeated(message::ONEOF_DECL, Message),
        ],
    )?;
    let extension_range = plain(
        &mut set,
        vec![
            optional(extension_range::START, Int32),
            optional(extension_range::END, Int32),
        ],
    )?;
    let message_options = plain(
        &mut set,
        vec![
            optional(message_options::MESSAGE_SET_WIRE_FORMAT, Bool),
            optional(message_options::MAP_ENTRY, Bool),
        ],
    )?;
    let field_proto = plain(
        &mut set,
        vec![
            optional(field::NAME, String),
            optional(field::EXTENDEE, String),
            optional(field::NUMBER, Int32),
            optional(field::LABEL, Int32),
            optional(field::TYPE, Int32),
            optional(field::TYPE_NAME, String),
            optional(field::DEFAULT_VALUE, String),
            optional(field::OPTIONS, Message),
            optional(field::ONEOF_INDEX, Int32),
            optional(field::JSON_NAME, String),
            optional(field::PROTO3_OPTIONAL, Bool),
        ],
    )?;
    let field_options = plain(&mut set, vec![optional(field_options::PACKED, Bool)])?;
    let oneof_proto = plain(&mut set, vec![optional(oneof::NAME, String)])?;
    let enum_proto = plain(
        &mut set,
        vec![
            optional(enum_type::NAME, String),
            repeated(enum_type::VALUE, Message),
        ],
    )?;
    let enum_value_proto = plain(
        &mut set,
        vec![
            optional(enum_value::NAME, String),
            optional(enum_value::NUMBER, Int32),
        ],
    )?;

    let links = [
        (file_set, file_set::FILE, file_proto),
        (file_proto, file::MESSAGE_TYPE, descriptor),
        (file_proto, file::ENUM_TYPE, enum_proto),
        (file_proto, file::EXTENSION, field_proto),
        (descriptor, message::FIELD, field_proto),
        (descriptor, message::NESTED_TYPE, descriptor),
        (descriptor, message::ENUM_TYPE, enum_proto),
        (descriptor, message::EXTENSION_RANGE, extension_range),
        (descriptor, message::EXTENSION, field_proto),
        (descriptor, message::OPTIONS, message_options),
        (descriptor, message::ONEOF_DECL, oneof_proto),
        (field_proto, field::OPTIONS, field_options),
        (enum_proto, enum_type::VALUE, enum_value_proto),
    ];
    for (id, number, sub) in links {
        set.link_message(id, number, sub)?;
    }

    tracing::debug!(layouts = set.message_count(), "built descriptor layouts");
    Ok(Bootstrap { set, file_set })
}
