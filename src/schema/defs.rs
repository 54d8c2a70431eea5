//! Borrowed views of the definitions held by a [`SchemaContext`].

use core::fmt;
use std::ops::Range;

use super::{
    EnumData, EnumValueData, FieldData, FieldSub, FileData, MessageData, OneofData, SchemaContext,
    Syntax,
};
use crate::error::LayoutError;
use crate::layout::mini_descriptor::{self, FieldModifiers, MiniDescriptorEncoder};
use crate::layout::{
    EnumId, EnumLayout, ExtensionId, FieldEntry, FieldType, Label, LayoutRef,
};
use crate::message::Value;

/// A message type.
#[derive(Clone, Copy)]
pub struct MessageDef<'c> {
    context: &'c SchemaContext,
    index: usize,
}

impl<'c> MessageDef<'c> {
    pub(crate) fn new(context: &'c SchemaContext, index: usize) -> Self {
        MessageDef { context, index }
    }

    pub(crate) fn data(&self) -> &'c MessageData {
        &self.context.messages[self.index]
    }

    pub fn name(&self) -> &'c str {
        &self.data().name
    }

    pub fn full_name(&self) -> &'c str {
        &self.data().full_name
    }

    pub fn file(&self) -> FileDef<'c> {
        FileDef::new(self.context, self.data().file)
    }

    /// The message this one is nested in.
    pub fn containing_type(&self) -> Option<MessageDef<'c>> {
        self.data()
            .parent
            .map(|index| MessageDef::new(self.context, index))
    }

    pub fn syntax(&self) -> Syntax {
        self.file().syntax()
    }

    /// The compiled layout, use it to create, decode and encode instances.
    pub fn layout(&self) -> LayoutRef<'c> {
        self.context.layouts.message(self.data().layout)
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = FieldDef<'c>> + use<'c> {
        let (context, message) = (self.context, self.index);
        (0..self.data().fields.len()).map(move |index| FieldDef::member(context, message, index))
    }

    pub fn field_count(&self) -> usize {
        self.data().fields.len()
    }

    pub fn field_by_number(&self, number: u32) -> Option<FieldDef<'c>> {
        self.fields().find(|field| field.number() == number)
    }

    pub fn field_by_name(&self, name: &str) -> Option<FieldDef<'c>> {
        self.fields().find(|field| field.name() == name)
    }

    pub fn field_by_json_name(&self, json_name: &str) -> Option<FieldDef<'c>> {
        self.fields().find(|field| field.json_name() == json_name)
    }

    /// Oneofs in declaration order, synthetic ones included.
    pub fn oneofs(&self) -> impl Iterator<Item = OneofDef<'c>> + use<'c> {
        let (context, message) = (self.context, self.index);
        (0..self.data().oneofs.len()).map(move |index| OneofDef::new(context, message, index))
    }

    pub fn oneof_by_name(&self, name: &str) -> Option<OneofDef<'c>> {
        self.oneofs().find(|oneof| oneof.name() == name)
    }

    pub fn nested_messages(&self) -> impl Iterator<Item = MessageDef<'c>> + use<'c> {
        let context = self.context;
        self.data()
            .nested
            .iter()
            .map(move |index| MessageDef::new(context, *index))
    }

    pub fn nested_enums(&self) -> impl Iterator<Item = EnumDef<'c>> + use<'c> {
        let context = self.context;
        self.data()
            .enums
            .iter()
            .map(move |index| EnumDef::new(context, *index))
    }

    /// Extensions declared inside this message, they usually extend others.
    pub fn nested_extensions(&self) -> impl Iterator<Item = FieldDef<'c>> + use<'c> {
        let context = self.context;
        self.data()
            .extensions
            .iter()
            .map(move |index| FieldDef::extension(context, *index))
    }

    /// Half-open ranges of field numbers reserved for extensions.
    pub fn extension_ranges(&self) -> &'c [Range<u32>] {
        &self.data().extension_ranges
    }

    pub fn is_extendable(&self) -> bool {
        !self.data().extension_ranges.is_empty()
    }

    pub fn is_map_entry(&self) -> bool {
        self.data().map_entry
    }

    pub fn is_message_set(&self) -> bool {
        self.data().message_set
    }

    /// Key field of a map entry.
    pub fn map_key(&self) -> Option<FieldDef<'c>> {
        self.is_map_entry().then(|| self.field_by_number(1)).flatten()
    }

    /// Value field of a map entry.
    pub fn map_value(&self) -> Option<FieldDef<'c>> {
        self.is_map_entry().then(|| self.field_by_number(2)).flatten()
    }

    /// The compact encoding of this message's layout.
    pub fn mini_descriptor(&self) -> Result<String, LayoutError> {
        mini_descriptor::encode_message(&self.data().spec)
    }
}

impl PartialEq for MessageDef<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.context, other.context) && self.index == other.index
    }
}

impl fmt::Debug for MessageDef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageDef").field(&self.full_name()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldAt {
    Message { message: usize, index: usize },
    Extension(usize),
}

/// A field of a message, or an extension.
///
/// Extensions are fields too, see [`ExtensionDef`].
#[derive(Clone, Copy)]
pub struct FieldDef<'c> {
    context: &'c SchemaContext,
    at: FieldAt,
}

/// An extension is a field declared outside of the message it extends.
pub type ExtensionDef<'c> = FieldDef<'c>;

impl<'c> FieldDef<'c> {
    pub(crate) fn member(context: &'c SchemaContext, message: usize, index: usize) -> Self {
        FieldDef {
            context,
            at: FieldAt::Message { message, index },
        }
    }

    pub(crate) fn extension(context: &'c SchemaContext, index: usize) -> Self {
        FieldDef {
            context,
            at: FieldAt::Extension(index),
        }
    }

    fn data(&self) -> &'c FieldData {
        match self.at {
            FieldAt::Message { message, index } => &self.context.messages[message].fields[index],
            FieldAt::Extension(index) => &self.context.extensions[index].field,
        }
    }

    pub fn name(&self) -> &'c str {
        &self.data().name
    }

    pub fn full_name(&self) -> &'c str {
        &self.data().full_name
    }

    pub fn json_name(&self) -> &'c str {
        &self.data().json_name
    }

    pub fn number(&self) -> u32 {
        self.data().number
    }

    pub fn label(&self) -> Label {
        self.data().label
    }

    pub fn field_type(&self) -> FieldType {
        self.data().field_type
    }

    pub fn is_repeated(&self) -> bool {
        self.data().label == Label::Repeated
    }

    pub fn is_required(&self) -> bool {
        self.data().label == Label::Required
    }

    pub fn is_map(&self) -> bool {
        self.is_repeated() && self.message_type().is_some_and(|entry| entry.is_map_entry())
    }

    pub fn is_packed(&self) -> bool {
        self.data().packed
    }

    /// Whether an unset value can be told apart from a zero one.
    pub fn has_presence(&self) -> bool {
        self.data().has_presence
    }

    pub fn is_proto3_optional(&self) -> bool {
        self.data().proto3_optional
    }

    pub fn is_extension(&self) -> bool {
        matches!(self.at, FieldAt::Extension(_))
    }

    /// The message whose instances carry this field: the owner of a regular
    /// field or the extendee of an extension.
    pub fn containing_type(&self) -> MessageDef<'c> {
        match self.at {
            FieldAt::Message { message, .. } => MessageDef::new(self.context, message),
            FieldAt::Extension(index) => {
                MessageDef::new(self.context, self.context.extensions[index].extendee)
            }
        }
    }

    /// Message an extension was declared in.
    pub fn extension_scope(&self) -> Option<MessageDef<'c>> {
        match self.at {
            FieldAt::Message { .. } => None,
            FieldAt::Extension(index) => self.context.extensions[index]
                .scope
                .map(|message| MessageDef::new(self.context, message)),
        }
    }

    pub fn file(&self) -> FileDef<'c> {
        match self.at {
            FieldAt::Message { message, .. } => MessageDef::new(self.context, message).file(),
            FieldAt::Extension(index) => {
                FileDef::new(self.context, self.context.extensions[index].file)
            }
        }
    }

    /// The oneof this field belongs to, synthetic ones included.
    pub fn containing_oneof(&self) -> Option<OneofDef<'c>> {
        match self.at {
            FieldAt::Message { message, .. } => self
                .data()
                .oneof
                .map(|oneof| OneofDef::new(self.context, message, oneof)),
            FieldAt::Extension(_) => None,
        }
    }

    /// Like [`FieldDef::containing_oneof`] but skipping the synthetic oneof
    /// of a proto3 `optional` field.
    pub fn real_containing_oneof(&self) -> Option<OneofDef<'c>> {
        self.containing_oneof().filter(|oneof| !oneof.is_synthetic())
    }

    pub fn message_type(&self) -> Option<MessageDef<'c>> {
        match self.data().sub {
            FieldSub::Message(index) => Some(MessageDef::new(self.context, index)),
            _ => None,
        }
    }

    pub fn enum_type(&self) -> Option<EnumDef<'c>> {
        match self.data().sub {
            FieldSub::Enum(index) => Some(EnumDef::new(self.context, index)),
            _ => None,
        }
    }

    pub fn is_closed_enum(&self) -> bool {
        self.enum_type().is_some_and(|value| value.is_closed())
    }

    /// Whether the descriptor gave an explicit default.
    pub fn has_default(&self) -> bool {
        self.data().has_default
    }

    /// What the field reads as when unset: the explicit default, the first
    /// value of an enum, or zero. `Message(None)` for sub-messages.
    pub fn default_value(&self) -> Value<'c> {
        self.data().default.as_value()
    }

    /// The runtime record of this field.
    pub fn entry(&self) -> &'c FieldEntry {
        match self.at {
            FieldAt::Message { .. } => {
                let layout = self.containing_type().layout().layout();
                let number = self.number();
                // Every field of a message has an entry in its layout.
                &layout.fields()[layout.field_index(number).unwrap_or_default()]
            }
            FieldAt::Extension(index) => self
                .context
                .layouts
                .extension(self.context.extensions[index].id)
                .field(),
        }
    }

    /// Id to use with the extension accessors of [`crate::Message`].
    pub fn extension_id(&self) -> Option<ExtensionId> {
        match self.at {
            FieldAt::Message { .. } => None,
            FieldAt::Extension(index) => Some(self.context.extensions[index].id),
        }
    }

    /// The compact encoding of this field as a standalone extension.
    pub fn mini_descriptor(&self) -> Result<String, LayoutError> {
        let data = self.data();
        let mut modifiers = FieldModifiers::empty();
        match data.label {
            Label::Repeated => modifiers.insert(FieldModifiers::REPEATED),
            Label::Required => modifiers.insert(FieldModifiers::REQUIRED),
            Label::Optional => {}
        }
        if data.packed {
            modifiers.insert(FieldModifiers::PACKED);
        }
        if self.is_closed_enum() {
            modifiers.insert(FieldModifiers::CLOSED_ENUM);
        }
        if data.field_type == FieldType::String && self.file().syntax() == Syntax::Proto3 {
            modifiers.insert(FieldModifiers::VALIDATE_UTF8);
        }

        let mut encoder = MiniDescriptorEncoder::new();
        encoder.encode_extension(data.field_type, data.number, modifiers)?;
        Ok(encoder.finish())
    }
}

impl PartialEq for FieldDef<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.context, other.context) && self.at == other.at
    }
}

impl fmt::Debug for FieldDef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.full_name())
            .field("number", &self.number())
            .field("type", &self.field_type())
            .finish()
    }
}

/// A oneof of a message.
#[derive(Clone, Copy)]
pub struct OneofDef<'c> {
    context: &'c SchemaContext,
    message: usize,
    index: usize,
}

impl<'c> OneofDef<'c> {
    pub(crate) fn new(context: &'c SchemaContext, message: usize, index: usize) -> Self {
        OneofDef {
            context,
            message,
            index,
        }
    }

    fn data(&self) -> &'c OneofData {
        &self.context.messages[self.message].oneofs[self.index]
    }

    pub fn name(&self) -> &'c str {
        &self.data().name
    }

    pub fn full_name(&self) -> &'c str {
        &self.data().full_name
    }

    /// Position among the message's oneofs, synthetic ones included.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn containing_type(&self) -> MessageDef<'c> {
        MessageDef::new(self.context, self.message)
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldDef<'c>> + use<'c> {
        let (context, message) = (self.context, self.message);
        self.data()
            .fields
            .iter()
            .map(move |index| FieldDef::member(context, message, *index))
    }

    pub fn field_count(&self) -> usize {
        self.data().fields.len()
    }

    /// Generated for a proto3 `optional` field, it has no case slot.
    pub fn is_synthetic(&self) -> bool {
        self.data().synthetic
    }
}

impl fmt::Debug for OneofDef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OneofDef").field(&self.full_name()).finish()
    }
}

/// An enum type.
#[derive(Clone, Copy)]
pub struct EnumDef<'c> {
    context: &'c SchemaContext,
    index: usize,
}

impl<'c> EnumDef<'c> {
    pub(crate) fn new(context: &'c SchemaContext, index: usize) -> Self {
        EnumDef { context, index }
    }

    fn data(&self) -> &'c EnumData {
        &self.context.enums[self.index]
    }

    pub fn name(&self) -> &'c str {
        &self.data().name
    }

    pub fn full_name(&self) -> &'c str {
        &self.data().full_name
    }

    pub fn file(&self) -> FileDef<'c> {
        FileDef::new(self.context, self.data().file)
    }

    pub fn containing_type(&self) -> Option<MessageDef<'c>> {
        self.data()
            .parent
            .map(|index| MessageDef::new(self.context, index))
    }

    /// Closed enums divert unknown values to the unknown fields.
    pub fn is_closed(&self) -> bool {
        self.data().closed
    }

    pub fn values(&self) -> impl Iterator<Item = EnumValueDef<'c>> + use<'c> {
        let (context, index) = (self.context, self.index);
        (0..self.data().values.len()).map(move |value| EnumValueDef::new(context, index, value))
    }

    pub fn value_count(&self) -> usize {
        self.data().values.len()
    }

    pub fn value_by_name(&self, name: &str) -> Option<EnumValueDef<'c>> {
        self.values().find(|value| value.name() == name)
    }

    /// First value with this number, aliases share numbers.
    pub fn value_by_number(&self, number: i32) -> Option<EnumValueDef<'c>> {
        self.values().find(|value| value.number() == number)
    }

    /// Number of the first declared value.
    pub fn default_value(&self) -> i32 {
        self.data().values.first().map_or(0, |value| value.number)
    }

    pub fn id(&self) -> EnumId {
        self.data().layout
    }

    pub fn layout(&self) -> &'c EnumLayout {
        self.context.layouts.enum_layout(self.data().layout)
    }

    pub fn mini_descriptor(&self) -> Result<String, LayoutError> {
        mini_descriptor::encode_enum(self.layout())
    }
}

impl PartialEq for EnumDef<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.context, other.context) && self.index == other.index
    }
}

impl fmt::Debug for EnumDef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EnumDef").field(&self.full_name()).finish()
    }
}

/// One named value of an enum.
#[derive(Clone, Copy)]
pub struct EnumValueDef<'c> {
    context: &'c SchemaContext,
    parent: usize,
    index: usize,
}

impl<'c> EnumValueDef<'c> {
    pub(crate) fn new(context: &'c SchemaContext, parent: usize, index: usize) -> Self {
        EnumValueDef {
            context,
            parent,
            index,
        }
    }

    fn data(&self) -> &'c EnumValueData {
        &self.context.enums[self.parent].values[self.index]
    }

    pub fn name(&self) -> &'c str {
        &self.data().name
    }

    /// Scoped as a sibling of the enum, `pkg.VALUE` rather than
    /// `pkg.Enum.VALUE`.
    pub fn full_name(&self) -> &'c str {
        &self.data().full_name
    }

    pub fn number(&self) -> i32 {
        self.data().number
    }

    pub fn enum_type(&self) -> EnumDef<'c> {
        EnumDef::new(self.context, self.parent)
    }
}

impl fmt::Debug for EnumValueDef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumValueDef")
            .field("name", &self.full_name())
            .field("number", &self.number())
            .finish()
    }
}

/// One `.proto` file.
#[derive(Clone, Copy)]
pub struct FileDef<'c> {
    context: &'c SchemaContext,
    index: usize,
}

impl<'c> FileDef<'c> {
    pub(crate) fn new(context: &'c SchemaContext, index: usize) -> Self {
        FileDef { context, index }
    }

    fn data(&self) -> &'c FileData {
        &self.context.files[self.index]
    }

    pub fn name(&self) -> &'c str {
        &self.data().name
    }

    pub fn package(&self) -> &'c str {
        &self.data().package
    }

    pub fn syntax(&self) -> Syntax {
        self.data().syntax
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &'c str> + use<'c> {
        self.data().dependencies.iter().map(String::as_str)
    }

    /// Top-level messages.
    pub fn messages(&self) -> impl Iterator<Item = MessageDef<'c>> + use<'c> {
        let context = self.context;
        self.data()
            .messages
            .iter()
            .map(move |index| MessageDef::new(context, *index))
    }

    /// Top-level enums.
    pub fn enums(&self) -> impl Iterator<Item = EnumDef<'c>> + use<'c> {
        let context = self.context;
        self.data()
            .enums
            .iter()
            .map(move |index| EnumDef::new(context, *index))
    }

    /// Top-level extensions.
    pub fn extensions(&self) -> impl Iterator<Item = ExtensionDef<'c>> + use<'c> {
        let context = self.context;
        self.data()
            .extensions
            .iter()
            .map(move |index| FieldDef::extension(context, *index))
    }
}

impl fmt::Debug for FileDef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileDef").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::descriptor::testing::{Proto, field};
    use super::*;
    use crate::arena::Arena;
    use crate::error::SchemaError;
    use crate::layout::{LayoutSet, SubLayout};
    use crate::message::Message;

    const OPTIONAL: u64 = 1;
    const REQUIRED: u64 = 2;
    const REPEATED: u64 = 3;

    fn typed(name: &str, number: u32, label: u64, field_type: FieldType, type_name: &str) -> Proto {
        field(name, number, label, field_type as u64).string(6, type_name)
    }

    fn context_with(files: Vec<Proto>) -> Result<SchemaContext, SchemaError> {
        let set = files
            .into_iter()
            .fold(Proto::new(), |set, file| set.message(1, file))
            .finish();
        let mut context = SchemaContext::new();
        context.add_descriptors(&set)?;
        Ok(context)
    }

    fn file(name: &str, package: &str, syntax: &str) -> Proto {
        Proto::new()
            .string(1, name)
            .string(2, package)
            .string(12, syntax)
    }

    /// ```text
    /// syntax = "proto3";
    /// package p3;
    /// message Scalars {
    ///   int32 plain = 1;
    ///   optional int32 tracked = 2;
    ///   repeated int32 numbers = 3;
    ///   map<string, int32> counts = 4;
    ///   oneof choice { string text = 5; Scalars child = 6; }
    ///   string snake_case_name = 7;
    ///   Color color = 8;
    /// }
    /// enum Color { COLOR_UNSET = 0; RED = 1; }
    /// ```
    fn proto3() -> Proto {
        let counts_entry = Proto::new()
            .string(1, "CountsEntry")
            .message(2, field("key", 1, OPTIONAL, FieldType::String as u64))
            .message(2, field("value", 2, OPTIONAL, FieldType::Int32 as u64))
            .message(7, Proto::new().varint(7, 1));
        let scalars = Proto::new()
            .string(1, "Scalars")
            .message(2, field("plain", 1, OPTIONAL, FieldType::Int32 as u64))
            .message(
                2,
                field("tracked", 2, OPTIONAL, FieldType::Int32 as u64)
                    .varint(9, 1)
                    .varint(17, 1),
            )
            .message(2, field("numbers", 3, REPEATED, FieldType::Int32 as u64))
            .message(
                2,
                typed("counts", 4, REPEATED, FieldType::Message, ".p3.Scalars.CountsEntry"),
            )
            .message(2, field("text", 5, OPTIONAL, FieldType::String as u64).varint(9, 0))
            .message(2, typed("child", 6, OPTIONAL, FieldType::Message, "Scalars").varint(9, 0))
            .message(2, field("snake_case_name", 7, OPTIONAL, FieldType::String as u64))
            .message(2, typed("color", 8, OPTIONAL, FieldType::Enum, "Color"))
            .message(3, counts_entry)
            .message(8, Proto::new().string(1, "choice"))
            .message(8, Proto::new().string(1, "_tracked"));
        let color = Proto::new()
            .string(1, "Color")
            .message(2, Proto::new().string(1, "COLOR_UNSET").varint(2, 0))
            .message(2, Proto::new().string(1, "RED").varint(2, 1));
        file("p3.proto", "p3", "proto3")
            .message(4, scalars)
            .message(5, color)
    }

    #[test]
    fn test_proto3_presence_and_packing() {
        let context = context_with(vec![proto3()]).unwrap();
        let scalars = context.find_message("p3.Scalars").unwrap();
        assert_eq!(scalars.syntax(), Syntax::Proto3);

        let plain = scalars.field_by_name("plain").unwrap();
        assert!(!plain.has_presence());
        assert_eq!(plain.entry().presence(), 0);

        let tracked = scalars.field_by_name("tracked").unwrap();
        assert!(tracked.has_presence());
        assert!(tracked.is_proto3_optional());
        assert!(tracked.containing_oneof().unwrap().is_synthetic());
        assert!(tracked.real_containing_oneof().is_none());
        assert!(tracked.entry().hasbit().is_some());

        let numbers = scalars.field_by_name("numbers").unwrap();
        assert!(numbers.is_packed());
        assert!(numbers.entry().is_packed());

        let text = scalars.field_by_name("text").unwrap();
        assert!(text.entry().validates_utf8());
        let choice = text.real_containing_oneof().unwrap();
        assert_eq!(choice.full_name(), "p3.Scalars.choice");
        assert_eq!(
            choice.fields().map(|field| field.number()).collect::<Vec<_>>(),
            vec![5, 6]
        );
        // Only the real oneof gets a case slot.
        assert_eq!(scalars.layout().oneofs().len(), 1);

        let color = scalars.field_by_name("color").unwrap();
        assert!(!color.is_closed_enum());
        assert!(!color.entry().is_closed_enum());
        assert_eq!(color.default_value(), Value::Enum(0));

        assert_eq!(
            scalars.field_by_name("snake_case_name").unwrap().json_name(),
            "snakeCaseName"
        );
        assert!(scalars.field_by_json_name("snakeCaseName").is_some());
    }

    #[test]
    fn test_map_fields() {
        let context = context_with(vec![proto3()]).unwrap();
        let scalars = context.find_message("p3.Scalars").unwrap();
        let counts = scalars.field_by_name("counts").unwrap();
        assert!(counts.is_map());
        assert!(counts.entry().is_map());

        let entry = counts.message_type().unwrap();
        assert!(entry.is_map_entry());
        assert_eq!(entry.map_key().unwrap().field_type(), FieldType::String);
        assert_eq!(entry.map_value().unwrap().field_type(), FieldType::Int32);
        assert_eq!(entry.layout().size(), 32);
        assert_eq!(entry.containing_type(), Some(scalars));

        // Usable through reflection straight away.
        let mut arena = Arena::new();
        let message = Message::new(scalars.layout(), &mut arena).unwrap();
        let key = crate::message::MapKey::String(b"a".as_slice().into());
        message
            .map_insert(&mut arena, counts.entry(), key.clone(), Value::I32(3))
            .unwrap();
        assert_eq!(
            message.map_get(&arena, counts.entry(), &key),
            Some(Value::I32(3))
        );
    }

    #[test]
    fn test_proto2_defaults_and_required() {
        let shape = Proto::new()
            .string(1, "Shape")
            .message(2, field("id", 1, REQUIRED, FieldType::Int64 as u64))
            .message(
                2,
                field("sides", 2, OPTIONAL, FieldType::UInt32 as u64).string(7, "4"),
            )
            .message(
                2,
                typed("kind", 3, OPTIONAL, FieldType::Enum, "Kind").string(7, "SQUARE"),
            )
            .message(2, field("label", 4, OPTIONAL, FieldType::Bytes as u64).string(7, "a\\0b"))
            .message(
                2,
                field("points", 5, REPEATED, FieldType::Int32 as u64)
                    .message(8, Proto::new().varint(2, 1)),
            )
            .message(
                4,
                Proto::new()
                    .string(1, "Kind")
                    .message(2, Proto::new().string(1, "CIRCLE").varint(2, 1))
                    .message(2, Proto::new().string(1, "SQUARE").varint(2, 4)),
            );
        let context = context_with(vec![file("shape.proto", "geo", "proto2").message(4, shape)])
            .unwrap();
        let shape = context.find_message("geo.Shape").unwrap();

        let id = shape.field_by_number(1).unwrap();
        assert!(id.is_required());
        assert_eq!(shape.layout().required_count(), 1);
        assert!(!id.has_default());
        assert_eq!(id.default_value(), Value::I64(0));

        let sides = shape.field_by_number(2).unwrap();
        assert!(sides.has_default());
        assert_eq!(sides.default_value(), Value::U32(4));

        let kind = shape.field_by_number(3).unwrap();
        assert!(kind.is_closed_enum());
        assert_eq!(kind.default_value(), Value::Enum(4));
        let kinds = kind.enum_type().unwrap();
        assert_eq!(kinds.full_name(), "geo.Shape.Kind");
        assert_eq!(kinds.default_value(), 1);
        assert_eq!(kinds.value_by_number(4).unwrap().name(), "SQUARE");
        assert_eq!(
            context.lookup("geo.Shape.SQUARE").map(|_| ()),
            Some(()),
            "enum values are siblings of their enum"
        );

        assert_eq!(
            shape.field_by_number(4).unwrap().default_value(),
            Value::Bytes(b"a\0b")
        );
        assert!(shape.field_by_number(5).unwrap().is_packed());
        assert!(!shape.field_by_number(4).unwrap().entry().validates_utf8());
    }

    #[test]
    fn test_proto3_rejects_required_and_defaults() {
        let required = file("bad.proto", "bad", "proto3").message(
            4,
            Proto::new()
                .string(1, "M")
                .message(2, field("x", 1, REQUIRED, FieldType::Int32 as u64)),
        );
        let err = context_with(vec![required]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDescriptor { ref symbol, .. } if symbol == "bad.M.x"));

        let defaulted = file("bad.proto", "bad", "proto3").message(
            4,
            Proto::new()
                .string(1, "M")
                .message(2, field("x", 1, OPTIONAL, FieldType::Int32 as u64).string(7, "1")),
        );
        assert!(context_with(vec![defaulted]).is_err());
    }

    #[test]
    fn test_rejects_editions_and_reserved_numbers() {
        let editions = file("e.proto", "e", "editions");
        assert!(matches!(
            context_with(vec![editions]),
            Err(SchemaError::InvalidDescriptor { .. })
        ));

        let reserved = file("r.proto", "r", "proto2").message(
            4,
            Proto::new()
                .string(1, "M")
                .message(2, field("x", 19500, OPTIONAL, FieldType::Int32 as u64)),
        );
        assert!(context_with(vec![reserved]).is_err());

        let duplicate_number = file("d.proto", "d", "proto2").message(
            4,
            Proto::new()
                .string(1, "M")
                .message(2, field("x", 1, OPTIONAL, FieldType::Int32 as u64))
                .message(2, field("y", 1, OPTIONAL, FieldType::Int32 as u64)),
        );
        assert!(matches!(
            context_with(vec![duplicate_number]),
            Err(SchemaError::InvalidDescriptor { ref symbol, .. }) if symbol == "d.M"
        ));
    }

    /// ```text
    /// package ext;
    /// message Base { extensions 100 to 199; }
    /// extend Base { optional int32 weight = 100; }
    /// message Holder { extend Base { repeated Holder holders = 101; } }
    /// message Set { option message_set_wire_format = true; extensions 4 to max; }
    /// message Item { extend Set { optional Item item = 10; } }
    /// ```
    fn extensions() -> Proto {
        let base = Proto::new()
            .string(1, "Base")
            .message(5, Proto::new().varint(1, 100).varint(2, 200));
        let holder = Proto::new().string(1, "Holder").message(
            6,
            typed("holders", 101, REPEATED, FieldType::Message, "Holder").string(2, "Base"),
        );
        let set = Proto::new()
            .string(1, "Set")
            .message(5, Proto::new().varint(1, 4).varint(2, 0x7FFF_FFFF))
            .message(7, Proto::new().varint(1, 1));
        let item = Proto::new().string(1, "Item").message(
            6,
            typed("item", 10, OPTIONAL, FieldType::Message, ".ext.Item").string(2, ".ext.Set"),
        );
        file("ext.proto", "ext", "proto2")
            .message(4, base)
            .message(4, holder)
            .message(4, set)
            .message(4, item)
            .message(
                7,
                field("weight", 100, OPTIONAL, FieldType::Int32 as u64).string(2, "Base"),
            )
    }

    #[test]
    fn test_extensions() {
        let context = context_with(vec![extensions()]).unwrap();
        let base = context.find_message("ext.Base").unwrap();
        assert!(base.is_extendable());
        assert_eq!(base.extension_ranges(), &[100..200]);

        let weight = context.find_extension("ext.weight").unwrap();
        assert!(weight.is_extension());
        assert_eq!(weight.containing_type(), base);
        assert!(weight.extension_scope().is_none());
        assert_eq!(context.find_extension_by_number(base, 100), Some(weight));

        let holders = context.find_extension("ext.Holder.holders").unwrap();
        assert_eq!(
            holders.extension_scope().unwrap().full_name(),
            "ext.Holder"
        );
        assert!(holders.is_repeated());
        assert_eq!(
            context
                .find_message("ext.Holder")
                .unwrap()
                .nested_extensions()
                .count(),
            1
        );

        let set = context.find_message("ext.Set").unwrap();
        assert!(set.is_message_set());
        let item = context.find_extension("ext.Item.item").unwrap();
        assert_eq!(item.containing_type(), set);

        // Registered for decoding.
        let registry = context.extension_registry();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.find(base.layout().id(), 100),
            weight.extension_id()
        );

        // Settable on an instance of the extendee.
        let mut arena = Arena::new();
        let message = Message::new(base.layout(), &mut arena).unwrap();
        let id = weight.extension_id().unwrap();
        message.set_extension(&mut arena, id, Value::I32(7)).unwrap();
        assert_eq!(message.get_extension(&arena, id), Some(Value::I32(7)));
        assert_eq!(weight.entry().number(), 100);
    }

    #[test]
    fn test_extension_outside_range() {
        let bad = file("x.proto", "x", "proto2")
            .message(
                4,
                Proto::new()
                    .string(1, "Base")
                    .message(5, Proto::new().varint(1, 100).varint(2, 200)),
            )
            .message(7, field("far", 500, OPTIONAL, FieldType::Int32 as u64).string(2, "Base"));
        assert!(matches!(
            context_with(vec![bad]),
            Err(SchemaError::InvalidDescriptor { ref symbol, .. }) if symbol == "x.far"
        ));
    }

    #[test]
    fn test_mini_descriptors_rebuild_the_layout() {
        let context = context_with(vec![proto3()]).unwrap();
        let scalars = context.find_message("p3.Scalars").unwrap();

        let mut set = LayoutSet::new();
        let rebuilt = set
            .add_mini_descriptor(&scalars.mini_descriptor().unwrap())
            .unwrap();
        let rebuilt = set.layout(rebuilt);
        let original = scalars.layout();
        assert_eq!(rebuilt.size(), original.size());
        let shape = |fields: &[FieldEntry]| {
            fields
                .iter()
                .map(|field| (field.number(), field.field_type(), field.offset(), field.presence()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(rebuilt.fields()), shape(original.fields()));

        let color = context.find_enum("p3.Color").unwrap();
        let id = set
            .add_enum_mini_descriptor(&color.mini_descriptor().unwrap())
            .unwrap();
        assert!(set.enum_layout(id).contains(1));
        assert!(!set.enum_layout(id).contains(2));

        let weight_context = context_with(vec![extensions()]).unwrap();
        let weight = weight_context.find_extension("ext.weight").unwrap();
        let base = set
            .add_mini_descriptor(&weight_context.find_message("ext.Base").unwrap().mini_descriptor().unwrap())
            .unwrap();
        let ext = set
            .add_extension_mini_descriptor(&weight.mini_descriptor().unwrap(), base, SubLayout::Unlinked)
            .unwrap();
        assert_eq!(set.extension(ext).number(), 100);
        assert_eq!(set.extension(ext).field().field_type(), FieldType::Int32);
    }
}
