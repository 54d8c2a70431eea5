use super::{
    END, FIELD_SEPARATOR, MAX_MODIFIER, MAX_ONEOF_FIELD, MAX_SKIP, MIN_MODIFIER, MIN_ONEOF_FIELD,
    MIN_SKIP, MessageModifiers, ONEOF_SEPARATOR, REPEATED_BASE, VERSION_ENUM, VERSION_EXTENSION,
    VERSION_MAP, VERSION_MESSAGE, VERSION_MESSAGE_SET, base, encoded_type, field_mod, log2_ceil,
    to_base92,
};
use crate::error::LayoutError;
use crate::layout::builder::{FieldSpec, Label, MessageKind, MessageSpec};
use crate::layout::{EnumLayout, FieldType};

/// Properties of a field handed to [`MiniDescriptorEncoder::put_field`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldModifiers(u32);

impl FieldModifiers {
    pub const REPEATED: FieldModifiers = FieldModifiers(1 << 0);
    pub const PACKED: FieldModifiers = FieldModifiers(1 << 1);
    pub const CLOSED_ENUM: FieldModifiers = FieldModifiers(1 << 2);
    pub const PROTO3_SINGULAR: FieldModifiers = FieldModifiers(1 << 3);
    pub const REQUIRED: FieldModifiers = FieldModifiers(1 << 4);
    pub const VALIDATE_UTF8: FieldModifiers = FieldModifiers(1 << 5);

    pub const fn empty() -> Self {
        FieldModifiers(0)
    }

    pub const fn contains(self, other: FieldModifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FieldModifiers) {
        self.0 |= other.0;
    }

    /// Modifiers describing `field`.
    pub fn of(field: &FieldSpec) -> Self {
        let mut modifiers = FieldModifiers::empty();
        match field.label {
            Label::Repeated => modifiers.insert(FieldModifiers::REPEATED),
            Label::Required => modifiers.insert(FieldModifiers::REQUIRED),
            Label::Optional => {}
        }
        if field.packed {
            modifiers.insert(FieldModifiers::PACKED);
        }
        if field.field_type == FieldType::Enum && field.closed_enum {
            modifiers.insert(FieldModifiers::CLOSED_ENUM);
        }
        if field.implicit_presence {
            modifiers.insert(FieldModifiers::PROTO3_SINGULAR);
        }
        if field.field_type == FieldType::String && field.validate_utf8 {
            modifiers.insert(FieldModifiers::VALIDATE_UTF8);
        }
        modifiers
    }
}

impl core::ops::BitOr for FieldModifiers {
    type Output = FieldModifiers;

    fn bitor(self, rhs: FieldModifiers) -> FieldModifiers {
        FieldModifiers(self.0 | rhs.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OneofState {
    NotStarted,
    Started,
    EmittedField,
}

#[derive(Debug, Clone)]
enum State {
    Idle,
    Message {
        modifiers: MessageModifiers,
        last_number: u32,
        oneof: OneofState,
    },
    Enum {
        last_value: u32,
        mask: u64,
    },
}

/// Incremental writer of the compact encoding.
///
/// Calls follow the shape of the encoding: `start_message`, then
/// `put_field` in ascending field-number order, then for each oneof
/// `start_oneof` and its `put_oneof_field`s. Enums go through `start_enum`,
/// ascending `put_enum_value`s and `end_enum`.
#[derive(Debug, Clone)]
pub struct MiniDescriptorEncoder {
    out: String,
    state: State,
}

impl Default for MiniDescriptorEncoder {
    fn default() -> Self {
        MiniDescriptorEncoder::new()
    }
}

impl MiniDescriptorEncoder {
    pub fn new() -> Self {
        MiniDescriptorEncoder {
            out: String::new(),
            state: State::Idle,
        }
    }

    /// The encoding written so far.
    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn put_varint(&mut self, mut value: u32, min: u8, max: u8) {
        let shift = log2_ceil(u32::from(base(max) - base(min)) + 1);
        let mask = (1u32 << shift) - 1;
        loop {
            let digit = u8::try_from(value & mask).unwrap_or(0);
            self.out.push(to_base92(digit + base(min)));
            value >>= shift;
            if value == 0 {
                break;
            }
        }
    }

    fn put_modifier(&mut self, modifier: u32) {
        if modifier != 0 {
            self.put_varint(modifier, MIN_MODIFIER, MAX_MODIFIER);
        }
    }

    fn reset_message(&mut self, version: u8, modifiers: MessageModifiers) {
        self.out.push(char::from(version));
        self.state = State::Message {
            modifiers,
            last_number: 0,
            oneof: OneofState::NotStarted,
        };
    }

    pub fn start_message(&mut self, modifiers: MessageModifiers) {
        self.reset_message(VERSION_MESSAGE, modifiers);
        self.put_modifier(modifiers.bits());
    }

    /// Append a field, numbers must be strictly ascending.
    pub fn put_field(
        &mut self,
        field_type: FieldType,
        number: u32,
        modifiers: FieldModifiers,
    ) -> Result<(), LayoutError> {
        let State::Message {
            modifiers: message,
            last_number,
            oneof,
        } = self.state
        else {
            return Err(LayoutError::encoding("put_field outside of a message"));
        };
        if oneof != OneofState::NotStarted {
            return Err(LayoutError::encoding("fields must precede oneofs"));
        }
        if number <= last_number {
            return Err(LayoutError::encoding(format!(
                "field {number} is not above the previous field {last_number}"
            )));
        }
        let repeated = modifiers.contains(FieldModifiers::REPEATED);
        let validates = modifiers.contains(FieldModifiers::VALIDATE_UTF8);
        if field_type == FieldType::String
            && message.contains(MessageModifiers::VALIDATE_UTF8)
            && !validates
        {
            return Err(LayoutError::encoding(format!(
                "string field {number} cannot opt out of UTF-8 validation"
            )));
        }

        if number != last_number + 1 {
            self.put_varint(number - last_number, MIN_SKIP, MAX_SKIP);
        }

        let mut encoded = encoded_type(
            field_type,
            modifiers.contains(FieldModifiers::CLOSED_ENUM),
        );
        if repeated {
            encoded += REPEATED_BASE;
        }
        self.out.push(to_base92(encoded));

        let mut field_modifiers = 0;
        if repeated && field_type.is_packable() {
            let packed = modifiers.contains(FieldModifiers::PACKED);
            if packed != message.contains(MessageModifiers::DEFAULT_IS_PACKED) {
                field_modifiers |= field_mod::FLIP_PACKED;
            }
        }
        if field_type == FieldType::String
            && validates != message.contains(MessageModifiers::VALIDATE_UTF8)
        {
            field_modifiers |= field_mod::FLIP_VALIDATE_UTF8;
        }
        if modifiers.contains(FieldModifiers::PROTO3_SINGULAR) {
            field_modifiers |= field_mod::IS_PROTO3_SINGULAR;
        }
        if modifiers.contains(FieldModifiers::REQUIRED) {
            field_modifiers |= field_mod::IS_REQUIRED;
        }
        self.put_modifier(field_modifiers);

        self.state = State::Message {
            modifiers: message,
            last_number: number,
            oneof,
        };
        Ok(())
    }

    pub fn start_oneof(&mut self) -> Result<(), LayoutError> {
        let State::Message { oneof, .. } = &mut self.state else {
            return Err(LayoutError::encoding("start_oneof outside of a message"));
        };
        let separator = match oneof {
            OneofState::NotStarted => END,
            OneofState::Started | OneofState::EmittedField => ONEOF_SEPARATOR,
        };
        *oneof = OneofState::Started;
        self.out.push(char::from(separator));
        Ok(())
    }

    pub fn put_oneof_field(&mut self, number: u32) -> Result<(), LayoutError> {
        let State::Message { oneof, .. } = &mut self.state else {
            return Err(LayoutError::encoding("put_oneof_field outside of a message"));
        };
        match oneof {
            OneofState::NotStarted => {
                return Err(LayoutError::encoding("put_oneof_field before start_oneof"));
            }
            OneofState::EmittedField => self.out.push(char::from(FIELD_SEPARATOR)),
            OneofState::Started => {}
        }
        *oneof = OneofState::EmittedField;
        self.put_varint(number, MIN_ONEOF_FIELD, MAX_ONEOF_FIELD);
        Ok(())
    }

    pub fn start_enum(&mut self) {
        self.out.push(char::from(VERSION_ENUM));
        self.state = State::Enum {
            last_value: 0,
            mask: 0,
        };
    }

    fn flush_enum_mask(&mut self) {
        if let State::Enum { last_value, mask } = &mut self.state {
            let digit = u8::try_from(*mask).unwrap_or(0);
            *mask = 0;
            *last_value += 5;
            self.out.push(to_base92(digit));
        }
    }

    /// Append an enum value, values are compared as unsigned integers and
    /// must be strictly ascending.
    pub fn put_enum_value(&mut self, value: i32) -> Result<(), LayoutError> {
        let value = value.cast_unsigned();
        let State::Enum { last_value, mask } = self.state else {
            return Err(LayoutError::encoding("put_enum_value outside of an enum"));
        };
        if value < last_value || (value - last_value < 64 && mask >> (value - last_value) != 0) {
            return Err(LayoutError::encoding(format!(
                "enum value {value} is not ascending"
            )));
        }

        let mut delta = value - last_value;
        if delta >= 5 && mask != 0 {
            self.flush_enum_mask();
            delta -= 5;
        }
        if delta >= 5 {
            self.put_varint(delta, MIN_SKIP, MAX_SKIP);
            if let State::Enum { last_value, .. } = &mut self.state {
                *last_value += delta;
            }
            delta = 0;
        }
        if let State::Enum { mask, .. } = &mut self.state {
            *mask |= 1 << delta;
        }
        Ok(())
    }

    pub fn end_enum(&mut self) {
        if let State::Enum { mask, .. } = self.state {
            if mask != 0 {
                self.flush_enum_mask();
            }
        }
        self.state = State::Idle;
    }

    /// A complete `#` encoding of one extension field.
    pub fn encode_extension(
        &mut self,
        field_type: FieldType,
        number: u32,
        modifiers: FieldModifiers,
    ) -> Result<(), LayoutError> {
        self.reset_message(VERSION_EXTENSION, MessageModifiers::empty());
        self.put_field(field_type, number, modifiers)
    }

    /// A complete `%` encoding of a map entry.
    pub fn encode_map(
        &mut self,
        key_type: FieldType,
        value_type: FieldType,
        key_modifiers: FieldModifiers,
        value_modifiers: FieldModifiers,
    ) -> Result<(), LayoutError> {
        self.reset_message(VERSION_MAP, MessageModifiers::empty());
        self.put_field(key_type, 1, key_modifiers)?;
        self.put_field(value_type, 2, value_modifiers)
    }

    pub fn encode_message_set(&mut self) {
        self.out.push(char::from(VERSION_MESSAGE_SET));
        self.state = State::Idle;
    }
}

/// Message-wide defaults that keep the field modifiers of `spec` short.
fn message_modifiers(spec: &MessageSpec) -> MessageModifiers {
    let mut modifiers = MessageModifiers::empty();
    let strings: Vec<&FieldSpec> = spec
        .fields
        .iter()
        .filter(|field| field.field_type == FieldType::String)
        .collect();
    if !strings.is_empty() && strings.iter().all(|field| field.validate_utf8) {
        modifiers.insert(MessageModifiers::VALIDATE_UTF8);
    }

    let (packed, unpacked) = spec
        .fields
        .iter()
        .filter(|field| field.label == Label::Repeated && field.field_type.is_packable())
        .fold((0, 0), |(packed, unpacked), field| {
            if field.packed {
                (packed + 1, unpacked)
            } else {
                (packed, unpacked + 1)
            }
        });
    if packed > unpacked {
        modifiers.insert(MessageModifiers::DEFAULT_IS_PACKED);
    }
    if spec.extendable {
        modifiers.insert(MessageModifiers::IS_EXTENDABLE);
    }
    modifiers
}

/// Encode a whole message description.
pub fn encode_message(spec: &MessageSpec) -> Result<String, LayoutError> {
    let mut encoder = MiniDescriptorEncoder::new();
    match spec.kind {
        MessageKind::MessageSet => encoder.encode_message_set(),
        MessageKind::MapEntry => {
            let [key, value] = spec.fields.as_slice() else {
                return Err(LayoutError::InvalidMapEntry(
                    "map entry must have exactly two fields",
                ));
            };
            encoder.encode_map(
                key.field_type,
                value.field_type,
                FieldModifiers::of(key),
                FieldModifiers::of(value),
            )?;
        }
        MessageKind::Message => {
            encoder.start_message(message_modifiers(spec));
            let mut fields: Vec<&FieldSpec> = spec.fields.iter().collect();
            fields.sort_by_key(|field| field.number);
            for field in &fields {
                encoder.put_field(field.field_type, field.number, FieldModifiers::of(field))?;
            }
            for oneof in 0..spec.oneof_count {
                encoder.start_oneof()?;
                for field in fields.iter().filter(|field| field.oneof == Some(oneof)) {
                    encoder.put_oneof_field(field.number)?;
                }
            }
        }
    }
    Ok(encoder.finish())
}

/// Encode an enum's value set.
pub fn encode_enum(layout: &EnumLayout) -> Result<String, LayoutError> {
    let mut encoder = MiniDescriptorEncoder::new();
    encoder.start_enum();
    for value in layout.values() {
        encoder.put_enum_value(value)?;
    }
    encoder.end_enum();
    Ok(encoder.finish())
}

#[cfg(test)]
mod tests {
    use super::super::{decode_enum, decode_extension, decode_message};
    use super::*;
    use crate::layout::builder::build_layout;

    #[test]
    fn test_encode_message() {
        let mut encoder = MiniDescriptorEncoder::new();
        encoder.start_message(MessageModifiers::VALIDATE_UTF8 | MessageModifiers::DEFAULT_IS_PACKED);
        encoder
            .put_field(FieldType::Int32, 1, FieldModifiers::empty())
            .unwrap();
        encoder
            .put_field(
                FieldType::Int32,
                2,
                FieldModifiers::REPEATED | FieldModifiers::PACKED,
            )
            .unwrap();
        encoder
            .put_field(FieldType::String, 3, FieldModifiers::VALIDATE_UTF8)
            .unwrap();
        insta::assert_snapshot!(encoder.as_str(), @"$O(<1");

        let err = encoder
            .put_field(FieldType::Int32, 3, FieldModifiers::empty())
            .unwrap_err();
        assert!(matches!(err, LayoutError::InvalidDescriptorEncoding(_)));
    }

    #[test]
    fn test_encode_skips_and_oneofs() {
        let mut encoder = MiniDescriptorEncoder::new();
        encoder.start_message(MessageModifiers::empty());
        encoder
            .put_field(FieldType::Int32, 1, FieldModifiers::empty())
            .unwrap();
        encoder
            .put_field(FieldType::Int32, 5, FieldModifiers::empty())
            .unwrap();
        encoder.start_oneof().unwrap();
        encoder.put_oneof_field(1).unwrap();
        encoder.put_oneof_field(5).unwrap();
        insta::assert_snapshot!(encoder.as_str(), @"$(c(^!|&");
    }

    #[test]
    fn test_encode_enum() {
        let layout = EnumLayout::from_values([0, 1, 2, 100, 101]);
        let encoded = encode_enum(&layout).unwrap();
        insta::assert_snapshot!(encoded, @"!)~a$");
        assert_eq!(decode_enum(&encoded).unwrap(), layout);

        let mut encoder = MiniDescriptorEncoder::new();
        encoder.start_enum();
        encoder.put_enum_value(3).unwrap();
        assert!(encoder.put_enum_value(3).is_err());
        assert!(encoder.put_enum_value(1).is_err());
    }

    #[test]
    fn test_encode_extension_and_map() {
        let mut encoder = MiniDescriptorEncoder::new();
        encoder
            .encode_extension(
                FieldType::Enum,
                10,
                FieldModifiers::REPEATED | FieldModifiers::CLOSED_ENUM,
            )
            .unwrap();
        let encoded = encoder.finish();
        insta::assert_snapshot!(encoded, @"#iH");
        assert_eq!(decode_extension(&encoded).unwrap().number, 10);

        let mut encoder = MiniDescriptorEncoder::new();
        encoder
            .encode_map(
                FieldType::String,
                FieldType::Message,
                FieldModifiers::empty(),
                FieldModifiers::empty(),
            )
            .unwrap();
        let encoded = encoder.finish();
        insta::assert_snapshot!(encoded, @"%13");
        let spec = decode_message(&encoded).unwrap();
        assert_eq!(spec.kind, MessageKind::MapEntry);
        build_layout(&spec).unwrap();

        let mut encoder = MiniDescriptorEncoder::new();
        encoder.encode_message_set();
        assert_eq!(decode_message(encoder.as_str()).unwrap().kind, MessageKind::MessageSet);
    }

    #[test]
    fn test_encoding_rebuilds_the_message() {
        let spec = MessageSpec {
            kind: MessageKind::Message,
            extendable: true,
            fields: vec![
                FieldSpec {
                    label: Label::Required,
                    ..FieldSpec::new(1, FieldType::Int64)
                },
                FieldSpec {
                    label: Label::Repeated,
                    packed: true,
                    ..FieldSpec::new(3, FieldType::SInt32)
                },
                FieldSpec {
                    oneof: Some(0),
                    ..FieldSpec::new(7, FieldType::Message)
                },
                FieldSpec {
                    oneof: Some(0),
                    validate_utf8: true,
                    ..FieldSpec::new(8, FieldType::String)
                },
                FieldSpec {
                    closed_enum: false,
                    implicit_presence: true,
                    ..FieldSpec::new(200, FieldType::Enum)
                },
            ],
            oneof_count: 1,
        };
        let encoded = encode_message(&spec).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, spec);
        assert_eq!(build_layout(&decoded).unwrap(), build_layout(&spec).unwrap());
    }
}
