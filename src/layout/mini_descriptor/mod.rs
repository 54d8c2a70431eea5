//! Compact base-92 encoding of message, enum and extension layouts.
//!
//! The encoding is a version character followed by one character per field
//! (its type, shifted by [`REPEATED_BASE`] when repeated), optional modifier
//! varints after a field, skip varints for gaps in the field numbers and an
//! optional oneof section introduced by `^`.
//!
//! Every character is drawn from the 92 printable ASCII characters other
//! than `"`, `'` and `\`, so an encoding can be pasted into a string literal
//! of most languages unescaped.

mod encode;

pub use encode::{FieldModifiers, MiniDescriptorEncoder, encode_enum, encode_message};

use super::builder::{FieldSpec, Label, MessageKind, MessageSpec};
use super::{EnumLayout, FieldType};
use crate::error::LayoutError;

pub(crate) const VERSION_MESSAGE: u8 = b'$';
pub(crate) const VERSION_MAP: u8 = b'%';
pub(crate) const VERSION_MESSAGE_SET: u8 = b'&';
pub(crate) const VERSION_ENUM: u8 = b'!';
pub(crate) const VERSION_EXTENSION: u8 = b'#';

const MAX_FIELD: u8 = b'I';
const MIN_MODIFIER: u8 = b'L';
const MAX_MODIFIER: u8 = b'[';
const END: u8 = b'^';
const MIN_SKIP: u8 = b'_';
const MAX_SKIP: u8 = b'~';
const FIELD_SEPARATOR: u8 = b'|';
const ONEOF_SEPARATOR: u8 = b'~';
const MIN_ONEOF_FIELD: u8 = b' ';
const MAX_ONEOF_FIELD: u8 = b'b';
const MIN_ENUM_MASK: u8 = b' ';
const MAX_ENUM_MASK: u8 = b'A';

/// Added to a field's encoded type when the field is repeated.
pub const REPEATED_BASE: u8 = 20;

/// Message-wide modifiers, written right after the version character.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct MessageModifiers(u32);

impl MessageModifiers {
    pub const VALIDATE_UTF8: MessageModifiers = MessageModifiers(1 << 0);
    pub const DEFAULT_IS_PACKED: MessageModifiers = MessageModifiers(1 << 1);
    pub const IS_EXTENDABLE: MessageModifiers = MessageModifiers(1 << 2);

    pub const fn empty() -> Self {
        MessageModifiers(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        MessageModifiers(bits)
    }

    pub const fn contains(self, other: MessageModifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MessageModifiers) {
        self.0 |= other.0;
    }
}

impl core::ops::BitOr for MessageModifiers {
    type Output = MessageModifiers;

    fn bitor(self, rhs: MessageModifiers) -> MessageModifiers {
        MessageModifiers(self.0 | rhs.0)
    }
}

/// Per-field modifiers as they appear in the encoding, each one flips or
/// adds to what the field's type and the message modifiers imply.
mod field_mod {
    pub const FLIP_PACKED: u32 = 1 << 0;
    pub const FLIP_VALIDATE_UTF8: u32 = 1 << 1;
    pub const IS_PROTO3_SINGULAR: u32 = 1 << 2;
    pub const IS_REQUIRED: u32 = 1 << 3;
}

/// Field types in the order the encoding numbers them.
const ENCODED_TYPES: [(FieldType, bool); 19] = [
    (FieldType::Double, false),
    (FieldType::Float, false),
    (FieldType::Fixed32, false),
    (FieldType::Fixed64, false),
    (FieldType::SFixed32, false),
    (FieldType::SFixed64, false),
    (FieldType::Int32, false),
    (FieldType::UInt32, false),
    (FieldType::SInt32, false),
    (FieldType::Int64, false),
    (FieldType::UInt64, false),
    (FieldType::SInt64, false),
    // Open enum.
    (FieldType::Enum, false),
    (FieldType::Bool, false),
    (FieldType::Bytes, false),
    (FieldType::String, false),
    (FieldType::Group, false),
    (FieldType::Message, false),
    // Closed enum.
    (FieldType::Enum, true),
];

/// Encoded type of a field, `closed` only matters for enums.
pub(crate) fn encoded_type(field_type: FieldType, closed: bool) -> u8 {
    let position = ENCODED_TYPES
        .iter()
        .position(|(ty, is_closed)| {
            *ty == field_type && (field_type != FieldType::Enum || *is_closed == closed)
        })
        .unwrap_or(0);
    u8::try_from(position).unwrap_or(0)
}

const TO_BASE92: [u8; 92] = {
    let mut table = [0u8; 92];
    let mut ch = b' ';
    let mut i = 0;
    while ch <= b'~' {
        if ch != b'"' && ch != b'\'' && ch != b'\\' {
            table[i] = ch;
            i += 1;
        }
        ch += 1;
    }
    table
};

/// Character for a value in `0..92`.
pub(crate) fn to_base92(value: u8) -> char {
    char::from(TO_BASE92[usize::from(value)])
}

/// Value of a base-92 character.
pub(crate) fn from_base92(ch: u8) -> Option<u8> {
    if !(b' '..=b'~').contains(&ch) || matches!(ch, b'"' | b'\'' | b'\\') {
        return None;
    }
    let skipped = u8::from(ch > b'"') + u8::from(ch > b'\'') + u8::from(ch > b'\\');
    Some(ch - b' ' - skipped)
}

/// `ceil(log2(value))`, zero for values up to one.
pub(crate) const fn log2_ceil(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        32 - (value - 1).leading_zeros()
    }
}

/// Value of a range-start character, every range endpoint is in the
/// alphabet.
fn base(ch: u8) -> u8 {
    from_base92(ch).unwrap_or(0)
}

#[cold]
fn invalid_char(ch: u8) -> LayoutError {
    LayoutError::encoding(format!("Invalid char: {}", char::from(ch)))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a str) -> Self {
        Reader {
            data: data.as_bytes(),
            pos: 0,
        }
    }

    fn next(&mut self) -> Option<u8> {
        let ch = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(ch)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Decode a varint whose first character was already consumed. Each
    /// character in `min..=max` carries `log2(max - min)` bits, low bits
    /// first.
    fn read_varint(&mut self, first: u8, min: u8, max: u8) -> Result<u32, LayoutError> {
        let bits_per_char = log2_ceil(u32::from(base(max) - base(min)));
        let mut value = 0u32;
        let mut shift = 0u32;
        let mut ch = first;
        loop {
            let digit = from_base92(ch)
                .filter(|_| (min..=max).contains(&ch))
                .ok_or_else(|| invalid_char(ch))?;
            value |= u32::from(digit - base(min)) << shift;

            match self.peek() {
                Some(next) if (min..=max).contains(&next) => {
                    self.pos += 1;
                    ch = next;
                    shift += bits_per_char;
                    if shift >= 32 {
                        return Err(LayoutError::encoding("Overlong varint"));
                    }
                }
                _ => return Ok(value),
            }
        }
    }
}

/// What [`parse_fields`] is decoding, extensions hold exactly one field and
/// no message-level state.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Target {
    Message,
    Extension,
}

struct Parsed {
    modifiers: MessageModifiers,
    fields: Vec<FieldSpec>,
    oneof_count: usize,
}

fn parse_fields(reader: &mut Reader<'_>, target: Target) -> Result<Parsed, LayoutError> {
    let mut parsed = Parsed {
        modifiers: MessageModifiers::empty(),
        fields: Vec::new(),
        oneof_count: 0,
    };
    let mut last_number = 0u32;

    while let Some(ch) = reader.next() {
        if ch <= MAX_FIELD {
            if target == Target::Extension && !parsed.fields.is_empty() {
                return Err(LayoutError::encoding("Extensions must have exactly one field"));
            }
            last_number = last_number
                .checked_add(1)
                .ok_or_else(|| LayoutError::encoding("Field number overflow"))?;
            let field = new_field(ch, last_number, parsed.modifiers)?;
            parsed.fields.push(field);
        } else if (MIN_MODIFIER..=MAX_MODIFIER).contains(&ch) {
            let modifier = reader.read_varint(ch, MIN_MODIFIER, MAX_MODIFIER)?;
            match parsed.fields.last_mut() {
                Some(field) => modify_field(field, modifier)?,
                None if target == Target::Extension => {
                    return Err(LayoutError::encoding(
                        "Extensions cannot have message modifiers",
                    ));
                }
                None => parsed.modifiers = MessageModifiers::from_bits(modifier),
            }
        } else if ch == END {
            if target == Target::Extension {
                return Err(LayoutError::encoding("Extensions cannot have oneofs."));
            }
            parsed.oneof_count = parse_oneofs(reader, &mut parsed.fields)?;
        } else if (MIN_SKIP..=MAX_SKIP).contains(&ch) {
            let skip = reader.read_varint(ch, MIN_SKIP, MAX_SKIP)?;
            last_number = last_number
                .checked_add(skip)
                .and_then(|n| n.checked_sub(1))
                .ok_or_else(|| LayoutError::encoding("Field number overflow"))?;
        } else {
            return Err(invalid_char(ch));
        }
    }
    Ok(parsed)
}

fn new_field(ch: u8, number: u32, modifiers: MessageModifiers) -> Result<FieldSpec, LayoutError> {
    let mut encoded = from_base92(ch).ok_or_else(|| invalid_char(ch))?;
    let repeated = encoded >= REPEATED_BASE;
    if repeated {
        encoded -= REPEATED_BASE;
    }
    let (field_type, closed) = *ENCODED_TYPES
        .get(usize::from(encoded))
        .ok_or_else(|| LayoutError::encoding("Invalid field type"))?;

    let mut field = FieldSpec::new(number, field_type);
    if field_type == FieldType::Enum {
        field.closed_enum = closed;
    }
    field.validate_utf8 =
        field_type == FieldType::String && modifiers.contains(MessageModifiers::VALIDATE_UTF8);
    if repeated {
        field.label = Label::Repeated;
        field.packed =
            field_type.is_packable() && modifiers.contains(MessageModifiers::DEFAULT_IS_PACKED);
    }
    Ok(field)
}

fn modify_field(field: &mut FieldSpec, modifier: u32) -> Result<(), LayoutError> {
    let number = field.number;
    let repeated = field.label == Label::Repeated;

    if modifier & field_mod::FLIP_PACKED != 0 {
        if !repeated || !field.field_type.is_packable() {
            return Err(LayoutError::encoding(format!(
                "Cannot flip packed on unpackable field {number}"
            )));
        }
        field.packed = !field.packed;
    }
    if modifier & field_mod::FLIP_VALIDATE_UTF8 != 0 {
        if field.field_type != FieldType::String || field.validate_utf8 {
            return Err(LayoutError::encoding(format!(
                "Cannot flip ValidateUtf8 on field {number}"
            )));
        }
        field.validate_utf8 = true;
    }

    let singular = modifier & field_mod::IS_PROTO3_SINGULAR != 0;
    let required = modifier & field_mod::IS_REQUIRED != 0;
    let has_hasbit = !repeated && !field.implicit_presence && field.label != Label::Required;
    if (singular || required) && !has_hasbit {
        return Err(LayoutError::encoding(format!(
            "Invalid modifier(s) for repeated field {number}"
        )));
    }
    if singular && required {
        return Err(LayoutError::encoding(format!(
            "Field {number} cannot be both singular and required"
        )));
    }
    if singular && field.field_type.is_message() {
        return Err(LayoutError::encoding(format!(
            "Field {number} cannot be a singular submessage"
        )));
    }
    if singular {
        field.implicit_presence = true;
    }
    if required {
        field.label = Label::Required;
    }
    Ok(())
}

/// Parse the oneof section that follows `^`, it runs to the end of input.
fn parse_oneofs(reader: &mut Reader<'_>, fields: &mut [FieldSpec]) -> Result<usize, LayoutError> {
    let mut index = 0;
    let mut members = 0;

    while let Some(ch) = reader.next() {
        match ch {
            FIELD_SEPARATOR => {}
            ONEOF_SEPARATOR => {
                if members == 0 {
                    return Err(LayoutError::encoding("Empty oneof"));
                }
                index += 1;
                members = 0;
            }
            _ => {
                let number = reader.read_varint(ch, MIN_ONEOF_FIELD, MAX_ONEOF_FIELD)?;
                let field = fields
                    .iter_mut()
                    .find(|field| field.number == number)
                    .ok_or_else(|| {
                        LayoutError::encoding(format!(
                            "Couldn't add field number {number} to oneof, no such field number."
                        ))
                    })?;
                if field.label != Label::Optional
                    || field.implicit_presence
                    || field.oneof.is_some()
                {
                    return Err(LayoutError::encoding(format!(
                        "Cannot add repeated, required, or singular field {number} to oneof."
                    )));
                }
                field.oneof = Some(index);
                members += 1;
            }
        }
    }

    if members == 0 {
        return Err(LayoutError::encoding("Empty oneof"));
    }
    Ok(index + 1)
}

/// Decode a `$`, `%` or `&` encoding into a message description.
///
/// The empty string describes an empty message.
pub fn decode_message(encoded: &str) -> Result<MessageSpec, LayoutError> {
    let mut reader = Reader::new(encoded);
    let Some(version) = reader.next() else {
        return Ok(MessageSpec::default());
    };

    match version {
        VERSION_MESSAGE => {
            let parsed = parse_fields(&mut reader, Target::Message)?;
            Ok(MessageSpec {
                kind: MessageKind::Message,
                extendable: parsed.modifiers.contains(MessageModifiers::IS_EXTENDABLE),
                fields: parsed.fields,
                oneof_count: parsed.oneof_count,
            })
        }
        VERSION_MAP => {
            let parsed = parse_fields(&mut reader, Target::Message)?;
            if parsed.fields.len() != 2 {
                return Err(LayoutError::encoding(format!(
                    "{} fields in map",
                    parsed.fields.len()
                )));
            }
            if parsed.oneof_count != 0 {
                return Err(LayoutError::encoding("Map entry cannot have oneof"));
            }
            Ok(MessageSpec {
                kind: MessageKind::MapEntry,
                extendable: false,
                fields: parsed.fields,
                oneof_count: 0,
            })
        }
        VERSION_MESSAGE_SET => {
            let rest = encoded.len() - 1;
            if rest > 0 {
                return Err(LayoutError::encoding(format!(
                    "Invalid message set encode length: {rest}"
                )));
            }
            Ok(MessageSpec {
                kind: MessageKind::MessageSet,
                ..MessageSpec::default()
            })
        }
        other => Err(LayoutError::encoding(format!(
            "Invalid message version: {}",
            char::from(other)
        ))),
    }
}

/// Decode a `#` encoding into the single field it describes.
pub fn decode_extension(encoded: &str) -> Result<FieldSpec, LayoutError> {
    let mut reader = Reader::new(encoded);
    match reader.next() {
        Some(VERSION_EXTENSION) => {}
        Some(other) => {
            return Err(LayoutError::encoding(format!(
                "Invalid ext version: {}",
                char::from(other)
            )));
        }
        None => return Err(LayoutError::encoding("Extensions must have exactly one field")),
    }
    let parsed = parse_fields(&mut reader, Target::Extension)?;
    let mut fields = parsed.fields.into_iter();
    match (fields.next(), fields.next()) {
        (Some(field), None) => Ok(field),
        _ => Err(LayoutError::encoding("Extensions must have exactly one field")),
    }
}

/// Decode a `!` encoding into an enum's value set.
pub fn decode_enum(encoded: &str) -> Result<EnumLayout, LayoutError> {
    let mut reader = Reader::new(encoded);
    match reader.next() {
        None => return Ok(EnumLayout::default()),
        Some(VERSION_ENUM) => {}
        Some(other) => {
            return Err(LayoutError::encoding(format!(
                "Invalid enum version: {}",
                char::from(other)
            )));
        }
    }

    let mut values = Vec::new();
    let mut next = 0u32;
    while let Some(ch) = reader.next() {
        if (MIN_ENUM_MASK..=MAX_ENUM_MASK).contains(&ch) {
            let mut mask = from_base92(ch).ok_or_else(|| invalid_char(ch))?;
            for _ in 0..5 {
                if mask & 1 != 0 {
                    values.push(next.cast_signed());
                }
                mask >>= 1;
                next = next.wrapping_add(1);
            }
        } else if (MIN_SKIP..=MAX_SKIP).contains(&ch) {
            let skip = reader.read_varint(ch, MIN_SKIP, MAX_SKIP)?;
            next = next.wrapping_add(skip);
        } else {
            return Err(LayoutError::encoding(format!(
                "Unexpected character: {}",
                char::from(ch)
            )));
        }
    }
    Ok(EnumLayout::from_values(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::builder::build_layout;

    #[test]
    fn test_base92_alphabet() {
        assert_eq!(TO_BASE92.len(), 92);
        for value in 0..92u8 {
            let ch = to_base92(value);
            assert_eq!(from_base92(ch as u8), Some(value));
        }
        assert_eq!(from_base92(b'"'), None);
        assert_eq!(from_base92(b'\''), None);
        assert_eq!(from_base92(b'\\'), None);
        assert_eq!(from_base92(0x7F), None);
        assert_eq!(from_base92(b'I'), Some(39));
        assert_eq!(from_base92(b'~'), Some(91));
    }

    #[test]
    fn test_decode_simple_message() {
        // Validating, packed by default: int32 = 1, repeated int32 = 2,
        // string = 3.
        let spec = decode_message("$O(<1").unwrap();
        let summary: Vec<(u32, FieldType, Label, bool)> = spec
            .fields
            .iter()
            .map(|f| (f.number, f.field_type, f.label, f.packed))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, FieldType::Int32, Label::Optional, false),
                (2, FieldType::Int32, Label::Repeated, true),
                (3, FieldType::String, Label::Optional, false),
            ]
        );
        assert!(spec.fields[2].validate_utf8);
        assert!(!spec.extendable);
    }

    #[test]
    fn test_decode_skips_and_oneofs() {
        // Fields 1 and 5 (skip of 4), then one oneof holding both.
        let spec = decode_message("$(c(^!|&").unwrap();
        assert_eq!(spec.fields[0].number, 1);
        assert_eq!(spec.fields[1].number, 5);
        assert_eq!(spec.oneof_count, 1);
        assert_eq!(spec.fields[0].oneof, Some(0));
        assert_eq!(spec.fields[1].oneof, Some(0));

        let layout = build_layout(&spec).unwrap();
        assert_eq!(layout.dense_below(), 1);
        assert_eq!(layout.oneofs()[0].members(), &[1, 5]);
    }

    #[test]
    fn test_decode_errors() {
        #[track_caller]
        fn err(encoded: &str) -> String {
            match decode_message(encoded).unwrap_err() {
                LayoutError::InvalidDescriptorEncoding(reason) => reason,
                other => panic!("unexpected error {other:?}"),
            }
        }

        assert_eq!(err("$(M"), "Cannot flip packed on unpackable field 1");
        assert_eq!(err("$EM"), "Cannot flip packed on unpackable field 1");
        assert_eq!(err("$(N"), "Cannot flip ValidateUtf8 on field 1");
        assert_eq!(err("$<P"), "Invalid modifier(s) for repeated field 1");
        assert_eq!(err("$(\\"), "Invalid char: \\");
        assert_eq!(err("$(J"), "Invalid char: J");
        assert_eq!(err("$(X"), "Field 1 cannot be both singular and required");
        assert_eq!(err("$3P"), "Field 1 cannot be a singular submessage");
        assert_eq!(err("$(^"), "Empty oneof");
        assert_eq!(err("$(^!~"), "Empty oneof");
        assert_eq!(
            err("$(^#"),
            "Couldn't add field number 2 to oneof, no such field number."
        );
        assert_eq!(
            err("$(T^!"),
            "Cannot add repeated, required, or singular field 1 to oneof."
        );
        assert_eq!(err("$5"), "Invalid field type");
        assert_eq!(err("$~~~~~~~~"), "Overlong varint");
        assert_eq!(err("@"), "Invalid message version: @");
        assert_eq!(err("&$"), "Invalid message set encode length: 1");
        assert_eq!(err("%("), "1 fields in map");
    }

    #[test]
    fn test_decode_required_and_extendable() {
        // Extendable message, required int32 = 1, implicit-presence int32 = 2.
        let spec = decode_message("$P(T(P").unwrap();
        assert!(spec.extendable);
        assert_eq!(spec.fields[0].label, Label::Required);
        assert!(spec.fields[1].implicit_presence);
    }

    #[test]
    fn test_decode_enum() {
        // 0, 1, 2 then a skip to 100, 101.
        let layout = decode_enum("!)~a$").unwrap();
        assert_eq!(
            layout.values().collect::<Vec<_>>(),
            vec![0, 1, 2, 100, 101]
        );

        assert!(decode_enum("!J").is_err());
        assert!(decode_enum("$").is_err());
        assert!(decode_enum("").unwrap().is_empty());
    }

    #[test]
    fn test_decode_extension() {
        // Repeated closed enum extension field 10.
        let field = decode_extension("#iH").unwrap();
        assert_eq!(field.number, 10);
        assert_eq!(field.label, Label::Repeated);
        assert_eq!(field.field_type, FieldType::Enum);
        assert!(field.closed_enum);

        assert!(decode_extension("#((").is_err());
        assert!(decode_extension("#P(").is_err());
        assert!(decode_extension("$(").is_err());
    }
}
