//! Field default values, parsed from the descriptor's textual form.

use crate::layout::{CType, FieldType};
use crate::message::Value;

/// Owned default of one field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DefaultValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Enum(i32),
    String(Box<[u8]>),
    Bytes(Box<[u8]>),
    Message,
}

impl DefaultValue {
    /// The implicit default: zero, empty, or the first enum value.
    pub(crate) fn zero(field_type: FieldType, first_enum_value: Option<i32>) -> Self {
        match field_type.ctype() {
            CType::Bool => DefaultValue::Bool(false),
            CType::Int32 => DefaultValue::I32(0),
            CType::Int64 => DefaultValue::I64(0),
            CType::UInt32 => DefaultValue::U32(0),
            CType::UInt64 => DefaultValue::U64(0),
            CType::Float => DefaultValue::F32(0.0),
            CType::Double => DefaultValue::F64(0.0),
            CType::Enum => DefaultValue::Enum(first_enum_value.unwrap_or(0)),
            CType::String => DefaultValue::String(Box::default()),
            CType::Bytes => DefaultValue::Bytes(Box::default()),
            CType::Message => DefaultValue::Message,
        }
    }

    /// Parse an explicit `default_value`.
    ///
    /// Integers accept the C prefixes (`0x` hex, leading `0` octal), floats
    /// accept `inf` and `nan`, enums are given by value name and bytes use C
    /// escapes.
    pub(crate) fn parse<'v, I>(
        field_type: FieldType,
        text: &str,
        enum_values: I,
    ) -> Result<Self, &'static str>
    where
        I: IntoIterator<Item = (&'v str, i32)>,
    {
        const INVALID: &str = "invalid default value";

        let value = match field_type.ctype() {
            CType::Int32 => {
                DefaultValue::I32(parse_signed(text).and_then(|v| i32::try_from(v).ok()).ok_or(INVALID)?)
            }
            CType::Int64 => DefaultValue::I64(parse_signed(text).ok_or(INVALID)?),
            CType::UInt32 => {
                DefaultValue::U32(parse_unsigned(text).and_then(|v| u32::try_from(v).ok()).ok_or(INVALID)?)
            }
            CType::UInt64 => DefaultValue::U64(parse_unsigned(text).ok_or(INVALID)?),
            CType::Float => DefaultValue::F32(text.parse().map_err(|_| INVALID)?),
            CType::Double => DefaultValue::F64(text.parse().map_err(|_| INVALID)?),
            CType::Bool => match text {
                "true" => DefaultValue::Bool(true),
                "false" => DefaultValue::Bool(false),
                _ => return Err(INVALID),
            },
            CType::Enum => {
                let number = enum_values
                    .into_iter()
                    .find(|(name, _)| *name == text)
                    .map(|(_, number)| number)
                    .ok_or("default is not a value of the enum")?;
                DefaultValue::Enum(number)
            }
            CType::String => DefaultValue::String(text.as_bytes().into()),
            CType::Bytes => DefaultValue::Bytes(unescape(text)?.into_boxed_slice()),
            CType::Message => return Err("message fields cannot have defaults"),
        };
        Ok(value)
    }

    pub(crate) fn as_value(&self) -> Value<'_> {
        match self {
            DefaultValue::Bool(value) => Value::Bool(*value),
            DefaultValue::I32(value) => Value::I32(*value),
            DefaultValue::I64(value) => Value::I64(*value),
            DefaultValue::U32(value) => Value::U32(*value),
            DefaultValue::U64(value) => Value::U64(*value),
            DefaultValue::F32(value) => Value::F32(*value),
            DefaultValue::F64(value) => Value::F64(*value),
            DefaultValue::Enum(value) => Value::Enum(*value),
            DefaultValue::String(bytes) => Value::String(bytes),
            DefaultValue::Bytes(bytes) => Value::Bytes(bytes),
            DefaultValue::Message => Value::Message(None),
        }
    }
}

fn parse_unsigned(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_signed(text: &str) -> Option<i64> {
    match text.strip_prefix('-') {
        Some(magnitude) => {
            let magnitude = parse_unsigned(magnitude)?;
            0i64.checked_sub_unsigned(magnitude)
        }
        None => i64::try_from(parse_unsigned(text)?).ok(),
    }
}

/// Undo C-style escaping of a `bytes` default.
fn unescape(text: &str) -> Result<Vec<u8>, &'static str> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        i += 1;
        if byte != b'\\' {
            out.push(byte);
            continue;
        }

        let escape = *bytes.get(i).ok_or("trailing backslash")?;
        i += 1;
        let value = match escape {
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0C,
            b'v' => 0x0B,
            b'\\' | b'\'' | b'"' | b'?' => escape,
            b'0'..=b'7' => {
                let mut value = u32::from(escape - b'0');
                for _ in 0..2 {
                    match bytes.get(i) {
                        Some(&digit @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(digit - b'0');
                            i += 1;
                        }
                        _ => break,
                    }
                }
                u8::try_from(value).map_err(|_| "octal escape out of range")?
            }
            b'x' | b'X' => {
                let mut value = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    let Some(digit) = bytes.get(i).and_then(|b| char::from(*b).to_digit(16)) else {
                        break;
                    };
                    value = value * 16 + digit;
                    digits += 1;
                    i += 1;
                }
                if digits == 0 {
                    return Err("hex escape without digits");
                }
                u8::try_from(value).map_err(|_| "hex escape out of range")?
            }
            _ => return Err("unknown escape sequence"),
        };
        out.push(value);
    }
    Ok(out)
}
