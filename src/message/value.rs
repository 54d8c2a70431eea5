//! Typed values read from and written to message slots.

use core::fmt;

use crate::arena::{Arena, ArenaPtr};
use crate::error::ArenaError;
use crate::layout::{CType, FieldType, LayoutSet, SubLayout};
use crate::message::Message;
use crate::util::CastFrom;

/// One field value, borrowed from the arena that holds it.
///
/// String and bytes payloads are handed out as raw bytes: a string field
/// decoded with lenient UTF-8 handling may hold invalid data, use
/// [`Value::as_str`] for a checked view.
#[derive(Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Enum(i32),
    String(&'a [u8]),
    Bytes(&'a [u8]),
    /// `None` for an unset sub-message.
    Message(Option<Message<'a>>),
}

impl<'a> Value<'a> {
    pub fn ctype(&self) -> CType {
        match self {
            Value::Bool(_) => CType::Bool,
            Value::I32(_) => CType::Int32,
            Value::I64(_) => CType::Int64,
            Value::U32(_) => CType::UInt32,
            Value::U64(_) => CType::UInt64,
            Value::F32(_) => CType::Float,
            Value::F64(_) => CType::Double,
            Value::Enum(_) => CType::Enum,
            Value::String(_) => CType::String,
            Value::Bytes(_) => CType::Bytes,
            Value::Message(_) => CType::Message,
        }
    }

    /// The zero value of a field type, what an unset field reads as.
    pub fn default_for(field_type: FieldType) -> Value<'static> {
        match field_type.ctype() {
            CType::Bool => Value::Bool(false),
            CType::Int32 => Value::I32(0),
            CType::Int64 => Value::I64(0),
            CType::UInt32 => Value::U32(0),
            CType::UInt64 => Value::U64(0),
            CType::Float => Value::F32(0.0),
            CType::Double => Value::F64(0.0),
            CType::Enum => Value::Enum(0),
            CType::String => Value::String(&[]),
            CType::Bytes => Value::Bytes(&[]),
            CType::Message => Value::Message(None),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// `int32`-like and enum values.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(value) | Value::Enum(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(value) => Some(*value),
            _ => None,
        }
    }

    /// A string value that holds valid UTF-8.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Value::String(bytes) => core::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Payload of a string or bytes value.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::String(bytes) | Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<Message<'a>> {
        match self {
            Value::Message(message) => *message,
            _ => None,
        }
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::I32(value) => write!(f, "I32({value})"),
            Value::I64(value) => write!(f, "I64({value})"),
            Value::U32(value) => write!(f, "U32({value})"),
            Value::U64(value) => write!(f, "U64({value})"),
            Value::F32(value) => write!(f, "F32({value})"),
            Value::F64(value) => write!(f, "F64({value})"),
            Value::Enum(value) => write!(f, "Enum({value})"),
            Value::String(bytes) => match core::str::from_utf8(bytes) {
                Ok(s) => write!(f, "String({s:?})"),
                Err(_) => write!(f, "String({bytes:?})"),
            },
            Value::Bytes(bytes) => write!(f, "Bytes({bytes:?})"),
            Value::Message(message) => f.debug_tuple("Message").field(message).finish(),
        }
    }
}

/// Read the value stored at `slot` for a field of `field_type`.
///
/// `sub` resolves the layout of message values, `arena_id` tags them.
pub(crate) fn read<'a>(
    arena: &'a Arena,
    slot: ArenaPtr,
    field_type: FieldType,
    set: &'a LayoutSet,
    sub: SubLayout,
) -> Value<'a> {
    match field_type {
        FieldType::Bool => Value::Bool(arena.read_u8(slot) != 0),
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => {
            Value::I32(arena.read_u32(slot).cast_signed())
        }
        FieldType::UInt32 | FieldType::Fixed32 => Value::U32(arena.read_u32(slot)),
        FieldType::Enum => Value::Enum(arena.read_u32(slot).cast_signed()),
        FieldType::Float => Value::F32(f32::from_bits(arena.read_u32(slot))),
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
            Value::I64(arena.read_u64(slot).cast_signed())
        }
        FieldType::UInt64 | FieldType::Fixed64 => Value::U64(arena.read_u64(slot)),
        FieldType::Double => Value::F64(f64::from_bits(arena.read_u64(slot))),
        FieldType::String => Value::String(read_bytes(arena, slot)),
        FieldType::Bytes => Value::Bytes(read_bytes(arena, slot)),
        FieldType::Message | FieldType::Group => {
            let message = match (ArenaPtr::from_raw(arena.read_u64(slot)), sub) {
                (Some(ptr), SubLayout::Message(id)) => {
                    Some(Message::from_parts(set.message(id), ptr, arena.id()))
                }
                _ => None,
            };
            Value::Message(message)
        }
    }
}

/// Payload of a string view slot.
pub(crate) fn read_bytes(arena: &Arena, slot: ArenaPtr) -> &[u8] {
    let len = usize::cast_from(arena.read_u64(slot.add(8)));
    match ArenaPtr::from_raw(arena.read_u64(slot)) {
        Some(ptr) if len > 0 => arena.bytes(ptr, len),
        _ => &[],
    }
}

/// Point a string view slot at `len` bytes starting at `ptr`.
pub(crate) fn write_view(arena: &mut Arena, slot: ArenaPtr, ptr: Option<ArenaPtr>, len: usize) {
    arena.write_u64(slot, ArenaPtr::to_raw(ptr));
    arena.write_u64(slot.add(8), u64::cast_from(len));
}

/// Store a scalar, string or bytes value, copying payloads into the arena.
///
/// The caller has already checked that `value` matches `field_type`.
/// Message values are handled by the callers because they need the
/// identity checks of the owning message.
pub(crate) fn write(
    arena: &mut Arena,
    slot: ArenaPtr,
    value: &Value<'_>,
) -> Result<(), ArenaError> {
    match *value {
        Value::Bool(value) => arena.write_u8(slot, u8::from(value)),
        Value::I32(value) | Value::Enum(value) => arena.write_u32(slot, value.cast_unsigned()),
        Value::U32(value) => arena.write_u32(slot, value),
        Value::F32(value) => arena.write_u32(slot, value.to_bits()),
        Value::I64(value) => arena.write_u64(slot, value.cast_unsigned()),
        Value::U64(value) => arena.write_u64(slot, value),
        Value::F64(value) => arena.write_u64(slot, value.to_bits()),
        Value::String(bytes) | Value::Bytes(bytes) => {
            let ptr = arena.copy_in(bytes)?;
            write_view(arena, slot, ptr, bytes.len());
        }
        Value::Message(message) => {
            arena.write_u64(slot, ArenaPtr::to_raw(message.map(|message| message.ptr())));
        }
    }
    Ok(())
}

/// Whether the slot holds the zero value of its type, the "absent" state of
/// implicit-presence fields. Floats compare bitwise, so `-0.0` is present.
pub(crate) fn is_zero(arena: &Arena, slot: ArenaPtr, field_type: FieldType) -> bool {
    match field_type.rep().size() {
        1 => arena.read_u8(slot) == 0,
        4 => arena.read_u32(slot) == 0,
        8 => arena.read_u64(slot) == 0,
        // String views are empty when their length is.
        _ => arena.read_u64(slot.add(8)) == 0,
    }
}
