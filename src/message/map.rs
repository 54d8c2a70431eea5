//! Map fields.
//!
//! A map field's slot holds `index + 1` of a [`MapStorage`] in the arena's
//! side tables. Every entry is a full instance of the map-entry layout, so
//! values of any type (including sub-messages) live where the rest of the
//! message data does.

use indexmap::IndexMap;

use crate::arena::{Arena, ArenaPtr};
use crate::error::ArenaError;
use crate::layout::CType;
use crate::message::Value;
use crate::util::CastFrom;

/// Owned copy of a map key.
///
/// Ordering follows the deterministic encoding: numbers by value, strings
/// bytewise, `false` before `true`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKey {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    String(Box<[u8]>),
}

impl MapKey {
    /// Key from a value of an integral or string type.
    pub fn from_value(value: &Value<'_>) -> Option<MapKey> {
        let key = match *value {
            Value::Bool(value) => MapKey::Bool(value),
            Value::I32(value) => MapKey::I32(value),
            Value::I64(value) => MapKey::I64(value),
            Value::U32(value) => MapKey::U32(value),
            Value::U64(value) => MapKey::U64(value),
            Value::String(bytes) => MapKey::String(bytes.into()),
            _ => return None,
        };
        Some(key)
    }

    pub fn as_value(&self) -> Value<'_> {
        match self {
            MapKey::Bool(value) => Value::Bool(*value),
            MapKey::I32(value) => Value::I32(*value),
            MapKey::I64(value) => Value::I64(*value),
            MapKey::U32(value) => Value::U32(*value),
            MapKey::U64(value) => Value::U64(*value),
            MapKey::String(bytes) => Value::String(bytes),
        }
    }

    pub fn ctype(&self) -> CType {
        self.as_value().ctype()
    }
}

impl From<&str> for MapKey {
    fn from(value: &str) -> Self {
        MapKey::String(value.as_bytes().into())
    }
}

macro_rules! map_key_from {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<$ty> for MapKey {
                fn from(value: $ty) -> Self {
                    MapKey::$variant(value)
                }
            }
        )*
    };
}

map_key_from!(bool => Bool, i32 => I32, i64 => I64, u32 => U32, u64 => U64);

/// Entries of one map field, in insertion order.
#[derive(Debug, Default)]
pub(crate) struct MapStorage {
    /// Each value is a map-entry instance.
    pub(crate) entries: IndexMap<MapKey, ArenaPtr>,
}

/// The storage a map slot points at, if any.
pub(crate) fn storage(arena: &Arena, slot: ArenaPtr) -> Option<&MapStorage> {
    let raw = arena.read_u64(slot);
    let index = usize::cast_from(raw.checked_sub(1)?);
    arena.maps.get(index)
}

/// Index of the storage a map slot points at, allocating it if needed.
pub(crate) fn storage_index(arena: &mut Arena, slot: ArenaPtr) -> Result<usize, ArenaError> {
    match arena.read_u64(slot).checked_sub(1) {
        Some(index) => Ok(usize::cast_from(index)),
        None => {
            arena.maps.push(MapStorage::default());
            let index = arena.maps.len() - 1;
            arena.write_u64(slot, u64::cast_from(index + 1));
            Ok(index)
        }
    }
}
