//! Backing storage of repeated fields.
//!
//! A repeated field's slot holds a pointer to a 16 byte header: the data
//! pointer, then the length and capacity as `u32`s. Elements are stored
//! back to back with the size of the field type's representation.

use crate::arena::{Arena, ArenaPtr};
use crate::error::ArenaError;
use crate::util::CastFrom;

pub(crate) const HEADER_SIZE: usize = 16;
const MIN_CAPACITY: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RawArray {
    header: ArenaPtr,
    element_size: usize,
}

impl RawArray {
    /// The array a slot points at, if one was ever allocated.
    pub(crate) fn get(arena: &Arena, slot: ArenaPtr, element_size: usize) -> Option<RawArray> {
        ArenaPtr::from_raw(arena.read_u64(slot)).map(|header| RawArray {
            header,
            element_size,
        })
    }

    pub(crate) fn get_or_create(
        arena: &mut Arena,
        slot: ArenaPtr,
        element_size: usize,
    ) -> Result<RawArray, ArenaError> {
        if let Some(array) = RawArray::get(arena, slot, element_size) {
            return Ok(array);
        }
        let header = arena.alloc(HEADER_SIZE, 8)?;
        arena.write_u64(slot, ArenaPtr::to_raw(Some(header)));
        Ok(RawArray {
            header,
            element_size,
        })
    }

    pub(crate) fn len(&self, arena: &Arena) -> usize {
        usize::cast_from(arena.read_u32(self.header.add(8)))
    }

    fn capacity(&self, arena: &Arena) -> usize {
        usize::cast_from(arena.read_u32(self.header.add(12)))
    }

    fn data(&self, arena: &Arena) -> Option<ArenaPtr> {
        ArenaPtr::from_raw(arena.read_u64(self.header))
    }

    /// Pointer to element `index`, which must be below the length.
    pub(crate) fn element(&self, arena: &Arena, index: usize) -> ArenaPtr {
        debug_assert!(index < self.len(arena));
        match self.data(arena) {
            Some(data) => data.add(index * self.element_size),
            None => unreachable!("non-empty array without data"),
        }
    }

    /// Truncate, or extend with zeroed elements.
    pub(crate) fn set_len(&self, arena: &mut Arena, len: usize) -> Result<(), ArenaError> {
        let old = self.len(arena);
        if len > old {
            self.reserve(arena, len - old)?;
            if let Some(data) = self.data(arena) {
                let start = data.add(old * self.element_size);
                arena.bytes_mut(start, (len - old) * self.element_size).fill(0);
            }
        }
        let raw = u32::try_from(len).map_err(|_| ArenaError::OutOfMemory {
            requested: len * self.element_size,
        })?;
        arena.write_u32(self.header.add(8), raw);
        Ok(())
    }

    pub(crate) fn reserve(&self, arena: &mut Arena, additional: usize) -> Result<(), ArenaError> {
        let len = self.len(arena);
        let capacity = self.capacity(arena);
        let needed = len + additional;
        if needed <= capacity {
            return Ok(());
        }

        let new_capacity = needed.max(capacity * 2).max(MIN_CAPACITY);
        let oom = ArenaError::OutOfMemory {
            requested: new_capacity * self.element_size,
        };
        let raw_capacity = u32::try_from(new_capacity).map_err(|_| oom)?;
        let data = arena.grow(
            self.data(arena),
            len * self.element_size,
            capacity * self.element_size,
            new_capacity * self.element_size,
            8,
        )?;
        arena.write_u64(self.header, ArenaPtr::to_raw(Some(data)));
        arena.write_u32(self.header.add(12), raw_capacity);
        Ok(())
    }

    /// Append one zeroed element and return a pointer to it.
    pub(crate) fn push(&self, arena: &mut Arena) -> Result<ArenaPtr, ArenaError> {
        let len = self.len(arena);
        self.set_len(arena, len + 1)?;
        Ok(self.element(arena, len))
    }

    /// Raw bytes of every element.
    pub(crate) fn as_bytes<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        match self.data(arena) {
            Some(data) => arena.bytes(data, self.len(arena) * self.element_size),
            None => &[],
        }
    }
}
