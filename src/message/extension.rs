//! Per-message extension storage.

use crate::arena::{Arena, ArenaPtr};
use crate::error::ArenaError;
use crate::layout::ExtensionId;

/// Bytes reserved for one extension value, enough for any slot.
pub(crate) const SLOT_SIZE: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ExtensionEntry {
    pub(crate) number: u32,
    pub(crate) id: ExtensionId,
    /// A [`SLOT_SIZE`] slot laid out like a field at offset 0.
    pub(crate) slot: ArenaPtr,
}

/// Extensions present on one message, sorted by field number.
#[derive(Debug, Default)]
pub(crate) struct ExtensionSet {
    pub(crate) entries: Vec<ExtensionEntry>,
}

impl ExtensionSet {
    pub(crate) fn find(&self, number: u32) -> Option<&ExtensionEntry> {
        self.entries
            .binary_search_by_key(&number, |entry| entry.number)
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Slot of the extension, allocating a zeroed one on first use.
    ///
    /// Returns the slot and whether it was just created.
    pub(crate) fn get_or_insert(
        arena: &mut Arena,
        set_index: usize,
        number: u32,
        id: ExtensionId,
    ) -> Result<(ArenaPtr, bool), ArenaError> {
        let position = arena.extension_sets[set_index]
            .entries
            .binary_search_by_key(&number, |entry| entry.number);
        match position {
            Ok(index) => Ok((arena.extension_sets[set_index].entries[index].slot, false)),
            Err(index) => {
                let slot = arena.alloc(SLOT_SIZE, 8)?;
                arena.extension_sets[set_index]
                    .entries
                    .insert(index, ExtensionEntry { number, id, slot });
                Ok((slot, true))
            }
        }
    }

    pub(crate) fn remove(&mut self, number: u32) -> bool {
        match self
            .entries
            .binary_search_by_key(&number, |entry| entry.number)
        {
            Ok(index) => {
                self.entries.remove(index);
                true
            }
            Err(_) => false,
        }
    }
}
