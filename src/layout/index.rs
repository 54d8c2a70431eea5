//! Field-number lookup over a layout's sorted field table.

use super::{FieldEntry, MessageLayout};
use crate::util::{CastFrom, likely};

/// How many entries past the dense prefix are scanned linearly before
/// falling back to a binary search.
const LINEAR_SCAN: usize = 4;

impl MessageLayout {
    /// Find the entry for field `number`.
    #[inline]
    pub fn find_field(&self, number: u32) -> Option<&FieldEntry> {
        self.field_index(number).map(|index| &self.fields[index])
    }

    /// Position of field `number` within [`MessageLayout::fields`].
    #[inline]
    pub fn field_index(&self, number: u32) -> Option<usize> {
        let dense = usize::from(self.dense_below);
        let n = usize::cast_from(number);

        // Hot path, one indexed load.
        if likely(n >= 1 && n <= dense) {
            return Some(n - 1);
        }

        let last = self.fields.last()?;
        if number > last.number || n == 0 {
            return None;
        }

        let tail = &self.fields[dense..];
        for (i, field) in tail.iter().take(LINEAR_SCAN).enumerate() {
            if field.number == number {
                return Some(dense + i);
            }
            if field.number > number {
                return None;
            }
        }

        let rest = tail.get(LINEAR_SCAN..)?;
        rest.binary_search_by_key(&number, |field| field.number)
            .ok()
            .map(|i| dense + LINEAR_SCAN + i)
    }
}

/// Length of the prefix of `fields` numbered `1, 2, 3, ...`.
pub(crate) fn dense_prefix(fields: &[FieldEntry]) -> u16 {
    let count = fields
        .iter()
        .zip(1u32..)
        .take_while(|(field, expected)| field.number == *expected)
        .count();
    u16::try_from(count).unwrap_or(u16::MAX)
}
