use crate::util::CastFrom;

/// Value set of a closed enum.
///
/// Values `0..64` are tested with a single mask, everything else with a
/// binary search. Values are ordered as unsigned integers, the order the
/// compact encoding lists them in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnumLayout {
    mask: u64,
    others: Box<[u32]>,
}

impl EnumLayout {
    pub fn from_values<I: IntoIterator<Item = i32>>(values: I) -> Self {
        let mut mask = 0u64;
        let mut others = Vec::new();
        for value in values {
            let raw = value.cast_unsigned();
            if raw < 64 {
                mask |= 1 << raw;
            } else {
                others.push(raw);
            }
        }
        others.sort_unstable();
        others.dedup();
        EnumLayout {
            mask,
            others: others.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn contains(&self, value: i32) -> bool {
        let raw = value.cast_unsigned();
        if raw < 64 {
            self.mask & (1 << raw) != 0
        } else {
            self.others.binary_search(&raw).is_ok()
        }
    }

    /// All values in ascending unsigned order.
    pub fn values(&self) -> impl Iterator<Item = i32> + '_ {
        let mask = self.mask;
        (0..64u32)
            .filter(move |bit| mask & (1 << bit) != 0)
            .chain(self.others.iter().copied())
            .map(u32::cast_signed)
    }

    pub fn len(&self) -> usize {
        usize::cast_from(self.mask.count_ones()) + self.others.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
