//! Bump allocator that owns every message, array, string and side table
//! produced while decoding or mutating messages.
//!
//! Memory is handed out from a chain of zeroed blocks and is only released
//! when the whole [`Arena`] is dropped or [`Arena::reset`]. Allocations are
//! addressed with [`ArenaPtr`] handles instead of raw pointers, all reads and
//! writes go through the arena so a handle can never outlive its memory.

use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;

use crate::error::ArenaError;
use crate::message::extension::ExtensionSet;
use crate::message::map::MapStorage;
use crate::util::{CastFrom, align_up};

/// Largest single block we can address, offsets are packed into 32 bits.
const MAX_BLOCK_LEN: usize = u32::MAX as usize;

/// Marks handles into input buffers registered with [`Arena::alias_input`].
const ALIAS_BIT: u64 = 1 << 63;

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(1);

fn next_arena_id() -> u32 {
    NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed)
}

/// Tuning knobs for an [`Arena`].
#[derive(Debug, Clone)]
pub struct ArenaOptions {
    /// Size of the first block.
    pub(crate) initial_block_size: usize,
    /// Blocks double in size until they reach this size, after that every
    /// new block has exactly this size.
    pub(crate) max_block_size: usize,
    /// Hard ceiling on the total bytes of all blocks.
    pub(crate) limit: Option<usize>,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            initial_block_size: 256,
            max_block_size: 64 * 1024,
            limit: None,
        }
    }
}

impl ArenaOptions {
    /// Create a new ArenaOptions with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size of the first block.
    pub fn initial_block_size(&mut self, size: usize) -> &mut Self {
        self.initial_block_size = size.max(8);
        self
    }

    /// Set the size at which blocks stop doubling.
    pub fn max_block_size(&mut self, size: usize) -> &mut Self {
        self.max_block_size = size.clamp(8, MAX_BLOCK_LEN);
        self
    }

    /// Fail allocations once the arena would hold more than `bytes` in total.
    pub fn limit(&mut self, bytes: usize) -> &mut Self {
        self.limit = Some(bytes);
        self
    }
}

/// Handle to memory owned by an [`Arena`].
///
/// Encodes a block index and a byte offset, a handle is only meaningful for
/// the arena that produced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ArenaPtr(NonZeroU64);

static_assertions::assert_eq_size!(ArenaPtr, Option<ArenaPtr>, u64);

#[allow(clippy::as_conversions)]
impl ArenaPtr {
    fn new(block: usize, offset: usize) -> Self {
        debug_assert!(offset <= MAX_BLOCK_LEN);
        let raw = ((block as u64 + 1) << 32) | offset as u64;
        // `block + 1` is never zero.
        ArenaPtr(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    fn aliased(index: usize) -> Self {
        let raw = ALIAS_BIT | ((index as u64 + 1) << 32);
        ArenaPtr(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Rebuild a handle from the value stored in a message slot, `0` means
    /// "no allocation".
    #[inline(always)]
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(ArenaPtr)
    }

    /// The value written into a message slot for an optional handle.
    #[inline(always)]
    pub(crate) fn to_raw(ptr: Option<ArenaPtr>) -> u64 {
        ptr.map_or(0, |ptr| ptr.0.get())
    }

    #[inline(always)]
    fn block(self) -> usize {
        (((self.0.get() & !ALIAS_BIT) >> 32) - 1) as usize
    }

    #[inline(always)]
    fn offset(self) -> usize {
        (self.0.get() & 0xFFFF_FFFF) as usize
    }

    #[inline(always)]
    fn is_aliased(self) -> bool {
        self.0.get() & ALIAS_BIT != 0
    }

    /// A handle `bytes` further into the same allocation.
    #[inline(always)]
    pub fn add(self, bytes: usize) -> Self {
        debug_assert!(self.offset() + bytes <= MAX_BLOCK_LEN);
        ArenaPtr(self.0.saturating_add(u64::cast_from(bytes)))
    }
}

impl core::fmt::Debug for ArenaPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArenaPtr")
            .field("block", &self.block())
            .field("offset", &self.offset())
            .field("aliased", &self.is_aliased())
            .finish()
    }
}

#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    used: usize,
}

/// Region allocator whose allocations are freed en masse.
///
/// Besides raw bytes the arena owns the side tables of the messages that
/// live in it (map storage and extension sets) and any input buffers that
/// decoded strings alias.
#[derive(Debug)]
pub struct Arena {
    id: u32,
    options: ArenaOptions,
    blocks: Vec<Block>,
    next_block_size: usize,
    allocated: usize,
    /// The most recent allocation, the only one [`Arena::shrink_last`] can
    /// touch.
    last: Option<(ArenaPtr, usize)>,
    aliased: Vec<Bytes>,
    pub(crate) maps: Vec<MapStorage>,
    pub(crate) extension_sets: Vec<ExtensionSet>,
}

impl Default for Arena {
    fn default() -> Self {
        Arena::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Arena::with_options(&ArenaOptions::default())
    }

    pub fn with_options(options: &ArenaOptions) -> Self {
        Arena {
            id: next_arena_id(),
            options: options.clone(),
            blocks: Vec::new(),
            next_block_size: options.initial_block_size,
            allocated: 0,
            last: None,
            aliased: Vec::new(),
            maps: Vec::new(),
            extension_sets: Vec::new(),
        }
    }

    /// Identity of this arena generation, changes on [`Arena::reset`].
    #[inline(always)]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Total bytes held in blocks, used or not.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Number of blocks currently chained.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Allocate `size` zeroed bytes whose offset is a multiple of `align`.
    ///
    /// An allocation that doesn't fit in the remainder of the current block
    /// is placed at the start of a fresh block.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<ArenaPtr, ArenaError> {
        debug_assert!(align.is_power_of_two() && align <= 8);

        let fits = self
            .blocks
            .last()
            .is_some_and(|block| align_up(block.used, align) + size <= block.data.len());
        if !fits {
            self.push_block(size)?;
        }

        let index = self.blocks.len() - 1;
        let block = &mut self.blocks[index];
        let offset = align_up(block.used, align);
        block.used = offset + size;

        let ptr = ArenaPtr::new(index, offset);
        self.last = Some((ptr, size));
        Ok(ptr)
    }

    fn push_block(&mut self, min_size: usize) -> Result<(), ArenaError> {
        let oom = ArenaError::OutOfMemory { requested: min_size };
        if min_size > MAX_BLOCK_LEN {
            return Err(oom);
        }

        let mut size = self.next_block_size.max(min_size);
        if let Some(limit) = self.options.limit {
            if self.allocated + size > limit {
                // Fall back to exactly what this allocation needs.
                size = min_size;
                if self.allocated + size > limit {
                    return Err(oom);
                }
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| oom)?;
        data.resize(size, 0);

        self.allocated += size;
        self.blocks.push(Block { data, used: 0 });
        self.next_block_size = (self.next_block_size * 2).min(self.options.max_block_size);

        tracing::debug!(
            arena = self.id,
            block_size = size,
            total = self.allocated,
            "arena grew"
        );
        Ok(())
    }

    /// Return the tail of the most recent allocation to the arena.
    ///
    /// Returns `false` (and does nothing) if `ptr` isn't the most recent
    /// allocation or `new_size` is larger than its current size.
    pub fn shrink_last(&mut self, ptr: ArenaPtr, new_size: usize) -> bool {
        match self.last {
            Some((last, size)) if last == ptr && new_size <= size => {
                let block = &mut self.blocks[ptr.block()];
                let start = ptr.offset() + new_size;
                block.data[start..block.used].fill(0);
                block.used = start;
                self.last = Some((ptr, new_size));
                true
            }
            _ => false,
        }
    }

    /// Drop every allocation while keeping the largest block for reuse.
    ///
    /// Handles created before the reset are invalidated, using one with this
    /// arena afterwards is reported as a foreign value.
    pub fn reset(&mut self) {
        let largest = self
            .blocks
            .iter()
            .enumerate()
            .max_by_key(|(_, block)| block.data.len())
            .map(|(index, _)| index);
        if let Some(index) = largest {
            let mut block = self.blocks.swap_remove(index);
            block.data[..block.used].fill(0);
            block.used = 0;
            self.blocks.clear();
            self.allocated = block.data.len();
            self.blocks.push(block);
        }

        self.last = None;
        self.aliased.clear();
        self.maps.clear();
        self.extension_sets.clear();
        self.id = next_arena_id();
    }

    /// Borrow `len` bytes starting at `ptr`.
    ///
    /// # Panics
    ///
    /// If `ptr` was not produced by this arena or the range runs past its
    /// allocation.
    #[inline]
    pub fn bytes(&self, ptr: ArenaPtr, len: usize) -> &[u8] {
        let start = ptr.offset();
        if ptr.is_aliased() {
            &self.aliased[ptr.block()][start..start + len]
        } else {
            &self.blocks[ptr.block()].data[start..start + len]
        }
    }

    /// Mutably borrow `len` bytes starting at `ptr`.
    ///
    /// # Panics
    ///
    /// Same conditions as [`Arena::bytes`], and aliased input is read-only.
    #[inline]
    pub fn bytes_mut(&mut self, ptr: ArenaPtr, len: usize) -> &mut [u8] {
        assert!(!ptr.is_aliased(), "aliased input is read-only");
        let start = ptr.offset();
        &mut self.blocks[ptr.block()].data[start..start + len]
    }

    #[inline(always)]
    fn array<const N: usize>(&self, ptr: ArenaPtr) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(ptr, N));
        out
    }

    #[inline(always)]
    pub(crate) fn read_u8(&self, ptr: ArenaPtr) -> u8 {
        self.bytes(ptr, 1)[0]
    }

    #[inline(always)]
    pub(crate) fn read_u32(&self, ptr: ArenaPtr) -> u32 {
        u32::from_le_bytes(self.array(ptr))
    }

    #[inline(always)]
    pub(crate) fn read_u64(&self, ptr: ArenaPtr) -> u64 {
        u64::from_le_bytes(self.array(ptr))
    }

    #[inline(always)]
    pub(crate) fn write_u8(&mut self, ptr: ArenaPtr, value: u8) {
        self.bytes_mut(ptr, 1)[0] = value;
    }

    #[inline(always)]
    pub(crate) fn write_u32(&mut self, ptr: ArenaPtr, value: u32) {
        self.bytes_mut(ptr, 4).copy_from_slice(&value.to_le_bytes());
    }

    #[inline(always)]
    pub(crate) fn write_u64(&mut self, ptr: ArenaPtr, value: u64) {
        self.bytes_mut(ptr, 8).copy_from_slice(&value.to_le_bytes());
    }

    /// Copy `src` into a fresh allocation, empty input allocates nothing.
    pub(crate) fn copy_in(&mut self, src: &[u8]) -> Result<Option<ArenaPtr>, ArenaError> {
        if src.is_empty() {
            return Ok(None);
        }
        let ptr = self.alloc(src.len(), 1)?;
        self.bytes_mut(ptr, src.len()).copy_from_slice(src);
        Ok(Some(ptr))
    }

    /// Copy `len` bytes between two allocations of this arena.
    pub(crate) fn copy_within(&mut self, src: ArenaPtr, dst: ArenaPtr, len: usize) {
        if len == 0 {
            return;
        }
        let (from, to) = (src.offset(), dst.offset());
        if src.is_aliased() {
            let data = &self.aliased[src.block()][from..from + len];
            self.blocks[dst.block()].data[to..to + len].copy_from_slice(data);
        } else if src.block() == dst.block() {
            self.blocks[src.block()]
                .data
                .copy_within(from..from + len, to);
        } else {
            let (src_block, dst_block) = (src.block(), dst.block());
            let (low, high) = self.blocks.split_at_mut(src_block.max(dst_block));
            let (src_data, dst_data) = if src_block < dst_block {
                (&low[src_block].data, &mut high[0].data)
            } else {
                (&high[0].data, &mut low[dst_block].data)
            };
            dst_data[to..to + len].copy_from_slice(&src_data[from..from + len]);
        }
    }

    /// Resize a growable region, keeping its first `len` bytes.
    ///
    /// The most recent allocation grows in place when its block has room,
    /// anything else is moved to a new allocation.
    pub(crate) fn grow(
        &mut self,
        ptr: Option<ArenaPtr>,
        len: usize,
        old_capacity: usize,
        new_capacity: usize,
        align: usize,
    ) -> Result<ArenaPtr, ArenaError> {
        debug_assert!(new_capacity >= old_capacity && old_capacity >= len);
        if let (Some(ptr), Some((last, size))) = (ptr, self.last) {
            let block = &mut self.blocks[ptr.block()];
            let end = ptr.offset() + new_capacity;
            if last == ptr && size == old_capacity && end <= block.data.len() {
                block.used = end;
                self.last = Some((ptr, new_capacity));
                return Ok(ptr);
            }
        }

        let fresh = self.alloc(new_capacity, align)?;
        if let Some(ptr) = ptr {
            self.copy_within(ptr, fresh, len);
        }
        Ok(fresh)
    }

    /// Register an input buffer so decoded strings can point into it.
    ///
    /// Returns `None` if the buffer is too large to be addressed, callers
    /// then copy instead.
    pub(crate) fn alias_input(&mut self, input: Bytes) -> Option<ArenaPtr> {
        if input.len() > MAX_BLOCK_LEN {
            return None;
        }
        self.aliased.push(input);
        Some(ArenaPtr::aliased(self.aliased.len() - 1))
    }
}
