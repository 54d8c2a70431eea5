//! Small helpers shared across the crate.

#[inline(always)]
#[cold]
fn cold_path() {}

/// "Annotation" to hint that a branch of an if-statement is likely to occur.
#[inline(always)]
pub(crate) fn likely(b: bool) -> bool {
    if b {
        true
    } else {
        cold_path();
        false
    }
}

/// "Annotation" to hint that a branch of an if-statement is _not likely_ to occur.
#[inline(always)]
pub(crate) fn unlikely(b: bool) -> bool {
    if b {
        cold_path();
        true
    } else {
        false
    }
}

/// Lossless widening conversions that `From` doesn't provide because they
/// depend on the target's pointer width.
pub(crate) trait CastFrom<T> {
    fn cast_from(from: T) -> Self;
}

// We only support 64-bit targets, offsets in the arena are packed into the
// lower 32 bits of a `u64` and message slots hold 8-byte pointers.
static_assertions::const_assert!(usize::BITS == 64);

impl CastFrom<u32> for usize {
    #[inline(always)]
    #[allow(clippy::as_conversions)]
    fn cast_from(from: u32) -> Self {
        from as usize
    }
}

impl CastFrom<u16> for usize {
    #[inline(always)]
    fn cast_from(from: u16) -> Self {
        usize::from(from)
    }
}

impl CastFrom<u8> for u32 {
    #[inline(always)]
    fn cast_from(from: u8) -> Self {
        u32::from(from)
    }
}

impl CastFrom<usize> for u64 {
    #[inline(always)]
    #[allow(clippy::as_conversions)]
    fn cast_from(from: usize) -> Self {
        from as u64
    }
}

impl CastFrom<u64> for usize {
    #[inline(always)]
    #[allow(clippy::as_conversions)]
    fn cast_from(from: u64) -> Self {
        from as usize
    }
}

/// The low 32 bits of a scalar slot value.
#[inline(always)]
#[allow(clippy::as_conversions)]
pub(crate) const fn low32(bits: u64) -> u32 {
    bits as u32
}

/// Round `value` up to the next multiple of `align`, which must be a power of two.
#[inline(always)]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
