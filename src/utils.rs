//! Helper functions that don't particularly belong to any concrete module of
//! the heap.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`, which must be
/// a power of two.
///
/// This is used both to round region lengths up to a multiple of
/// [`crate::kernel::page_size`] and to round block sizes up to
/// [`crate::block::ALIGNMENT`].
#[inline]
pub fn align(to_be_aligned: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when the
/// result does not fit in a `usize`.
#[inline]
pub fn checked_align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    to_be_aligned
        .checked_add(alignment - 1)
        .map(|value| value & !(alignment - 1))
}
