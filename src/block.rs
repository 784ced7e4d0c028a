use std::{fmt, mem};

/// Size in bytes of a boundary tag. Headers and footers are a single 32 bit
/// word, not a machine word.
pub(crate) const WORD_SIZE: usize = mem::size_of::<u32>();

/// Every block size (and therefore every payload address) is a multiple of
/// this value. Double word alignment.
pub(crate) const ALIGNMENT: usize = 2 * WORD_SIZE;

/// Offset of the first block header inside the region. The first word is
/// skipped so that `header + WORD_SIZE` lands on an [`ALIGNMENT`] boundary.
pub(crate) const FIRST_BLOCK: usize = WORD_SIZE;

/// Bytes of the region that never belong to a block: the alignment word at
/// the front and the end marker at the back.
pub(crate) const REGION_RESERVED: usize = FIRST_BLOCK + WORD_SIZE;

/// Smallest block we can build. A free block needs room for its header and
/// its footer.
pub(crate) const MIN_BLOCK_SIZE: usize = ALIGNMENT;

/// Raw value of the pseudo block that terminates the block sequence.
pub(crate) const END_MARK: u32 = 1;

/// Bit 0: this block is allocated.
const ALLOCATED: u32 = 0b01;

/// Bit 1: the block right before this one is allocated.
const PREV_ALLOCATED: u32 = 0b10;

/// Mask for the size bits. Sizes are multiples of [`ALIGNMENT`] so the low
/// three bits are always free to store status.
const SIZE_MASK: u32 = !(ALIGNMENT as u32 - 1);

/// Largest size a header can describe.
pub(crate) const MAX_BLOCK_SIZE: usize = SIZE_MASK as usize;

/// Block header. This is the first word of every block and it packs the block
/// size together with two status bits:
///
/// ```text
///  31                                   3   2   1   0
/// +---------------------------------------+---+---+---+
/// |            size (multiple of 8)       | 0 | p | a |
/// +---------------------------------------+---+---+---+
///                                               |   |
///                 previous block allocated <----+   +----> this block allocated
/// ```
///
/// Some examples for a block of 24 bytes:
///
/// | state                        | header |
/// |------------------------------|--------|
/// | allocated, prev allocated    | 27     |
/// | allocated, prev free         | 25     |
/// | free, prev allocated         | 26     |
/// | free, prev free              | 24     |
///
/// Free blocks also carry a footer in their last word that stores the raw size
/// with no status bits, see [`footer`]. The footer is what lets us walk
/// backwards when coalescing with a free predecessor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header(u32);

impl Header {
    /// Builds a header from its parts. `size` must be a multiple of
    /// [`ALIGNMENT`] that fits in 32 bits.
    #[inline]
    pub fn new(size: usize, allocated: bool, prev_allocated: bool) -> Self {
        debug_assert_eq!(size % ALIGNMENT, 0);
        debug_assert!(size <= SIZE_MASK as usize);

        let mut raw = size as u32;
        if allocated {
            raw |= ALLOCATED;
        }
        if prev_allocated {
            raw |= PREV_ALLOCATED;
        }

        Self(raw)
    }

    /// The end marker pseudo block.
    #[inline]
    pub const fn end() -> Self {
        Self(END_MARK)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Total block size, header and padding included.
    #[inline]
    pub const fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    #[inline]
    pub const fn is_end(self) -> bool {
        self.0 == END_MARK
    }

    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        !self.is_end() && !self.is_allocated()
    }

    #[inline]
    pub const fn prev_allocated(self) -> bool {
        self.0 & PREV_ALLOCATED != 0
    }

    /// Bits that are neither size nor status. Always zero in a healthy heap.
    #[inline]
    pub const fn stray_bits(self) -> u32 {
        self.0 & !(SIZE_MASK | ALLOCATED | PREV_ALLOCATED)
    }

    #[inline]
    pub const fn with_prev_allocated(self, prev_allocated: bool) -> Self {
        if prev_allocated {
            Self(self.0 | PREV_ALLOCATED)
        } else {
            Self(self.0 & !PREV_ALLOCATED)
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end() {
            return f.write_str("Header(end)");
        }

        f.debug_struct("Header")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .field("prev_allocated", &self.prev_allocated())
            .finish()
    }
}

/// Raw footer value of a free block of `size` bytes.
#[inline]
pub(crate) fn footer(size: usize) -> u32 {
    debug_assert_eq!(size % ALIGNMENT, 0);
    size as u32
}

/// Offset of the footer of the block whose header lives at `offset`.
#[inline]
pub(crate) const fn footer_offset(offset: usize, size: usize) -> usize {
    offset + size - WORD_SIZE
}

/// Offset of the payload of the block whose header lives at `offset`. This is
/// the address handed to the caller.
#[inline]
pub(crate) const fn payload_offset(offset: usize) -> usize {
    offset + WORD_SIZE
}

/// Inverse of [`payload_offset`].
#[inline]
pub(crate) const fn header_offset(payload: usize) -> usize {
    payload - WORD_SIZE
}
