use std::ptr::NonNull;

use crate::{
    block::{
        self, FIRST_BLOCK, Header, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, REGION_RESERVED, WORD_SIZE,
    },
    error::{HeapError, Result},
    kernel,
    utils::checked_align,
};

/// The single memory extent the heap lives in. It is requested from the
/// [`kernel`] once and never grows. This is how it looks like:
///
/// ```text
///  offset 0       4                                           end      end + 4
///  +-------------+------------+------------+-----+------------+--------+
///  | (alignment) |  Block 1   |  Block 2   | ... |  Block N   |   1    |
///  +-------------+------------+------------+-----+------------+--------+
///                 ^                                            ^
///                 FIRST_BLOCK                                  end marker
/// ```
///
/// Blocks are never stored anywhere else, they are implicitly linked by their
/// sizes: the header of the next block is always `offset + size` bytes away.
/// Nothing in here works with raw addresses except for the conversion to and
/// from the pointers handed to the caller, everything else is an offset from
/// the start of the mapping.
pub(crate) struct Region {
    /// Start of the mapping returned by the kernel.
    base: NonNull<u8>,
    /// Mapped length, always a multiple of the page size.
    length: usize,
}

/// A block that is being turned into a free block by
/// [`crate::Heap::release`]. It grows as neighbours are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeSpan {
    /// Header offset.
    pub offset: usize,
    /// Total size.
    pub size: usize,
    /// Whether the block before `offset` is allocated.
    pub prev_allocated: bool,
}

impl Region {
    /// Maps a new region able to hold at least `capacity` bytes and writes
    /// the initial block layout: one free block spanning everything plus the
    /// end marker.
    pub fn map(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(HeapError::InvalidCapacity);
        }

        let length = checked_align(capacity, kernel::page_size())
            .ok_or(HeapError::InvalidCapacity)?;

        // The whole usable area has to fit in a single header.
        if length - REGION_RESERVED > MAX_BLOCK_SIZE {
            return Err(HeapError::InvalidCapacity);
        }

        let base = unsafe { kernel::request_memory(length) }.ok_or_else(|| {
            log::error!("could not map {length} bytes for the heap region");
            HeapError::MapFailed { length }
        })?;

        let mut region = Self { base, length };
        let usable = region.capacity();

        // There's no real block before the first one, pretend it's allocated
        // so that we never try to coalesce backwards out of the region.
        region.set_header(FIRST_BLOCK, Header::new(usable, false, true));
        region.write_footer(FIRST_BLOCK, usable);
        region.set_header(region.end_offset(), Header::end());

        log::debug!(
            "mapped heap region at {:p}: {length} bytes, {usable} usable",
            base
        );

        Ok(region)
    }

    /// Usable bytes: everything except the alignment word and the end marker.
    /// This is what all the block sizes add up to.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.length - REGION_RESERVED
    }

    /// Offset of the end marker.
    #[inline]
    pub fn end_offset(&self) -> usize {
        FIRST_BLOCK + self.capacity()
    }

    /// Address of the byte at `offset`.
    #[inline]
    pub fn address_of(&self, offset: usize) -> usize {
        self.base.as_ptr().addr() + offset
    }

    /// Pointer to the payload of the block whose header is at `offset`.
    #[inline]
    pub fn payload_ptr(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.end_offset());
        unsafe { self.base.add(block::payload_offset(offset)) }
    }

    /// Translates a payload `address` given to us by the caller into the
    /// offset of its block header. Returns `None` if the address doesn't land
    /// in the part of the region where payloads can live. Comparisons are
    /// done on full width addresses.
    pub fn block_of(&self, address: usize) -> Option<usize> {
        let payload = address.checked_sub(self.base.as_ptr().addr())?;

        if payload < block::payload_offset(FIRST_BLOCK) || payload >= self.end_offset() {
            return None;
        }

        Some(block::header_offset(payload))
    }

    /// Reads the word at `offset`.
    ///
    /// Offsets come from block sizes stored in the region itself, so a client
    /// that scribbled over a header could send us anywhere. Out of bounds
    /// accesses panic rather than touching memory we don't own.
    #[inline]
    fn read_word(&self, offset: usize) -> u32 {
        assert!(
            offset % WORD_SIZE == 0 && offset + WORD_SIZE <= self.length,
            "heap corrupted: word access at offset {offset:#x} outside region"
        );

        unsafe { self.base.as_ptr().add(offset).cast::<u32>().read() }
    }

    #[inline]
    fn write_word(&mut self, offset: usize, value: u32) {
        assert!(
            offset % WORD_SIZE == 0 && offset + WORD_SIZE <= self.length,
            "heap corrupted: word access at offset {offset:#x} outside region"
        );

        unsafe { self.base.as_ptr().add(offset).cast::<u32>().write(value) }
    }

    #[inline]
    pub fn header(&self, offset: usize) -> Header {
        Header::from_raw(self.read_word(offset))
    }

    #[inline]
    pub fn set_header(&mut self, offset: usize, header: Header) {
        self.write_word(offset, header.raw());
    }

    /// Writes the footer of the free block at `offset`. When the block is the
    /// last one this is the word right before the end marker.
    #[inline]
    pub fn write_footer(&mut self, offset: usize, size: usize) {
        self.write_word(block::footer_offset(offset, size), block::footer(size));
    }

    /// Reads the footer of the block right before `offset`. Only meaningful
    /// when that block is free.
    #[inline]
    pub fn prev_footer(&self, offset: usize) -> usize {
        self.read_word(offset - WORD_SIZE) as usize
    }

    /// Updates the "previous is allocated" bit of the block at `offset`.
    /// The end marker is left alone.
    pub fn set_prev_allocated(&mut self, offset: usize, prev_allocated: bool) {
        let header = self.header(offset);

        if !header.is_end() {
            self.set_header(offset, header.with_prev_allocated(prev_allocated));
        }
    }

    /// Turns the free block at `offset` into an allocated block of `needed`
    /// bytes, splitting off the remainder as a new free block if there is one.
    ///
    /// ```text
    /// Before:
    /// +--------+------------------------------------------------+--------+
    /// | H size |                      free                      | F size |
    /// +--------+------------------------------------------------+--------+
    ///
    /// After:
    /// +----------+-----------------+--------+---------------------+--------+
    /// | H needed |    allocated    | H rest |        free         | F rest |
    /// +----------+-----------------+--------+---------------------+--------+
    /// ```
    pub fn split(&mut self, offset: usize, needed: usize) {
        let header = self.header(offset);
        let size = header.size();

        debug_assert!(header.is_free() && size >= needed);

        self.set_header(offset, Header::new(needed, true, header.prev_allocated()));

        if size == needed {
            // Old footer becomes payload. Successor now sits after an
            // allocated block.
            self.set_prev_allocated(offset + size, true);
            return;
        }

        let rest = offset + needed;
        let rest_size = size - needed;

        self.set_header(rest, Header::new(rest_size, false, true));
        self.write_footer(rest, rest_size);
        self.set_prev_allocated(rest + rest_size, false);

        log::trace!("split block at {offset:#x}: {needed} + {rest_size} bytes");
    }

    /// Tries to merge `span` with the block that follows it. This can be
    /// performed if that next block is free. Returns whether it did.
    pub fn merge_with_next(&mut self, span: &mut FreeSpan) -> bool {
        let next = self.header(span.offset + span.size);

        if !next.is_free() {
            return false;
        }

        log::trace!(
            "coalescing {:#x} with next block ({} bytes)",
            span.offset,
            next.size()
        );

        span.size += next.size();

        true
    }

    /// Tries to merge `span` with the block that precedes it. This can be
    /// performed if that previous block is free, in which case `span` now
    /// starts where the previous block started. Returns whether it did.
    ///
    /// The previous block is found through its footer, so a footer that
    /// doesn't point back at a matching free header is reported as
    /// [`HeapError::Corrupted`] and nothing is written.
    pub fn merge_with_prev(&self, span: &mut FreeSpan) -> Result<bool> {
        if span.prev_allocated {
            return Ok(false);
        }

        let bad_footer = HeapError::Corrupted {
            offset: span.offset,
            reason: "footer before block does not match a free block",
        };

        let prev_size = self.prev_footer(span.offset);

        let prev = span
            .offset
            .checked_sub(prev_size)
            .filter(|prev| *prev >= FIRST_BLOCK && prev_size >= MIN_BLOCK_SIZE)
            .ok_or(bad_footer)?;

        let header = self.header(prev);

        if !header.is_free() || header.size() != prev_size {
            return Err(bad_footer);
        }

        log::trace!(
            "coalescing {:#x} with previous block at {prev:#x} ({prev_size} bytes)",
            span.offset
        );

        span.offset = prev;
        span.size += prev_size;
        span.prev_allocated = header.prev_allocated();

        Ok(true)
    }

    /// Zeroes the word at `offset`. Used on the header of a block that was
    /// absorbed by its predecessor, so the stale header can't be taken for an
    /// allocated block later on.
    #[inline]
    pub fn erase(&mut self, offset: usize) {
        self.write_word(offset, 0);
    }

    /// Writes the boundary tags of `span` as a free block and lets its
    /// successor know its predecessor is now free.
    pub fn mark_free(&mut self, span: FreeSpan) {
        self.set_header(span.offset, Header::new(span.size, false, span.prev_allocated));
        self.write_footer(span.offset, span.size);
        self.set_prev_allocated(span.offset + span.size, false);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        log::debug!("returning heap region at {:p} to the kernel", self.base);
        unsafe { kernel::return_memory(self.base, self.length) }
    }
}
