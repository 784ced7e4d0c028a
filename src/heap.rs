use std::ptr::NonNull;

use crate::{
    block::{ALIGNMENT, FIRST_BLOCK, MIN_BLOCK_SIZE, WORD_SIZE},
    error::{HeapError, Result},
    region::{FreeSpan, Region},
    utils::align,
};

/// Fixed capacity heap over a single region obtained from the OS.
///
/// Blocks are kept in an implicit list: each one starts with a
/// [`crate::block::Header`] whose size tells where the next one begins, so
/// there is no separate free list to maintain. Placement uses next-fit, which
/// means the heap remembers where the last allocation ended and starts the
/// following scan from there instead of from the first block:
///
/// ```text
///            cursor
///              |
///              v
/// +-------+----------+------+------------+-------+------+-----+
/// | used  |   used   | free |    used    | free  | used | END |
/// +-------+----------+------+------------+-------+------+-----+
///              scan ------------------------------------> wrap
///   ----> until back at the cursor
/// ```
///
/// Freed blocks are coalesced with their free neighbours immediately, so two
/// free blocks are never adjacent.
///
/// The heap is meant for a single allocation stream. It is neither [`Sync`]
/// nor [`Send`] and doesn't lock anything.
pub struct Heap {
    /// Backing memory. `None` until [`Heap::init`] succeeds.
    region: Option<Region>,
    /// Header offset of the block where the next scan begins. Set lazily on
    /// the first allocation, always sits on a block boundary (possibly the
    /// end marker).
    cursor: Option<usize>,
}

impl Heap {
    /// Creates a heap with no memory behind it. Call [`Heap::init`] before
    /// anything else.
    pub const fn new() -> Self {
        Self {
            region: None,
            cursor: None,
        }
    }

    /// Shortcut for [`Heap::new`] followed by [`Heap::init`].
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut heap = Self::new();
        heap.init(capacity)?;

        Ok(heap)
    }

    /// Acquires the region from the OS and sets it up as one big free block.
    ///
    /// `capacity` is rounded up to a multiple of the page size. 8 of those
    /// bytes are reserved for alignment and the end marker, see
    /// [`Heap::capacity`].
    ///
    /// This can only succeed once per heap. Calling it again returns
    /// [`HeapError::AlreadyInitialized`] and doesn't touch anything.
    pub fn init(&mut self, capacity: usize) -> Result<()> {
        if self.region.is_some() {
            log::error!("heap region has already been allocated");
            return Err(HeapError::AlreadyInitialized);
        }

        self.region = Some(Region::map(capacity)?);
        self.cursor = None;

        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    /// Usable bytes in the heap, which is what all block sizes add up to.
    /// Zero before initialization.
    pub fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, Region::capacity)
    }

    /// Whether `ptr` points into the payload area of this heap.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region
            .as_ref()
            .is_some_and(|region| region.block_of(ptr.addr()).is_some())
    }

    pub(crate) fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    pub(crate) fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Allocates `size` bytes and returns a pointer to them. The pointer is
    /// always 8-byte aligned.
    ///
    /// The block needed is the payload plus its header rounded up to a double
    /// word. Free blocks are scanned in address order starting at the cursor
    /// and wrapping around once at the end marker. The first one that fits is
    /// used, and it's split in two if it's larger than needed.
    ///
    /// Fails without changing anything if `size` is zero or larger than the
    /// heap, or if a full lap finds no block big enough.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let Some(region) = self.region.as_mut() else {
            return Err(HeapError::Uninitialized);
        };

        if size == 0 {
            return Err(HeapError::InvalidSize { size });
        }

        let capacity = region.capacity();

        if size > capacity {
            return Err(HeapError::TooLarge { size, capacity });
        }

        // Header plus payload, padded to a double word.
        let needed = align(size + WORD_SIZE, ALIGNMENT);

        let start = self.cursor.unwrap_or(FIRST_BLOCK);

        let Some(offset) = next_fit(region, start, needed) else {
            log::warn!("no free block can hold {needed} bytes (requested {size})");
            return Err(HeapError::OutOfMemory { size });
        };

        region.split(offset, needed);

        // Next scan starts right after this block.
        self.cursor = Some(offset + needed);

        log::trace!("allocated {size} bytes in a {needed} byte block at {offset:#x}");

        Ok(region.payload_ptr(offset))
    }

    /// Releases a pointer returned by [`Heap::allocate`] and coalesces its
    /// block with any free neighbour.
    ///
    /// The pointer is checked in this order: it can't be null, it must be
    /// 8-byte aligned, it must point into the heap and its block must be
    /// currently allocated. The first failing check decides the error and
    /// nothing is modified. A free predecessor whose footer doesn't match its
    /// header is reported as [`HeapError::Corrupted`], also without changes.
    ///
    /// These checks can't tell a pointer we handed out from any other aligned
    /// address inside an allocated payload. Releasing such an address breaks
    /// the heap.
    pub fn release(&mut self, ptr: *mut u8) -> Result<()> {
        let result = self.try_release(ptr);

        if let Err(err) = result {
            log::warn!("rejected release of {ptr:p}: {err}");
        }

        result
    }

    fn try_release(&mut self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Err(HeapError::NullPointer);
        }

        let address = ptr.addr();

        if address % ALIGNMENT != 0 {
            return Err(HeapError::Misaligned { address });
        }

        // Nothing is inside a heap that has no region.
        let Some(region) = self.region.as_mut() else {
            return Err(HeapError::OutOfRange { address });
        };

        let offset = region
            .block_of(address)
            .ok_or(HeapError::OutOfRange { address })?;

        let header = region.header(offset);

        if !header.is_allocated()
            || header.size() < MIN_BLOCK_SIZE
            || offset + header.size() > region.end_offset()
        {
            return Err(HeapError::NotAllocated { address });
        }

        let mut span = FreeSpan {
            offset,
            size: header.size(),
            prev_allocated: header.prev_allocated(),
        };

        let next = offset + span.size;
        let merged_next = region.merge_with_next(&mut span);
        let merged_prev = region.merge_with_prev(&mut span)?;

        if merged_prev || (merged_next && self.cursor == Some(next)) {
            // Either the block under the cursor is gone or the released
            // block now starts elsewhere. Point at the merged block.
            self.cursor = Some(span.offset);
        }

        if merged_prev {
            // Now inside a free payload. Must not pass for allocated again.
            region.erase(offset);
        }

        region.mark_free(span);

        log::trace!(
            "released block at {offset:#x}, free block at {:#x} is now {} bytes",
            span.offset,
            span.size
        );

        Ok(())
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Next-fit scan. Walks blocks in address order from `start`, wrapping once
/// at the end marker, and returns the header offset of the first free block of
/// at least `needed` bytes. Gives up after covering the whole region.
fn next_fit(region: &Region, start: usize, needed: usize) -> Option<usize> {
    let mut offset = start;
    let mut scanned = 0;

    while scanned < region.capacity() {
        let header = region.header(offset);

        if header.is_end() {
            offset = FIRST_BLOCK;
            continue;
        }

        if header.size() < MIN_BLOCK_SIZE {
            log::warn!("zero sized block at {offset:#x}, heap is corrupted");
            return None;
        }

        if header.is_free() && header.size() >= needed {
            return Some(offset);
        }

        scanned += header.size();
        offset += header.size();
    }

    None
}
