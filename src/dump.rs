//! Read-only views of the heap: iterating its blocks, adding up totals,
//! printing the block list and checking that the boundary tags are consistent.
//! Nothing in here mutates the heap.

use std::{
    collections::HashSet,
    fmt,
    io::{self, Write},
};

use crate::{
    block::{FIRST_BLOCK, MIN_BLOCK_SIZE},
    error::{HeapError, Result},
    heap::Heap,
    region::Region,
};

/// One block as seen by [`Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Position in address order, starting at 1.
    pub index: usize,
    /// Address of the header, which is the first byte of the block.
    pub address: usize,
    /// Total size, header and padding included.
    pub size: usize,
    pub allocated: bool,
    pub prev_allocated: bool,
}

impl BlockInfo {
    /// Address of the last byte of the block.
    #[inline]
    pub fn end_address(&self) -> usize {
        self.address + self.size - 1
    }

    /// Address handed to the caller for this block.
    #[inline]
    pub fn payload_address(&self) -> usize {
        crate::block::payload_offset(self.address)
    }
}

/// Totals over every block in the heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub used: usize,
    pub free: usize,
    pub blocks: usize,
    pub free_blocks: usize,
}

impl HeapStats {
    /// Always equals [`Heap::capacity`] on a healthy heap.
    #[inline]
    pub fn total(&self) -> usize {
        self.used + self.free
    }
}

/// Iterator over the blocks of a heap in address order. See [`Heap::blocks`].
pub struct Blocks<'a> {
    region: Option<&'a Region>,
    offset: usize,
    index: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.region?;
        let header = region.header(self.offset);

        // Stop at the end marker, or at anything that doesn't look like a
        // block so that a corrupted heap can still be printed.
        if header.is_end()
            || header.size() < MIN_BLOCK_SIZE
            || self.offset + header.size() > region.end_offset()
        {
            self.region = None;
            return None;
        }

        self.index += 1;

        let info = BlockInfo {
            index: self.index,
            address: region.address_of(self.offset),
            size: header.size(),
            allocated: header.is_allocated(),
            prev_allocated: header.prev_allocated(),
        };

        self.offset += header.size();

        Some(info)
    }
}

fn status(allocated: bool) -> &'static str {
    if allocated { "used" } else { "Free" }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{:#010x}\t{:#010x}\t{}",
            self.index,
            status(self.allocated),
            status(self.prev_allocated),
            self.address,
            self.end_address(),
            self.size
        )
    }
}

const STARS: &str = "*********************************************************************************";
const DASHES: &str = "---------------------------------------------------------------------------------";

impl Heap {
    /// Walks all blocks from the first one to the end marker. Empty if the
    /// heap has not been initialized.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            region: self.region(),
            offset: FIRST_BLOCK,
            index: 0,
        }
    }

    /// Adds up used and free bytes over all blocks.
    pub fn stats(&self) -> HeapStats {
        self.blocks().fold(HeapStats::default(), |mut stats, block| {
            stats.blocks += 1;

            if block.allocated {
                stats.used += block.size;
            } else {
                stats.free += block.size;
                stats.free_blocks += 1;
            }

            stats
        })
    }

    /// Writes the block list to `out`. One line per block with its number,
    /// its status, the status of the block before it, the first and last
    /// byte addresses and the size, followed by the totals.
    pub fn dump<W: Write>(&self, mut out: W) -> io::Result<()> {
        writeln!(out, "{STARS}")?;
        writeln!(out, "Block list")?;
        writeln!(out, "No.\tStatus\tPrev\tt_Begin\t\tt_End\t\tt_Size")?;
        writeln!(out, "{DASHES}")?;

        let mut stats = HeapStats::default();

        for block in self.blocks() {
            writeln!(out, "{block}")?;

            if block.allocated {
                stats.used += block.size;
            } else {
                stats.free += block.size;
            }
        }

        writeln!(out, "{DASHES}")?;
        writeln!(out, "{STARS}")?;
        writeln!(out, "Total used size = {}", stats.used)?;
        writeln!(out, "Total free size = {}", stats.free)?;
        writeln!(out, "Total size = {}", stats.total())?;
        writeln!(out, "{STARS}")?;

        out.flush()
    }

    /// [`Heap::dump`] to standard output.
    pub fn print(&self) -> io::Result<()> {
        self.dump(io::stdout().lock())
    }

    /// Walks the heap and verifies every boundary tag:
    ///
    /// - Blocks are at least [`MIN_BLOCK_SIZE`] and sizes are multiples of 8.
    /// - Sizes add up to the capacity and the walk ends on the end marker.
    /// - No two free blocks are adjacent.
    /// - Every free block's footer matches its header.
    /// - Every "previous is allocated" bit tells the truth. The first block
    ///   always claims an allocated predecessor.
    /// - The next-fit cursor sits on a block boundary.
    ///
    /// Returns the first violation found.
    pub fn check(&self) -> Result<()> {
        let region = self.region().ok_or(HeapError::Uninitialized)?;
        let end = region.end_offset();

        let corrupted = |offset: usize, reason: &'static str| -> Result<()> {
            Err(HeapError::Corrupted { offset, reason })
        };

        let mut offset = FIRST_BLOCK;
        let mut prev_allocated = true;
        let mut boundaries = HashSet::new();

        while offset < end {
            let header = region.header(offset);

            if header.is_end() {
                return corrupted(offset, "end marker before end of region");
            }
            if header.stray_bits() != 0 {
                return corrupted(offset, "size is not a multiple of 8");
            }
            if header.size() < MIN_BLOCK_SIZE {
                return corrupted(offset, "block smaller than minimum size");
            }
            if offset + header.size() > end {
                return corrupted(offset, "block runs past end marker");
            }
            if header.prev_allocated() != prev_allocated {
                return corrupted(offset, "stale previous-allocated bit");
            }
            if header.is_free() {
                if !prev_allocated {
                    return corrupted(offset, "adjacent free blocks");
                }
                if region.prev_footer(offset + header.size()) != header.size() {
                    return corrupted(offset, "footer does not match header");
                }
            }

            boundaries.insert(offset);
            prev_allocated = header.is_allocated();
            offset += header.size();
        }

        if !region.header(end).is_end() {
            return corrupted(end, "missing end marker");
        }

        match self.cursor() {
            Some(cursor) if cursor != end && !boundaries.contains(&cursor) => {
                corrupted(cursor, "cursor is not on a block boundary")
            }
            _ => Ok(()),
        }
    }
}
