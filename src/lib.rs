//! Fixed capacity heap allocator with boundary tags and next-fit placement.
//!
//! A [`Heap`] gets a single region from the OS when it is initialized and
//! serves every [`Heap::allocate`] and [`Heap::release`] out of it, never
//! asking the OS for more. Every block starts with a one word header that
//! packs its size with two status bits, and free blocks repeat their size in
//! a footer:
//!
//! ```text
//!     allocated block                    free block
//! +----------------------+       +----------------------+
//! | size | p | a=1       |       | size | p | a=0       |
//! +----------------------+       +----------------------+
//! |                      |       |                      |
//! |       payload        |       |       (unused)       |
//! |                      |       |                      |
//! +----------------------+       +----------------------+
//!                                |         size         |
//!                                +----------------------+
//! ```
//!
//! ```rust
//! use tagheap::Heap;
//!
//! let mut heap = Heap::with_capacity(4096).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 8, 0);
//!
//! heap.release(ptr.as_ptr()).unwrap();
//! assert_eq!(heap.stats().free, heap.capacity());
//! ```
//!
//! The heap is single threaded and does no locking. It also can't protect
//! itself from clients that write past their payload.

mod block;
mod dump;
mod error;
mod heap;
mod kernel;
mod region;
mod utils;

pub use dump::{BlockInfo, Blocks, HeapStats};
pub use error::{HeapError, Result};
pub use heap::Heap;
