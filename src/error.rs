use thiserror::Error;

/// Everything that can go wrong while talking to a [`crate::Heap`].
///
/// None of these are fatal. A failed call leaves the heap exactly as it was,
/// so the caller is free to retry with different arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("region capacity must be positive")]
    InvalidCapacity,

    #[error("heap has already been initialized")]
    AlreadyInitialized,

    #[error("heap has not been initialized")]
    Uninitialized,

    #[error("OS refused to map {length} bytes")]
    MapFailed { length: usize },

    #[error("requested size must be positive (got {size})")]
    InvalidSize { size: usize },

    #[error("requested size {size} exceeds heap capacity {capacity}")]
    TooLarge { size: usize, capacity: usize },

    #[error("no free block can hold {size} bytes")]
    OutOfMemory { size: usize },

    #[error("cannot release a null pointer")]
    NullPointer,

    #[error("pointer {address:#x} is not 8-byte aligned")]
    Misaligned { address: usize },

    #[error("pointer {address:#x} is outside the heap")]
    OutOfRange { address: usize },

    #[error("block at {address:#x} is not allocated")]
    NotAllocated { address: usize },

    #[error("heap corrupted at offset {offset:#x}: {reason}")]
    Corrupted { offset: usize, reason: &'static str },
}

/// Shorter syntax for results returned by the heap.
pub type Result<T> = core::result::Result<T, HeapError>;
