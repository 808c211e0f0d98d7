//! Fixed capacity memory allocator built on the binary buddy system. One
//! contiguous arena is acquired up front and never grows. Allocation requests
//! are rounded up to a power of two and served by recursively halving bigger
//! blocks, releases merge freed blocks with their buddy as far up as
//! possible:
//!
//! ```text
//!                 +-----------------------------------------------+
//! Initial state   |                  1024 (free)                  |
//!                 +-----------------------------------------------+
//!
//!                 +-----------------------+-----------------------+
//! allocate(512)   |      512 (alloc)      |      512 (free)       |
//!                 +-----------------------+-----------------------+
//!
//!                 +-----------------------+-----------+-----------+
//! allocate(256)   |      512 (alloc)      | 256 alloc | 256 free  |
//!                 +-----------------------+-----------+-----------+
//!
//!                 +-----------------------+-----------+-----------+
//! deallocate both |                  1024 (free)                  |
//!                 +-----------------------+-----------+-----------+
//! ```
//!
//! Internal bookkeeping never stores references into the arena. Free blocks
//! are linked through headers written into their own bytes, but every link is
//! an offset from the arena base and all pointer arithmetic lives in
//! [`arena`]. See [`buddy`] for the core algorithms and [`allocator`] for the
//! thread safe public handle.

mod allocator;
mod arena;
mod bitmap;
mod buddy;
mod class;
mod freelist;
mod header;
mod platform;

use thiserror::Error;

/// Offset of a block within the arena, or `None` for the end of a list. We
/// use this instead of raw sentinel values in most of the code so the
/// compiler yells at us if we forget the empty case. Headers stored inside
/// the arena encode the `None` case themselves, see [`header::BlockHeader`].
pub(crate) type Link = Option<usize>;

/// Why [`BuddyAllocator::new`] refused to build an allocator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    /// The arena can only be halved evenly if its size is a power of two.
    #[error("arena size {0} is not a power of two")]
    ArenaSizeNotPowerOfTwo(usize),

    /// Splitting stops at the minimum block size, which must also be a power
    /// of two for the buddy address math to hold.
    #[error("minimum block size {0} is not a power of two")]
    MinBlockSizeNotPowerOfTwo(usize),

    /// Free blocks store their header inside their own bytes, so they cannot
    /// be smaller than the header itself.
    #[error("minimum block size {min_block_size} cannot hold a {header_size} byte block header")]
    MinBlockSizeTooSmall {
        min_block_size: usize,
        header_size: usize,
    },

    /// The smallest block cannot be bigger than the whole arena.
    #[error("minimum block size {min_block_size} exceeds arena size {total_size}")]
    MinBlockSizeExceedsArena {
        min_block_size: usize,
        total_size: usize,
    },

    /// The platform refused to hand us the backing region.
    #[error("could not acquire {0} bytes of backing memory")]
    ArenaUnavailable(usize),
}

pub use allocator::BuddyAllocator;
