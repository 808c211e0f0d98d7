use std::ptr::NonNull;

use log::warn;

use crate::{
    arena::Arena, class, freelist::FreeList, header::BLOCK_HEADER_SIZE, AllocatorError,
};

/// The allocator core. Owns the arena, the free lists and the record of
/// handed out blocks. Not thread safe on its own, the public handle wraps it
/// in a [`std::sync::Mutex`], see [`crate::allocator::BuddyAllocator`].
///
/// Two properties carry the whole algorithm:
///
/// 1. Every block offset is a multiple of the block size. The initial block
///    starts at offset 0 and splitting in halves preserves this.
///
/// 2. Because of 1, the buddy of a block of size `s` at offset `o` sits at
///    `o ^ s`. The pair tiles the size `2s` block at `o & !s`, so merging is
///    a matter of flipping one bit back off.
///
/// # Splitting
///
/// An allocation that finds no block of its own class takes the first block
/// of any bigger class and halves it until it fits. The upper half of every
/// cut goes back to the free lists, the lower half stays the donor, which
/// keeps the donor's offset (and property 1) intact:
///
/// ```text
///              +-----------------------------------------------+
/// donor (256)  |                      256                      |
///              +-----------------------+-----------------------+
/// cut once     |       donor 128       |      free 128         |
///              +-----------+-----------+-----------------------+
/// cut twice    | donor 64  |  free 64  |      free 128         |
///              +-----------+-----------+-----------------------+
/// ```
///
/// # Coalescing
///
/// A release walks the other way. While the buddy of the freed block is
/// itself a free block of the same size, the pair merges into the lower
/// offset and the walk moves one class up, stopping at the whole arena or at
/// the first buddy that is missing, allocated or split into smaller pieces.
///
/// # Size recovery
///
/// Header bytes of an allocated block are caller property, so the class a
/// block was handed out with is recorded in `allocated`, a dense table with
/// one entry per minimum size slot. A release looks its pointer up there,
/// which also makes double frees and pointers we never produced detectable:
/// they simply have no entry.
pub(crate) struct Buddy {
    arena: Arena,
    free: FreeList,
    /// Class of every currently handed out block, indexed by base slot.
    allocated: Box<[Option<u8>]>,
    min_block_size: usize,
}

/// Not [`Send`] on its own because it holds the raw arena base pointer, see
/// [`crate::allocator::BuddyAllocator`] for why sending it across threads is
/// fine as long as access is synchronized, which the [`std::sync::Mutex`]
/// wrapped around this type guarantees.
unsafe impl Send for Buddy {}

impl Buddy {
    /// Validates the configuration, acquires the arena and sets up the
    /// single whole arena free block.
    pub fn new(total_size: usize, min_block_size: usize) -> Result<Self, AllocatorError> {
        if !total_size.is_power_of_two() {
            return Err(AllocatorError::ArenaSizeNotPowerOfTwo(total_size));
        }

        if !min_block_size.is_power_of_two() {
            return Err(AllocatorError::MinBlockSizeNotPowerOfTwo(min_block_size));
        }

        if min_block_size < BLOCK_HEADER_SIZE {
            return Err(AllocatorError::MinBlockSizeTooSmall {
                min_block_size,
                header_size: BLOCK_HEADER_SIZE,
            });
        }

        if min_block_size > total_size {
            return Err(AllocatorError::MinBlockSizeExceedsArena {
                min_block_size,
                total_size,
            });
        }

        let mut arena =
            Arena::new(total_size).ok_or(AllocatorError::ArenaUnavailable(total_size))?;

        let class_count = class::class_count(total_size, min_block_size);
        let slot_count = total_size / min_block_size;

        let mut free = FreeList::new(class_count, slot_count, min_block_size);
        free.push(&mut arena, class_count - 1, 0);

        Ok(Self {
            arena,
            free,
            allocated: vec![None; slot_count].into_boxed_slice(),
            min_block_size,
        })
    }

    /// Number of size classes the arena is divided into, one per power of
    /// two from the minimum block size up to the whole arena.
    pub fn class_count(&self) -> usize {
        self.free.class_count()
    }

    /// Returns the address of a block that can hold `size` bytes, or `None`
    /// if no block of any class can serve the request. A failed request
    /// leaves the allocator untouched.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = class::round_request(size, self.min_block_size)?;

        if size > self.arena.size() {
            return None;
        }

        let class = class::class_of(size, self.min_block_size);
        let (mut donor_class, offset) = self.find_donor(class)?;

        // Halve the donor until it matches the request. The upper half of
        // each cut becomes free, the lower half remains the donor.
        while donor_class > class {
            donor_class -= 1;
            let half = class::size_of_class(donor_class, self.min_block_size);
            self.free.push(&mut self.arena, donor_class, offset + half);
        }

        self.allocated[offset / self.min_block_size] = Some(class as u8);

        Some(self.arena.pointer_at(offset))
    }

    /// Releases the block at `address` and merges it with its buddies as far
    /// up as possible. Addresses that were never handed out (or have already
    /// been released) are ignored.
    pub fn deallocate(&mut self, address: NonNull<u8>) {
        let Some((offset, class)) = self.lookup_allocated(address) else {
            warn!("ignoring release of {address:?}: no allocated block at this address");
            return;
        };

        self.allocated[offset / self.min_block_size] = None;
        self.coalesce(offset, class);
    }

    /// Scans the free lists from `class` upward and pops the first block
    /// found, returning its class and offset.
    fn find_donor(&mut self, class: usize) -> Option<(usize, usize)> {
        for donor_class in class..self.free.class_count() {
            if let Some(offset) = self.free.pop(&mut self.arena, donor_class) {
                return Some((donor_class, offset));
            }
        }

        None
    }

    /// Maps a caller address to the offset and class it was allocated with.
    /// `None` if the address is outside the arena, not on a slot boundary or
    /// simply not the start of a handed out block.
    fn lookup_allocated(&self, address: NonNull<u8>) -> Option<(usize, usize)> {
        let offset = self.arena.offset_of(address)?;

        if offset % self.min_block_size != 0 {
            return None;
        }

        let class = self.allocated[offset / self.min_block_size]?;

        Some((offset, class as usize))
    }

    /// Merges the freshly freed block at `offset` upward and inserts the
    /// result into its final list. The buddy must pass three checks to be
    /// merged with: it lies within the arena, a free block starts exactly at
    /// its offset and that block has the same size as ours (a buddy that was
    /// split further is still partly in use). The first failed check ends
    /// the walk.
    fn coalesce(&mut self, mut offset: usize, mut class: usize) {
        let mut size = class::size_of_class(class, self.min_block_size);
        let top = self.free.class_count() - 1;

        while class < top {
            let buddy = offset ^ size;

            if buddy + size > self.arena.size() {
                break;
            }

            if !self.free.contains(buddy) {
                break;
            }

            if self.arena.read_header(buddy).size != size {
                break;
            }

            self.free.remove(&mut self.arena, class, buddy);

            // The merged block starts at whichever of the two came first.
            offset = offset.min(buddy);
            size <<= 1;
            class += 1;
        }

        self.free.push(&mut self.arena, class, offset);
    }

    /// Every free block as a `(class, offset)` pair, in list order. Only
    /// needed by tests in this crate.
    #[cfg(test)]
    pub fn free_blocks(&self) -> Vec<(usize, usize)> {
        (0..self.free.class_count())
            .flat_map(|class| {
                self.free
                    .blocks(&self.arena, class)
                    .into_iter()
                    .map(move |offset| (class, offset))
            })
            .collect()
    }
}
