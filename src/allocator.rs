use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use log::debug;

use crate::{buddy::Buddy, platform::REGION_ALIGN, AllocatorError};

/// Thread safe handle over the [`Buddy`] core. This is the public API of
/// the crate:
///
/// ```rust
/// use budloc::BuddyAllocator;
///
/// let allocator = BuddyAllocator::new(1024, 32).unwrap();
///
/// // Requests are rounded up to the next power of two, so this takes a
/// // whole 128 byte block.
/// let address = allocator.allocate(100).unwrap();
///
/// unsafe {
///     // The block is ours until we release it.
///     address.as_ptr().write_bytes(0xAB, 100);
///     allocator.deallocate(Some(address));
/// }
///
/// // Exhaustion is not an error, it just yields nothing.
/// assert!(allocator.allocate(2048).is_none());
/// ```
///
/// Every operation takes one global lock for its whole duration, including
/// the split and merge loops. That is as coarse as it gets, but it keeps the
/// core free of synchronization concerns and the critical sections are a
/// handful of list operations. Finer grained ideas (a lock per size class,
/// one arena per thread) all complicate release paths where a block
/// allocated under one lock is freed under another, so they are not worth it
/// here.
pub struct BuddyAllocator {
    inner: Mutex<Buddy>,
}

/// The core is not [`Send`]/[`Sync`] because it holds the raw arena base
/// pointer. All access to it goes through the [`Mutex`] above and the arena
/// is owned by this struct alone, so handing the whole thing across threads
/// is fine.
unsafe impl Send for BuddyAllocator {}
unsafe impl Sync for BuddyAllocator {}

impl std::fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyAllocator").finish_non_exhaustive()
    }
}

impl BuddyAllocator {
    /// Builds an allocator backed by a fresh arena of `total_size` bytes
    /// that serves blocks of `min_block_size` bytes and up. Both must be
    /// powers of two, `min_block_size` must fit a block header and cannot
    /// exceed `total_size`.
    pub fn new(total_size: usize, min_block_size: usize) -> Result<Self, AllocatorError> {
        let buddy = Buddy::new(total_size, min_block_size)?;

        debug!(
            "buddy allocator ready: {total_size} byte arena split into {} size classes of {min_block_size} bytes and up",
            buddy.class_count()
        );

        Ok(Self {
            inner: Mutex::new(buddy),
        })
    }

    /// Returns the address of a block that can hold `size` bytes, or `None`
    /// if the arena cannot serve the request right now. The block is at
    /// least `size` bytes long and its address is aligned to the rounded
    /// block size.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.lock().ok()?.allocate(size)
    }

    /// Releases a block. `None` is accepted and does nothing, so the result
    /// of a failed [`BuddyAllocator::allocate`] can be passed back as is.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`BuddyAllocator::allocate`] on
    /// this same allocator and not released since, and the caller must not
    /// touch the block afterwards. Addresses that this allocator never
    /// produced are ignored, but a released block can be handed out again at
    /// any moment, so a caller keeping stale copies of the address is on its
    /// own.
    pub unsafe fn deallocate(&self, address: Option<NonNull<u8>>) {
        let Some(address) = address else {
            return;
        };

        if let Ok(mut buddy) = self.inner.lock() {
            buddy.deallocate(address);
        }
    }
}

/// Lets a fixed arena back regular Rust values, the same way the system
/// allocator would. Alignment requests above the block size are satisfied by
/// inflating the block: block addresses are aligned to their size within the
/// arena and the arena base is page aligned, so any block of at least
/// `layout.align()` bytes is aligned well enough. Alignments beyond the page
/// size cannot be promised and yield null.
unsafe impl GlobalAlloc for BuddyAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > REGION_ALIGN {
            return ptr::null_mut();
        }

        match self.allocate(layout.size().max(layout.align())) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // The size of every handed out block is tracked internally, the
        // layout is not needed to find it.
        self.deallocate(NonNull::new(ptr));
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;

    #[test]
    fn rejects_bad_configurations() {
        assert_eq!(
            BuddyAllocator::new(1000, 32).unwrap_err(),
            AllocatorError::ArenaSizeNotPowerOfTwo(1000)
        );

        assert_eq!(
            BuddyAllocator::new(1024, 33).unwrap_err(),
            AllocatorError::MinBlockSizeNotPowerOfTwo(33)
        );

        assert_eq!(
            BuddyAllocator::new(1024, 8).unwrap_err(),
            AllocatorError::MinBlockSizeTooSmall {
                min_block_size: 8,
                header_size: crate::header::BLOCK_HEADER_SIZE,
            }
        );

        assert_eq!(
            BuddyAllocator::new(32, 64).unwrap_err(),
            AllocatorError::MinBlockSizeExceedsArena {
                min_block_size: 64,
                total_size: 32,
            }
        );

        assert_eq!(
            BuddyAllocator::new(0, 32).unwrap_err(),
            AllocatorError::ArenaSizeNotPowerOfTwo(0)
        );

        assert!(BuddyAllocator::new(1024, 32).is_ok());
    }

    #[test]
    fn releasing_nothing_is_a_no_op() {
        let allocator = BuddyAllocator::new(1024, 32).unwrap();

        unsafe {
            allocator.deallocate(None);
            allocator.deallocate(None);
        }

        // The arena is still fully intact.
        assert!(allocator.allocate(1024).is_some());
    }

    #[test]
    fn failed_allocations_can_be_released_back() {
        let allocator = BuddyAllocator::new(1024, 32).unwrap();

        let too_big = allocator.allocate(4096);
        assert!(too_big.is_none());

        unsafe { allocator.deallocate(too_big) };
    }

    #[test]
    fn global_alloc_respects_layout_alignment() {
        let allocator = BuddyAllocator::new(1 << 16, 32).unwrap();

        unsafe {
            // Force some splitting first so the interesting allocation does
            // not start at the page aligned arena base.
            let noise = allocator.alloc(Layout::from_size_align(32, 1).unwrap());
            assert!(!noise.is_null());

            for align in [1, 8, 64, 512, 4096] {
                let layout = Layout::from_size_align(40, align).unwrap();
                let address = allocator.alloc(layout);

                assert!(!address.is_null());
                assert_eq!(address as usize % align, 0);

                allocator.dealloc(address, layout);
            }

            // More than a page of alignment cannot be promised.
            let huge_align = Layout::from_size_align(32, 8192).unwrap();
            assert!(allocator.alloc(huge_align).is_null());

            allocator.dealloc(noise, Layout::from_size_align(32, 1).unwrap());
        }

        let top = {
            let buddy = allocator.inner.lock().unwrap();
            buddy.free_blocks()
        };
        assert_eq!(top, vec![(11, 0)]);
    }

    /// A panic while holding the lock poisons it. From then on the
    /// allocator refuses politely: allocations yield `None` and releases do
    /// nothing at all.
    #[test]
    fn poisoned_lock_disables_the_allocator() {
        let allocator = BuddyAllocator::new(1024, 32).unwrap();

        let address = allocator.allocate(64).unwrap();
        let state = allocator.inner.lock().unwrap().free_blocks();

        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let _guard = allocator.inner.lock().unwrap();
                panic!("die while holding the allocator lock");
            });
            assert!(handle.join().is_err());
        });
        assert!(allocator.inner.is_poisoned());

        assert_eq!(allocator.allocate(64), None);
        unsafe { allocator.deallocate(Some(address)) };

        // Neither call touched the core, the release above did not even
        // reach the free lists.
        let buddy = allocator.inner.lock().unwrap_or_else(|error| error.into_inner());
        assert_eq!(buddy.free_blocks(), state);
    }

    /// Two threads hammering the same allocator with alternating allocate
    /// and release of small blocks. The tags written into each block prove
    /// that no two threads ever held overlapping memory, and after both
    /// drain the arena must be whole again.
    #[test]
    fn concurrent_allocate_and_release() {
        let allocator = BuddyAllocator::new(1 << 20, 32).unwrap();

        let num_threads = 2;
        let iterations = if cfg!(miri) { 200 } else { 100_000 };
        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for thread_id in 0..num_threads {
                let allocator = &allocator;
                let barrier = &barrier;

                scope.spawn(move || {
                    let tag = thread_id as u8 + 1;
                    barrier.wait();

                    for _ in 0..iterations {
                        let address = allocator.allocate(64).expect("arena exhausted");

                        unsafe {
                            std::slice::from_raw_parts_mut(address.as_ptr(), 64).fill(tag);

                            for &byte in std::slice::from_raw_parts(address.as_ptr(), 64) {
                                assert_eq!(byte, tag);
                            }

                            allocator.deallocate(Some(address));
                        }
                    }
                });
            }
        });

        let buddy = allocator.inner.lock().unwrap();
        assert_eq!(buddy.free_blocks(), vec![(15, 0)]);
    }

    /// Threads holding several live blocks at once, so allocations from
    /// different threads are interleaved within the arena.
    #[test]
    fn concurrent_batched_allocations_stay_disjoint() {
        let allocator = BuddyAllocator::new(1 << 20, 32).unwrap();

        let num_threads = 4;
        let rounds = if cfg!(miri) { 10 } else { 1_000 };
        let batch = 32;
        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for thread_id in 0..num_threads {
                let allocator = &allocator;
                let barrier = &barrier;

                scope.spawn(move || {
                    let tag = thread_id as u8 + 1;
                    barrier.wait();

                    for _ in 0..rounds {
                        let held: Vec<NonNull<u8>> = (0..batch)
                            .map(|_| allocator.allocate(128).expect("arena exhausted"))
                            .collect();

                        unsafe {
                            for &address in &held {
                                std::slice::from_raw_parts_mut(address.as_ptr(), 128).fill(tag);
                            }

                            for &address in &held {
                                for &byte in std::slice::from_raw_parts(address.as_ptr(), 128) {
                                    assert_eq!(byte, tag);
                                }

                                allocator.deallocate(Some(address));
                            }
                        }
                    }
                });
            }
        });

        let buddy = allocator.inner.lock().unwrap();
        assert_eq!(buddy.free_blocks(), vec![(15, 0)]);
    }
}
