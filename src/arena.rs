use std::{mem, ptr::NonNull};

use log::trace;

use crate::{header::BlockHeader, platform};

/// The backing memory region. One per allocator, acquired when the allocator
/// is built and returned to the platform when it is dropped. Base address
/// and length never change in between.
///
/// This is the only module in the crate that does pointer arithmetic.
/// Everything above it speaks in offsets from the arena base, this struct
/// translates offsets to addresses, addresses back to offsets and copies
/// block headers in and out of the arena bytes. Keeping the raw pointer work
/// in one place makes it short enough to audit.
pub(crate) struct Arena {
    base: NonNull<u8>,
    size: usize,
}

impl Arena {
    /// Acquires a region of `size` bytes from the platform. Returns `None`
    /// if the platform refuses.
    pub fn new(size: usize) -> Option<Self> {
        let base = unsafe { platform::request_memory(size) }?;
        Some(Self { base, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Address of the byte at `offset`. This is what callers receive from an
    /// allocation. `offset` must be within the arena, the returned pointer
    /// is valid for `size - offset` bytes at most.
    #[inline]
    pub fn pointer_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.size);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Maps an address back to its arena offset, or `None` if the address
    /// does not point into the arena. Comparisons are done on plain numeric
    /// addresses, the given pointer is never dereferenced.
    #[inline]
    pub fn offset_of(&self, address: NonNull<u8>) -> Option<usize> {
        let address = address.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;

        (base..base + self.size)
            .contains(&address)
            .then(|| address - base)
    }

    /// Reads the block header stored at `offset`. Only meaningful if a free
    /// block starts there, the bytes of allocated blocks belong to the
    /// caller and can contain anything.
    #[inline]
    pub fn read_header(&self, offset: usize) -> BlockHeader {
        debug_assert!(offset % mem::align_of::<BlockHeader>() == 0);
        unsafe { self.pointer_at(offset).cast::<BlockHeader>().as_ptr().read() }
    }

    /// Writes `header` into the first bytes of the block at `offset`.
    #[inline]
    pub fn write_header(&mut self, offset: usize, header: BlockHeader) {
        debug_assert!(offset % mem::align_of::<BlockHeader>() == 0);
        unsafe {
            self.pointer_at(offset)
                .cast::<BlockHeader>()
                .as_ptr()
                .write(header)
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        trace!("returning {} byte arena to the platform", self.size);
        unsafe { platform::return_memory(self.base, self.size) }
    }
}
