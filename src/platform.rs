use std::ptr::NonNull;

/// Abstraction for platform specific memory handling. The allocator acquires
/// one region when it is built and returns it when it is dropped, it doesn't
/// care about the APIs offered by the underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely. Returns `None` if the kernel refuses.
    unsafe fn request_memory(length: usize) -> Option<NonNull<u8>>;

    /// Returns the region of `length` bytes starting at `address` to the
    /// kernel. Must be called with the exact values a previous
    /// [`PlatformSpecificMemory::request_memory`] call succeeded with.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

/// Every backend below hands out regions aligned to at least this many
/// bytes: `mmap` and `VirtualAlloc` return page aligned addresses and the
/// Miri mock asks the global allocator for exactly this alignment. Block
/// headers and caller data both rely on the base being well aligned.
pub(crate) const REGION_ALIGN: usize = 4096;

/// Convinience wrapper for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Option<NonNull<u8>> {
    Platform::request_memory(length)
}

/// Convinience wrapper for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Option<NonNull<u8>> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any
            // file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // Nothing sensible to do. The region is still mapped and
                // will go away with the process.
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Option<NonNull<u8>> {
            // Similar to mmap on Linux, Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            // This works a little bit different from mmap, memory has to be
            // reserved first and then committed in order to become usable.
            // We can do both at the same time with one single call.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // For more detailed explanations of each parameter, see
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // Committed memory is released in one call by specifying a
            // length of 0 and the MEM_RELEASE flag. See the docs:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();

            if Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).is_err() {
                // Same problem as munmap on Linux, the region stays mapped.
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock low level memory management. This is also useful for detecting
    //! leaks of the arena itself (regions that are never returned).

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory, REGION_ALIGN};

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, REGION_ALIGN).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Option<NonNull<u8>> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
