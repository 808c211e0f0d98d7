//! Size class math. Blocks always have a power of two size between the
//! minimum block size and the whole arena, so a block size can be identified
//! by a small integer, its class. Class 0 is the minimum block size, class
//! `k` is `min_block_size << k` and the highest class spans the entire arena.

/// Rounds a request of `n` bytes up to the block size it will be served
/// from. Zero byte requests still get a whole minimum block. Returns `None`
/// if `n` is so large that the next power of two overflows [`usize`], such a
/// request can never fit in any arena anyway.
#[inline]
pub(crate) fn round_request(n: usize, min_block_size: usize) -> Option<usize> {
    Some(n.checked_next_power_of_two()?.max(min_block_size))
}

/// Class of a block of `size` bytes. `size` must be a power of two between
/// the minimum block size and the arena size.
#[inline]
pub(crate) fn class_of(size: usize, min_block_size: usize) -> usize {
    (size.trailing_zeros() - min_block_size.trailing_zeros()) as usize
}

/// Number of classes needed for an arena of `total_size` bytes, one per
/// power of two from the minimum block size up to the arena itself.
#[inline]
pub(crate) fn class_count(total_size: usize, min_block_size: usize) -> usize {
    class_of(total_size, min_block_size) + 1
}

/// Size in bytes of a block of the given class.
#[inline]
pub(crate) fn size_of_class(class: usize, min_block_size: usize) -> usize {
    min_block_size << class
}
