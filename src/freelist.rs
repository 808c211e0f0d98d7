use crate::{arena::Arena, bitmap::Bitmap, class, header::BlockHeader, Link};

/// One doubly linked list of free blocks per size class, threaded through
/// the [`BlockHeader`]s that free blocks carry in their own bytes. Only the
/// list heads and the free block bitmap live outside the arena:
///
/// ```text
///  heads[0] -> None
///                     +------------------------+
///                     |                        v
///  heads[1] ----> +-------+              +-------+
///                 | Free  |              | Free  |
///                 |  64   |              |  64   |
///                 +-------+              +-------+
///                     ^                        |
///                     +------------------------+
///  heads[2] ----> +-----------+
///                 |   Free    |
///                 |    128    |
///                 +-----------+
/// ```
///
/// Insertion is always at the head. Removal works from any position in O(1)
/// because every header knows its neighbours. Order within a list carries no
/// meaning.
///
/// The bitmap has one bit per minimum size slot and answers "does a free
/// block start at this offset". The linked lists alone cannot answer that
/// without a walk, and reading a header before knowing the block is free
/// would mean reading caller bytes. See [`Bitmap`].
pub(crate) struct FreeList {
    /// Head of each per class list.
    heads: Box<[Link]>,
    /// Set bits mark the slots where a free block starts.
    map: Bitmap,
    /// Bytes per slot, the minimum block size.
    slot_size: usize,
}

impl FreeList {
    /// Builds an empty table for an arena of `slot_count` minimum size
    /// slots.
    pub fn new(class_count: usize, slot_count: usize, slot_size: usize) -> Self {
        Self {
            heads: vec![None; class_count].into_boxed_slice(),
            map: Bitmap::new(slot_count),
            slot_size,
        }
    }

    pub fn class_count(&self) -> usize {
        self.heads.len()
    }

    /// Whether a free block starts at `offset`.
    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        self.map.get(offset / self.slot_size)
    }

    /// Marks the block at `offset` free: writes a fresh header for its class
    /// size and pushes it onto the head of list `class`.
    pub fn push(&mut self, arena: &mut Arena, class: usize, offset: usize) {
        let mut header = BlockHeader::new(class::size_of_class(class, self.slot_size));
        header.set_next(self.heads[class]);

        if let Some(next) = self.heads[class] {
            let mut next_header = arena.read_header(next);
            next_header.set_prev(Some(offset));
            arena.write_header(next, next_header);
        }

        arena.write_header(offset, header);
        self.heads[class] = Some(offset);
        self.map.set(offset / self.slot_size);
    }

    /// Unlinks the block at `offset` from list `class`. The block must be in
    /// that list. Its header links are cleared afterwards so the block reads
    /// as belonging to no list.
    pub fn remove(&mut self, arena: &mut Arena, class: usize, offset: usize) {
        let mut header = arena.read_header(offset);

        match header.prev() {
            Some(prev) => {
                let mut prev_header = arena.read_header(prev);
                prev_header.set_next(header.next());
                arena.write_header(prev, prev_header);
            }
            None => self.heads[class] = header.next(),
        }

        if let Some(next) = header.next() {
            let mut next_header = arena.read_header(next);
            next_header.set_prev(header.prev());
            arena.write_header(next, next_header);
        }

        header.clear_links();
        arena.write_header(offset, header);
        self.map.clear(offset / self.slot_size);
    }

    /// Pops the head of list `class`, or `None` if the list is empty.
    pub fn pop(&mut self, arena: &mut Arena, class: usize) -> Link {
        let offset = self.heads[class]?;
        self.remove(arena, class, offset);
        Some(offset)
    }

    /// Offsets of all free blocks in list `class`, in list order. Walks the
    /// links, only needed by tests.
    #[cfg(test)]
    pub fn blocks(&self, arena: &Arena, class: usize) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut current = self.heads[class];

        while let Some(offset) = current {
            offsets.push(offset);
            current = arena.read_header(offset).next();
        }

        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: usize = 32;

    fn arena_and_list() -> (Arena, FreeList) {
        let arena = Arena::new(1024).unwrap();
        let list = FreeList::new(class::class_count(1024, MIN), 1024 / MIN, MIN);
        (arena, list)
    }

    #[test]
    fn push_links_blocks_at_the_head() {
        let (mut arena, mut list) = arena_and_list();

        list.push(&mut arena, 0, 0);
        list.push(&mut arena, 0, 32);
        list.push(&mut arena, 0, 64);

        assert_eq!(list.blocks(&arena, 0), vec![64, 32, 0]);
        assert!(list.contains(0));
        assert!(list.contains(32));
        assert!(list.contains(64));
        assert!(!list.contains(96));

        // Headers carry the class size and symmetric links.
        assert_eq!(arena.read_header(64).size, MIN);
        assert_eq!(arena.read_header(64).next(), Some(32));
        assert_eq!(arena.read_header(32).prev(), Some(64));
        assert_eq!(arena.read_header(32).next(), Some(0));
        assert_eq!(arena.read_header(0).prev(), Some(32));
        assert_eq!(arena.read_header(0).next(), None);
    }

    #[test]
    fn remove_from_any_position() {
        let (mut arena, mut list) = arena_and_list();

        for offset in [0, 32, 64, 96] {
            list.push(&mut arena, 0, offset);
        }
        // List is now 96 -> 64 -> 32 -> 0.

        // Middle.
        list.remove(&mut arena, 0, 64);
        assert_eq!(list.blocks(&arena, 0), vec![96, 32, 0]);
        assert!(!list.contains(64));

        // Head.
        list.remove(&mut arena, 0, 96);
        assert_eq!(list.blocks(&arena, 0), vec![32, 0]);

        // Tail.
        list.remove(&mut arena, 0, 0);
        assert_eq!(list.blocks(&arena, 0), vec![32]);

        // Removed blocks read as unlinked.
        assert_eq!(arena.read_header(64).prev(), None);
        assert_eq!(arena.read_header(64).next(), None);

        // Sole member.
        list.remove(&mut arena, 0, 32);
        assert_eq!(list.blocks(&arena, 0), vec![]);
        assert!(!list.contains(32));
    }

    #[test]
    fn pop_takes_the_most_recently_pushed_block() {
        let (mut arena, mut list) = arena_and_list();

        assert_eq!(list.pop(&mut arena, 3), None);

        list.push(&mut arena, 3, 0);
        list.push(&mut arena, 3, 256);

        assert_eq!(list.pop(&mut arena, 3), Some(256));
        assert_eq!(list.pop(&mut arena, 3), Some(0));
        assert_eq!(list.pop(&mut arena, 3), None);
    }

    #[test]
    fn classes_do_not_interfere() {
        let (mut arena, mut list) = arena_and_list();

        list.push(&mut arena, 0, 0);
        list.push(&mut arena, 1, 64);
        list.push(&mut arena, 2, 128);

        assert_eq!(list.blocks(&arena, 0), vec![0]);
        assert_eq!(list.blocks(&arena, 1), vec![64]);
        assert_eq!(list.blocks(&arena, 2), vec![128]);

        assert_eq!(arena.read_header(64).size, 64);
        assert_eq!(arena.read_header(128).size, 128);
    }
}
