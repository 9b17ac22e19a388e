//! Offset-addressed allocator living inside the region
//!
//! Blocks are carved from a bump pointer and recycled through a LIFO free
//! list with first-fit search and splitting. Every reference is an offset
//! from the region base, so both processes can follow it. Both peers may
//! allocate at once (batch resizes on opposite directions), so all state is
//! guarded by a spin lock in the header.

use crate::sync::Backoff;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Alignment of every payload handed out by the heap
pub const HEAP_ALIGN: usize = 16;

const BLOCK_HEADER: u64 = 16;
const MIN_SPLIT: u64 = 32;

#[inline]
fn round_up(size: u64) -> u64 {
    let align = HEAP_ALIGN as u64;
    (size.max(1) + align - 1) & !(align - 1)
}

/// Heap bookkeeping stored in the region header
#[repr(C)]
pub(crate) struct HeapHeader {
    lock: AtomicU32,
    _pad: u32,
    start: u64,
    end: u64,
    bump: AtomicU64,
    free_head: AtomicU64,
}

impl HeapHeader {
    /// Set up an empty heap spanning `[start, end)`
    ///
    /// # Safety
    /// The pointer must be valid and not yet shared with a peer
    pub(crate) unsafe fn init(ptr: *mut Self, start: u64, end: u64) {
        debug_assert_eq!(start % HEAP_ALIGN as u64, 0);
        ptr.write(Self {
            lock: AtomicU32::new(0),
            _pad: 0,
            start,
            end,
            bump: AtomicU64::new(start),
            free_head: AtomicU64::new(0),
        });
    }

    pub(crate) fn span(&self) -> (u64, u64) {
        (self.start, self.end)
    }
}

/// Handle binding a heap header to the mapping it describes
pub(crate) struct Heap<'a> {
    base: *mut u8,
    header: &'a HeapHeader,
}

impl<'a> Heap<'a> {
    /// # Safety
    /// `base` must be the start of the mapping that contains `header`, and
    /// the header's span must lie inside that mapping
    pub(crate) unsafe fn new(base: *mut u8, header: &'a HeapHeader) -> Self {
        Self { base, header }
    }

    pub(crate) fn lock(&self) -> LockedHeap<'_> {
        let mut backoff = Backoff::new();
        while self
            .header
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        LockedHeap { heap: self }
    }
}

/// Exclusive access to the heap; unlocks on drop
pub(crate) struct LockedHeap<'h> {
    heap: &'h Heap<'h>,
}

impl LockedHeap<'_> {
    #[inline]
    unsafe fn block_size(&self, block: u64) -> u64 {
        self.heap.base.add(block as usize).cast::<u64>().read()
    }

    #[inline]
    unsafe fn block_next(&self, block: u64) -> u64 {
        self.heap.base.add(block as usize + 8).cast::<u64>().read()
    }

    #[inline]
    unsafe fn set_block(&self, block: u64, size: u64, next: u64) {
        let ptr = self.heap.base.add(block as usize).cast::<u64>();
        ptr.write(size);
        ptr.add(1).write(next);
    }

    #[inline]
    unsafe fn set_next(&self, block: u64, next: u64) {
        self.heap.base.add(block as usize + 8).cast::<u64>().write(next);
    }

    /// Allocate `size` bytes, returning the payload offset
    pub(crate) fn alloc(&self, size: usize) -> Option<u64> {
        let need = round_up(size as u64);
        let header = self.heap.header;

        unsafe {
            let mut prev = 0u64;
            let mut cur = header.free_head.load(Ordering::Relaxed);
            while cur != 0 {
                let cur_size = self.block_size(cur);
                let next = self.block_next(cur);
                if cur_size >= need {
                    if prev == 0 {
                        header.free_head.store(next, Ordering::Relaxed);
                    } else {
                        self.set_next(prev, next);
                    }

                    if cur_size - need >= BLOCK_HEADER + MIN_SPLIT {
                        let rest = cur + BLOCK_HEADER + need;
                        let head = header.free_head.load(Ordering::Relaxed);
                        self.set_block(rest, cur_size - need - BLOCK_HEADER, head);
                        header.free_head.store(rest, Ordering::Relaxed);
                        self.set_block(cur, need, 0);
                    }
                    return Some(cur + BLOCK_HEADER);
                }
                prev = cur;
                cur = next;
            }

            let block = header.bump.load(Ordering::Relaxed);
            let end = block.checked_add(BLOCK_HEADER + need)?;
            if end > header.end {
                return None;
            }
            self.set_block(block, need, 0);
            header.bump.store(end, Ordering::Relaxed);
            Some(block + BLOCK_HEADER)
        }
    }

    /// Capacity of the block behind a payload offset
    #[cfg(test)]
    pub(crate) fn capacity(&self, offset: u64) -> usize {
        unsafe { self.block_size(offset - BLOCK_HEADER) as usize }
    }

    /// Return a payload offset obtained from [`LockedHeap::alloc`]
    pub(crate) fn free(&self, offset: u64) {
        let header = self.heap.header;
        debug_assert!(offset >= header.start + BLOCK_HEADER && offset < header.end);
        let block = offset - BLOCK_HEADER;
        unsafe {
            let size = self.block_size(block);
            self.set_block(block, size, header.free_head.load(Ordering::Relaxed));
        }
        header.free_head.store(block, Ordering::Relaxed);
    }

    /// Bytes still obtainable, ignoring fragmentation and block headers
    pub(crate) fn free_bytes(&self) -> usize {
        let header = self.heap.header;
        let mut total = header.end - header.bump.load(Ordering::Relaxed);
        let mut cur = header.free_head.load(Ordering::Relaxed);
        while cur != 0 {
            unsafe {
                total += self.block_size(cur);
                cur = self.block_next(cur);
            }
        }
        total as usize
    }
}

impl Drop for LockedHeap<'_> {
    fn drop(&mut self) {
        self.heap.header.lock.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: usize = 4096;

    struct Arena {
        words: Vec<u64>,
    }

    impl Arena {
        fn new() -> Self {
            let mut arena = Self {
                words: vec![0u64; ARENA / 8],
            };
            unsafe {
                HeapHeader::init(arena.header_ptr(), 64, ARENA as u64);
            }
            arena
        }

        fn header_ptr(&mut self) -> *mut HeapHeader {
            self.words.as_mut_ptr().cast()
        }

        fn heap(&mut self) -> Heap<'_> {
            let base = self.words.as_mut_ptr().cast::<u8>();
            unsafe { Heap::new(base, &*base.cast::<HeapHeader>()) }
        }
    }

    #[test]
    fn test_alloc_is_aligned_and_disjoint() {
        let mut arena = Arena::new();
        let heap = arena.heap();
        let locked = heap.lock();

        let a = locked.alloc(10).unwrap();
        let b = locked.alloc(100).unwrap();
        assert_eq!(a % HEAP_ALIGN as u64, 0);
        assert_eq!(b % HEAP_ALIGN as u64, 0);
        assert!(b >= a + locked.capacity(a) as u64);
        assert_eq!(locked.capacity(a), 16);
        assert_eq!(locked.capacity(b), 112);
    }

    #[test]
    fn test_free_block_is_reused() {
        let mut arena = Arena::new();
        let heap = arena.heap();
        let locked = heap.lock();

        let a = locked.alloc(64).unwrap();
        let _b = locked.alloc(64).unwrap();
        locked.free(a);
        assert_eq!(locked.alloc(48), Some(a));
    }

    #[test]
    fn test_large_free_block_is_split() {
        let mut arena = Arena::new();
        let heap = arena.heap();
        let locked = heap.lock();

        let big = locked.alloc(512).unwrap();
        let before = locked.free_bytes();
        locked.free(big);
        assert_eq!(locked.free_bytes(), before + 512);

        let small = locked.alloc(32).unwrap();
        assert_eq!(small, big);
        assert_eq!(locked.capacity(small), 32);
        // Remainder went back on the free list
        let rest = locked.alloc(400).unwrap();
        assert_eq!(rest, big + 32 + BLOCK_HEADER);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut arena = Arena::new();
        let heap = arena.heap();
        let locked = heap.lock();

        assert!(locked.alloc(ARENA).is_none());
        let mut count = 0;
        while locked.alloc(256).is_some() {
            count += 1;
        }
        assert_eq!(count, (ARENA - 64) / (256 + BLOCK_HEADER as usize));
        assert!(locked.free_bytes() < 256 + BLOCK_HEADER as usize);
    }

    #[test]
    fn test_lock_is_released_on_drop() {
        let mut arena = Arena::new();
        let heap = arena.heap();
        drop(heap.lock());
        let locked = heap.lock();
        assert!(locked.alloc(8).is_some());
    }
}
