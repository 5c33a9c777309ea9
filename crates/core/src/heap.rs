use serde::Serialize;
use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ptr::NonNull;

/// Allocation hooks in the C style: sizes only, no layouts.
pub trait Heap {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resize a block, preserving its contents up to the smaller size.
    /// `None` behaves like `allocate`; a zero size frees the block.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this heap and not been freed.
    unsafe fn reallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have come from this heap and not been freed.
    unsafe fn free(&self, ptr: Option<NonNull<u8>>);

    fn stats(&self) -> HeapStats;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub in_use: usize,
    pub peak: usize,
    pub live_blocks: usize,
    pub total_allocations: u64,
}

// Each block carries its requested size in a header this wide.
const HEADER: usize = 16;

/// Global-allocator backed heap with usage accounting.
#[derive(Debug, Default)]
pub struct SystemHeap {
    stats: Cell<HeapStats>,
}

impl SystemHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.checked_add(HEADER)?, HEADER).ok()
    }

    fn record_alloc(&self, size: usize) {
        let mut stats = self.stats.get();
        stats.in_use += size;
        stats.peak = stats.peak.max(stats.in_use);
        stats.live_blocks += 1;
        stats.total_allocations += 1;
        self.stats.set(stats);
    }

    fn record_free(&self, size: usize) {
        let mut stats = self.stats.get();
        stats.in_use -= size;
        stats.live_blocks -= 1;
        self.stats.set(stats);
    }

    /// # Safety
    ///
    /// `ptr` must be a block handed out by this heap.
    unsafe fn header(ptr: NonNull<u8>) -> (*mut u8, usize) {
        let base = ptr.as_ptr().sub(HEADER);
        (base, base.cast::<usize>().read())
    }
}

impl Heap for SystemHeap {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // SAFETY: the layout is never zero sized because of the header.
        let base = NonNull::new(unsafe { alloc::alloc(layout) })?;
        // SAFETY: the block is at least HEADER bytes and HEADER aligned.
        unsafe {
            base.as_ptr().cast::<usize>().write(size);
        }
        self.record_alloc(size);
        // SAFETY: HEADER bytes past a live allocation of size + HEADER.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(HEADER)) })
    }

    unsafe fn reallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(size);
        };
        if size == 0 {
            self.free(Some(ptr));
            return None;
        }

        let (base, old_size) = Self::header(ptr);
        let old_layout = Self::layout(old_size)?;
        // The new size must form a valid layout too, or realloc is undefined.
        let new_layout = Self::layout(size)?;
        let base = NonNull::new(alloc::realloc(base, old_layout, new_layout.size()))?;
        base.as_ptr().cast::<usize>().write(size);

        self.record_free(old_size);
        self.record_alloc(size);
        Some(NonNull::new_unchecked(base.as_ptr().add(HEADER)))
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        let (base, size) = Self::header(ptr);
        if let Some(layout) = Self::layout(size) {
            alloc::dealloc(base, layout);
            self.record_free(size);
        }
    }

    fn stats(&self) -> HeapStats {
        self.stats.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_accounting() {
        let heap = SystemHeap::new();
        let a = heap.allocate(100);
        let b = heap.allocate(28);
        assert!(a.is_some() && b.is_some());
        assert_eq!(heap.stats().in_use, 128);
        assert_eq!(heap.stats().live_blocks, 2);

        unsafe {
            heap.free(a);
            heap.free(b);
        }
        let stats = heap.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.live_blocks, 0);
        assert_eq!(stats.peak, 128);
        assert_eq!(stats.total_allocations, 2);
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let heap = SystemHeap::new();
        let ptr = heap.allocate(4).unwrap();
        unsafe {
            ptr.as_ptr().copy_from(b"rtos".as_ptr(), 4);
            let grown = heap.reallocate(Some(ptr), 64).unwrap();
            let bytes = std::slice::from_raw_parts(grown.as_ptr(), 4);
            assert_eq!(bytes, b"rtos");
            assert_eq!(heap.stats().in_use, 64);
            heap.free(Some(grown));
        }
        assert_eq!(heap.stats().in_use, 0);
    }

    #[test]
    fn test_realloc_edges() {
        let heap = SystemHeap::new();
        unsafe {
            let ptr = heap.reallocate(None, 8);
            assert!(ptr.is_some());
            assert_eq!(heap.reallocate(ptr, 0), None);
            heap.free(None);
        }
        assert_eq!(heap.stats().live_blocks, 0);
    }

    #[test]
    fn test_oversized_requests_fail_cleanly() {
        let heap = SystemHeap::new();
        assert!(heap.allocate(usize::MAX).is_none());
        assert!(heap.allocate(isize::MAX as usize).is_none());

        let ptr = heap.allocate(8).unwrap();
        unsafe {
            ptr.as_ptr().copy_from(b"keepdata".as_ptr(), 8);
            assert_eq!(heap.reallocate(Some(ptr), isize::MAX as usize), None);
            assert_eq!(heap.reallocate(Some(ptr), usize::MAX - 4), None);

            // A refused resize leaves the block untouched.
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), 8);
            assert_eq!(bytes, b"keepdata");
            assert_eq!(heap.stats().in_use, 8);
            heap.free(Some(ptr));
        }
        assert_eq!(heap.stats().live_blocks, 0);
    }

    #[test]
    fn test_blocks_are_aligned() {
        let heap = SystemHeap::new();
        let ptr = heap.allocate(3).unwrap();
        assert_eq!(ptr.as_ptr() as usize % HEADER, 0);
        unsafe { heap.free(Some(ptr)) };
    }
}
