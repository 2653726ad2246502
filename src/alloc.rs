//! Pluggable allocator capability.
//!
//! Every dynamic structure in the crate borrows an `&dyn Allocator` instead
//! of calling the global allocator directly. The borrow ties the allocator's
//! lifetime to the structure, so an allocator always outlives what it backs.
//!
//! - `SystemAllocator` forwards to `std::alloc`.
//! - `TrackingAllocator` wraps another allocator, records live blocks and can
//!   be armed to fail, which is how leak and out-of-memory behavior is tested.
//! - The default allocator is per-thread and swappable.

use core::cell::{Cell, RefCell};
use core::ptr::{self, NonNull};
use core::slice;
use hashbrown::HashMap;
use std::alloc::{self as sys, Layout};

/// Alignment of every block handed out by an `Allocator`.
pub const BLOCK_ALIGN: usize = 16;

/// Four-operation allocation capability.
///
/// Implementations must return blocks aligned to `BLOCK_ALIGN`. The crate
/// never requests zero-sized blocks, and always passes back the size a
/// block was obtained with.
pub trait Allocator {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Allocate `count * size` zero-filled bytes.
    fn zero_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>>;

    /// Resize a block, preserving its first `min(old_size, new_size)` bytes.
    /// On failure the original block is left untouched.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator for a block of
    /// `old_size` bytes and not been freed.
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must have been returned by this allocator for a block of `size`
    /// bytes and not been freed.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

fn block_layout(size: usize) -> Option<Layout> {
    if size == 0 {
        return None;
    }
    Layout::from_size_align(size, BLOCK_ALIGN).ok()
}

/// Thin pass-through to the host allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = block_layout(size)?;
        NonNull::new(unsafe { sys::alloc(layout) })
    }

    fn zero_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let layout = block_layout(count.checked_mul(size)?)?;
        NonNull::new(unsafe { sys::alloc_zeroed(layout) })
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let old = block_layout(old_size)?;
        // Rejects zero and sizes that overflow isize once rounded.
        block_layout(new_size)?;
        NonNull::new(unsafe { sys::realloc(ptr.as_ptr(), old, new_size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        if let Some(layout) = block_layout(size) {
            unsafe { sys::dealloc(ptr.as_ptr(), layout) }
        }
    }
}

static SYSTEM: SystemAllocator = SystemAllocator;

thread_local! {
    static DEFAULT: Cell<Option<&'static dyn Allocator>> = const { Cell::new(None) };
}

/// The calling thread's default allocator.
pub fn default_allocator() -> &'static dyn Allocator {
    DEFAULT.with(Cell::get).unwrap_or(&SYSTEM)
}

/// Swap the calling thread's default allocator and return the previous
/// override. `None` restores the system allocator.
///
/// Structures already built keep the allocator they were built with.
pub fn set_default_allocator(
    allocator: Option<&'static dyn Allocator>,
) -> Option<&'static dyn Allocator> {
    DEFAULT.with(|d| d.replace(allocator))
}

/// Allocator wrapper that records every live block.
///
/// Single-threaded, like every structure that borrows it.
#[derive(Debug, Default)]
pub struct TrackingAllocator<A = SystemAllocator> {
    inner: A,
    live: RefCell<HashMap<usize, usize>>,
    total: Cell<usize>,
    budget: Cell<Option<usize>>,
}

impl TrackingAllocator {
    pub fn new() -> Self {
        Self::wrap(SystemAllocator)
    }
}

impl<A: Allocator> TrackingAllocator<A> {
    pub fn wrap(inner: A) -> Self {
        Self {
            inner,
            live: RefCell::new(HashMap::new()),
            total: Cell::new(0),
            budget: Cell::new(None),
        }
    }

    /// Number of blocks currently allocated and not freed.
    pub fn outstanding(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.live.borrow().values().sum()
    }

    /// Successful allocate, zero_allocate and resize calls so far.
    pub fn total_allocations(&self) -> usize {
        self.total.get()
    }

    /// Let `n` more allocations succeed, then fail every one after that.
    /// `None` lifts the limit.
    pub fn fail_after(&self, n: Option<usize>) {
        self.budget.set(n);
    }

    fn admit(&self) -> bool {
        match self.budget.get() {
            Some(0) => false,
            Some(n) => {
                self.budget.set(Some(n - 1));
                true
            }
            None => true,
        }
    }

    fn record(&self, block: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let ptr = block?;
        self.live.borrow_mut().insert(ptr.as_ptr() as usize, size);
        self.total.set(self.total.get() + 1);
        Some(ptr)
    }
}

impl<A: Allocator> Allocator for TrackingAllocator<A> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if !self.admit() {
            return None;
        }
        self.record(self.inner.allocate(size), size)
    }

    fn zero_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        if !self.admit() {
            return None;
        }
        let bytes = count.checked_mul(size)?;
        self.record(self.inner.zero_allocate(count, size), bytes)
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if !self.admit() {
            return None;
        }
        let moved = unsafe { self.inner.resize(ptr, old_size, new_size) }?;
        self.live.borrow_mut().remove(&(ptr.as_ptr() as usize));
        self.record(Some(moved), new_size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let recorded = self.live.borrow_mut().remove(&(ptr.as_ptr() as usize));
        debug_assert_eq!(recorded, Some(size), "free of an unknown block or wrong size");
        unsafe { self.inner.free(ptr, size) }
    }
}

/// Allocator-owned byte region. Its contents are always initialized.
///
/// Not released on drop: the owner hands it back with `free` to the
/// allocator that produced it.
pub(crate) struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

impl Block {
    pub(crate) fn empty() -> Self {
        Block {
            ptr: NonNull::<u128>::dangling().cast(),
            size: 0,
        }
    }

    /// `count * size` zeroed bytes.
    pub(crate) fn zeroed(a: &dyn Allocator, count: usize, size: usize) -> Option<Self> {
        let bytes = count.checked_mul(size)?;
        if bytes == 0 {
            return Some(Self::empty());
        }
        a.zero_allocate(count, size).map(|ptr| Block { ptr, size: bytes })
    }

    /// A block holding the concatenation of `parts`.
    pub(crate) fn copy_from(a: &dyn Allocator, parts: &[&[u8]]) -> Option<Self> {
        let size = parts.iter().map(|p| p.len()).sum();
        if size == 0 {
            return Some(Self::empty());
        }
        let ptr = a.allocate(size)?;
        let mut offset = 0;
        for part in parts {
            unsafe {
                ptr::copy_nonoverlapping(part.as_ptr(), ptr.as_ptr().add(offset), part.len());
            }
            offset += part.len();
        }
        Some(Block { ptr, size })
    }

    /// Rebuild a block from `into_raw`.
    ///
    /// # Safety
    /// `ptr` and `size` must come from `into_raw` on a block that has not
    /// been rebuilt since.
    pub(crate) unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Block { ptr, size }
    }

    pub(crate) fn into_raw(self) -> NonNull<u8> {
        self.ptr
    }

    /// Resize through the allocator, zero-filling any new tail. Returns
    /// `false` and leaves the block untouched when the allocator fails.
    pub(crate) fn resize(&mut self, a: &dyn Allocator, new_size: usize) -> bool {
        if new_size == self.size {
            return true;
        }
        if self.size == 0 {
            return match Self::zeroed(a, 1, new_size) {
                Some(b) => {
                    *self = b;
                    true
                }
                None => false,
            };
        }
        if new_size == 0 {
            core::mem::replace(self, Self::empty()).free(a);
            return true;
        }
        let Some(moved) = (unsafe { a.resize(self.ptr, self.size, new_size) }) else {
            return false;
        };
        if new_size > self.size {
            unsafe { ptr::write_bytes(moved.as_ptr().add(self.size), 0, new_size - self.size) };
        }
        self.ptr = moved;
        self.size = new_size;
        true
    }

    pub(crate) fn free(self, a: &dyn Allocator) {
        if self.size > 0 {
            unsafe { a.free(self.ptr, self.size) }
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn is_aligned_for<T>(&self) -> bool {
        (self.ptr.as_ptr() as usize) % core::mem::align_of::<T>() == 0
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_counts_live_blocks_and_bytes() {
        let a = TrackingAllocator::new();
        let b1 = Block::copy_from(&a, &[&b"abc"[..], &b"de"[..]]).unwrap();
        let b2 = Block::zeroed(&a, 4, 8).unwrap();
        assert_eq!(a.outstanding(), 2);
        assert_eq!(a.outstanding_bytes(), 5 + 32);
        assert_eq!(b1.as_slice(), b"abcde");
        assert!(b2.as_slice().iter().all(|&b| b == 0));
        b1.free(&a);
        b2.free(&a);
        assert_eq!(a.outstanding(), 0);
        assert_eq!(a.total_allocations(), 2);
    }

    #[test]
    fn fail_after_limits_successful_allocations() {
        let a = TrackingAllocator::new();
        a.fail_after(Some(1));
        let ok = Block::zeroed(&a, 1, 16).expect("first allocation admitted");
        assert!(Block::zeroed(&a, 1, 16).is_none());
        assert!(Block::copy_from(&a, &[&b"x"[..]]).is_none());
        a.fail_after(None);
        let again = Block::copy_from(&a, &[&b"x"[..]]).expect("limit lifted");
        ok.free(&a);
        again.free(&a);
        assert_eq!(a.outstanding(), 0);
    }

    #[test]
    fn resize_preserves_prefix_and_zeroes_tail() {
        let a = TrackingAllocator::new();
        let mut b = Block::copy_from(&a, &[&[7u8; 8][..]]).unwrap();
        assert!(b.resize(&a, 24));
        assert_eq!(&b.as_slice()[..8], &[7u8; 8]);
        assert!(b.as_slice()[8..].iter().all(|&x| x == 0));
        assert_eq!(a.outstanding_bytes(), 24);

        assert!(b.resize(&a, 4));
        assert_eq!(b.as_slice(), &[7u8; 4]);
        assert!(b.resize(&a, 0));
        assert_eq!(a.outstanding(), 0);
        b.free(&a);
    }

    #[test]
    fn failed_resize_leaves_block_untouched() {
        let a = TrackingAllocator::new();
        let mut b = Block::copy_from(&a, &[&b"keep"[..]]).unwrap();
        a.fail_after(Some(0));
        assert!(!b.resize(&a, 64));
        assert_eq!(b.as_slice(), b"keep");
        assert_eq!(a.outstanding_bytes(), 4);
        a.fail_after(None);
        b.free(&a);
        assert_eq!(a.outstanding(), 0);
    }

    #[test]
    fn default_allocator_can_be_swapped_and_restored() {
        let tracker: &'static TrackingAllocator = Box::leak(Box::new(TrackingAllocator::new()));
        assert!(set_default_allocator(Some(tracker)).is_none());

        let b = Block::zeroed(default_allocator(), 1, 32).unwrap();
        assert_eq!(tracker.outstanding(), 1);
        b.free(default_allocator());
        assert_eq!(tracker.outstanding(), 0);

        assert!(set_default_allocator(None).is_some());
        let b = Block::zeroed(default_allocator(), 1, 32).unwrap();
        assert_eq!(tracker.total_allocations(), 1);
        b.free(default_allocator());
    }

    #[test]
    fn system_allocator_honors_block_alignment() {
        let p = SystemAllocator.allocate(3).unwrap();
        assert_eq!(p.as_ptr() as usize % BLOCK_ALIGN, 0);
        unsafe { SystemAllocator.free(p, 3) };
    }
}
