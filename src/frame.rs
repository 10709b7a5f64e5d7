//! This module defines where a task keeps its suspended state. Every task body
//! is moved into a [`FrameBox`] when the task is started. The frame borrows one
//! block from a [`FrameAllocator`] and gives it back exactly once, when the
//! body is dropped (which happens as soon as the task finishes).
//!
//! The default allocator is a [`FixedBlockAllocator`]: a pool of equally
//! sized blocks with a lock-free free list and a mutex-guarded growth path.
//! Frames larger than one block fall back to the global heap.

use std::{
    alloc::{self, Layout},
    future::Future,
    marker::PhantomData,
    pin::Pin,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    task::{Context, Poll},
};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;

// -----------------------------------------------------------------------------
// Frame allocator interface

/// The memory source for task frames.
pub trait FrameAllocator: Send + Sync {
    /// Returns a pointer to memory fitting `layout`, or `None` when the
    /// allocator is exhausted. `layout` always has a non-zero size.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns memory to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with the
    /// same `layout`, and must not be freed more than once.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

// -----------------------------------------------------------------------------
// Fixed block allocator

/// Alignment of every pooled block. Frames with stricter alignment go to the
/// global heap.
pub const BLOCK_ALIGN: usize = 16;

/// A pointer to an unused block sitting in the free list.
struct Block(NonNull<u8>);

// SAFETY: A free block is plain memory owned by the allocator; it carries no
// thread affinity.
unsafe impl Send for Block {}

/// One contiguous allocation carved into blocks.
struct Chunk {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: Chunks are only touched under the `chunks` mutex, and only to
// compare addresses or to deallocate on drop.
unsafe impl Send for Chunk {}

/// A pool of fixed-size blocks.
///
/// `allocate` pops a block from a lock-free free list. When the list is empty
/// the allocator grows under a mutex by `blocks_per_chunk` blocks, halving the
/// request each time the global allocator refuses it. Once the optional
/// `max_blocks` cap is reached `allocate` returns `None`.
pub struct FixedBlockAllocator {
    block_size: usize,
    blocks_per_chunk: usize,
    max_blocks: Option<usize>,
    free_list: SegQueue<Block>,
    chunks: Mutex<Vec<Chunk>>,
    /// Total pooled blocks across all chunks.
    capacity: AtomicUsize,
    /// Pooled blocks currently handed out.
    live_blocks: AtomicUsize,
    /// Frames currently served by the global heap.
    heap_frames: AtomicUsize,
}

impl FixedBlockAllocator {
    /// Creates an empty allocator. The block size is rounded up to a multiple
    /// of [`BLOCK_ALIGN`].
    pub fn new(block_size: usize, blocks_per_chunk: usize) -> FixedBlockAllocator {
        debug_assert!(block_size > 0 && blocks_per_chunk > 0);
        FixedBlockAllocator {
            block_size: block_size.next_multiple_of(BLOCK_ALIGN),
            blocks_per_chunk,
            max_blocks: None,
            free_list: SegQueue::new(),
            chunks: Mutex::new(Vec::new()),
            capacity: AtomicUsize::new(0),
            live_blocks: AtomicUsize::new(0),
            heap_frames: AtomicUsize::new(0),
        }
    }

    /// Caps the number of pooled blocks.
    pub fn with_max_blocks(mut self, max_blocks: usize) -> FixedBlockAllocator {
        self.max_blocks = Some(max_blocks);
        self
    }

    /// Creates an allocator from the frame settings of a scheduler config.
    pub fn from_config(config: &SchedulerConfig) -> FixedBlockAllocator {
        let allocator = FixedBlockAllocator::new(config.frame_block_size, config.frame_blocks_per_chunk);
        match config.max_frame_blocks {
            Some(max_blocks) => allocator.with_max_blocks(max_blocks),
            None => allocator,
        }
    }

    /// The size of one pooled block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of pooled blocks, in use or free.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of pooled blocks currently handed out.
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Acquire)
    }

    /// Number of oversized frames currently served by the global heap.
    pub fn heap_frames(&self) -> usize {
        self.heap_frames.load(Ordering::Acquire)
    }

    /// Returns true if `ptr` points into one of this allocator's chunks.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let address = ptr as usize;
        self.chunks.lock().iter().any(|chunk| {
            let base = chunk.base.as_ptr() as usize;
            (base..base + chunk.layout.size()).contains(&address)
        })
    }

    /// Returns true if a frame with this layout is served from the pool.
    fn is_pooled(&self, layout: Layout) -> bool {
        layout.size() <= self.block_size && layout.align() <= BLOCK_ALIGN
    }

    /// Adds a chunk to the pool and returns one of its blocks. The remaining
    /// blocks go onto the free list.
    #[cold]
    fn grow(&self) -> Option<NonNull<u8>> {
        let mut chunks = self.chunks.lock();

        // Another thread may have grown the pool while we waited for the lock.
        if let Some(Block(block)) = self.free_list.pop() {
            return Some(block);
        }

        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut count = match self.max_blocks {
            Some(max_blocks) => self.blocks_per_chunk.min(max_blocks.saturating_sub(capacity)),
            None => self.blocks_per_chunk,
        };
        if count == 0 {
            warn!(capacity, "frame allocator reached its block limit");
            return None;
        }

        loop {
            let layout = Layout::from_size_align(self.block_size * count, BLOCK_ALIGN).ok()?;
            // SAFETY: The layout has a non-zero size since both the block size
            // and the count are non-zero.
            let base = unsafe { alloc::alloc(layout) };
            match NonNull::new(base) {
                Some(base) => {
                    for i in 1..count {
                        // SAFETY: `i * block_size` stays within the chunk, so
                        // the offset pointer is in bounds and non-null.
                        let block = unsafe { NonNull::new_unchecked(base.as_ptr().add(i * self.block_size)) };
                        self.free_list.push(Block(block));
                    }
                    chunks.push(Chunk { base, layout });
                    self.capacity.store(capacity + count, Ordering::Release);
                    debug!(blocks = count, capacity = capacity + count, "frame allocator grew");
                    return Some(base);
                }
                None if count > 1 => {
                    warn!(blocks = count, "frame allocator growth failed, retrying smaller");
                    count /= 2;
                }
                None => return None,
            }
        }
    }
}

impl FrameAllocator for FixedBlockAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if !self.is_pooled(layout) {
            // SAFETY: Frame layouts always have a non-zero size.
            let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
            self.heap_frames.fetch_add(1, Ordering::AcqRel);
            return Some(ptr);
        }

        let block = match self.free_list.pop() {
            Some(Block(block)) => block,
            None => self.grow()?,
        };
        self.live_blocks.fetch_add(1, Ordering::AcqRel);
        Some(block)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if self.is_pooled(layout) {
            debug_assert!(self.owns(ptr.as_ptr()));
            self.live_blocks.fetch_sub(1, Ordering::AcqRel);
            self.free_list.push(Block(ptr));
        } else {
            // SAFETY: Oversized frames come straight from the global heap with
            // this same layout.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            self.heap_frames.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for FixedBlockAllocator {
    fn drop(&mut self) {
        let live_blocks = *self.live_blocks.get_mut();
        if live_blocks != 0 {
            warn!(live_blocks, "frame allocator dropped with frames still in use");
        }
        for chunk in self.chunks.get_mut().drain(..) {
            // SAFETY: Every chunk was allocated with exactly this layout.
            unsafe { alloc::dealloc(chunk.base.as_ptr(), chunk.layout) };
        }
    }
}

// -----------------------------------------------------------------------------
// Frame box

/// An owned buffer holding one value in memory borrowed from a
/// [`FrameAllocator`]. It behaves like a `Box`, except that the memory comes
/// from (and goes back to) the frame allocator.
///
/// The value never moves once placed in the frame, so a `FrameBox` around a
/// future can be polled without being pinned itself.
pub struct FrameBox<T> {
    ptr: NonNull<T>,
    allocator: Arc<dyn FrameAllocator>,
    marker: PhantomData<T>,
}

impl<T> FrameBox<T> {
    /// Moves `value` into a frame obtained from `allocator`. If the allocator
    /// is exhausted this reports an allocation error, which aborts.
    pub fn new(value: T, allocator: Arc<dyn FrameAllocator>) -> FrameBox<T> {
        let layout = Layout::new::<T>();
        let ptr = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            match allocator.allocate(layout) {
                Some(ptr) => ptr.cast::<T>(),
                None => alloc::handle_alloc_error(layout),
            }
        };
        // SAFETY: The pointer is valid for writes of `T` and suitably aligned.
        unsafe { ptr.as_ptr().write(value) };
        FrameBox {
            ptr,
            allocator,
            marker: PhantomData,
        }
    }

    /// Returns a shared reference to the stored value.
    pub fn get(&self) -> &T {
        // SAFETY: The value is initialized for the whole life of the frame.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for FrameBox<T> {
    fn drop(&mut self) {
        let layout = Layout::new::<T>();
        // SAFETY: The value is initialized and is dropped exactly once, here.
        // The memory came from `allocator` with `layout`, and is returned once.
        unsafe {
            self.ptr.as_ptr().drop_in_place();
            if layout.size() != 0 {
                self.allocator.free(self.ptr.cast::<u8>(), layout);
            }
        }
    }
}

impl<F: Future> Future for FrameBox<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        // SAFETY: The future lives at a fixed address until the frame is
        // dropped, and `FrameBox` never hands out `&mut F` or moves out of it.
        unsafe { Pin::new_unchecked(&mut *self.ptr.as_ptr()) }.poll(cx)
    }
}

impl<T> Unpin for FrameBox<T> {}

// SAFETY: A `FrameBox<T>` owns its `T`, exactly like `Box<T>`.
unsafe impl<T: Send> Send for FrameBox<T> {}

// SAFETY: Shared access only exposes `&T`.
unsafe impl<T: Sync> Sync for FrameBox<T> {}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicBool,
        task::{Wake, Waker},
    };

    use super::*;

    struct NoopWake;

    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn reuses_freed_blocks() {
        let allocator = FixedBlockAllocator::new(64, 4);
        let layout = Layout::new::<[u64; 4]>();

        let first = allocator.allocate(layout).unwrap();
        assert!(allocator.owns(first.as_ptr()));
        assert_eq!(allocator.live_blocks(), 1);
        assert_eq!(allocator.capacity(), 4);

        unsafe { allocator.free(first, layout) };
        assert_eq!(allocator.live_blocks(), 0);

        let second = allocator.allocate(layout).unwrap();
        assert!(allocator.owns(second.as_ptr()));
        unsafe { allocator.free(second, layout) };
    }

    #[test]
    fn grows_until_the_cap() {
        let allocator = FixedBlockAllocator::new(32, 4).with_max_blocks(6);
        let layout = Layout::new::<u64>();

        let blocks: Vec<_> = (0..6).map(|_| allocator.allocate(layout).unwrap()).collect();
        assert_eq!(allocator.capacity(), 6);
        assert_eq!(allocator.live_blocks(), 6);
        assert!(allocator.allocate(layout).is_none());

        for block in blocks {
            assert!(allocator.owns(block.as_ptr()));
            unsafe { allocator.free(block, layout) };
        }
        assert_eq!(allocator.live_blocks(), 0);
    }

    #[test]
    fn oversized_frames_use_the_heap() {
        let allocator = FixedBlockAllocator::new(16, 4);
        let layout = Layout::new::<[u8; 100]>();

        let ptr = allocator.allocate(layout).unwrap();
        assert!(!allocator.owns(ptr.as_ptr()));
        assert_eq!(allocator.heap_frames(), 1);
        assert_eq!(allocator.live_blocks(), 0);

        unsafe { allocator.free(ptr, layout) };
        assert_eq!(allocator.heap_frames(), 0);
    }

    #[test]
    fn ignores_foreign_pointers() {
        let allocator = FixedBlockAllocator::new(16, 4);
        let value = 42_u64;
        assert!(!allocator.owns(&value as *const u64 as *const u8));
    }

    #[test]
    fn frame_box_returns_its_block() {
        let allocator = Arc::new(FixedBlockAllocator::new(64, 8));
        let dropped = Arc::new(AtomicBool::new(false));

        struct SetOnDrop(Arc<AtomicBool>, u64);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let frame = FrameBox::new(SetOnDrop(Arc::clone(&dropped), 9), allocator.clone());
        assert_eq!(frame.get().1, 9);
        assert_eq!(allocator.live_blocks(), 1);

        drop(frame);
        assert!(dropped.load(Ordering::Acquire));
        assert_eq!(allocator.live_blocks(), 0);
    }

    #[test]
    fn frame_box_polls_its_future() {
        let allocator = Arc::new(FixedBlockAllocator::new(64, 8));
        let mut frame = FrameBox::new(async { 6 * 7 }, allocator.clone());

        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);
        assert_eq!(Pin::new(&mut frame).poll(&mut cx), Poll::Ready(42));

        drop(frame);
        assert_eq!(allocator.live_blocks(), 0);
    }
}
