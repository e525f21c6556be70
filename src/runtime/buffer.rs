//! Bipartite ring buffer for in-flight bytes.
//!
//! Writers acquire a contiguous linear region, fill it, and release the
//! number of bytes actually written. Readers acquire the longest contiguous
//! readable run and release what they consumed. When a write does not fit
//! before the end of the storage it wraps to index 0, and the invalidate
//! index `i` remembers where valid data ends in the tail.
//!
//! One byte of capacity is sacrificed so that `r == w` always means empty.
//!
//! Two flavours share the same index arithmetic:
//! - [`BipBuffer`]: producer and consumer are the same thread (a channel
//!   reading and draining inside one reactor callback). Indices are plain
//!   cells.
//! - [`shared`]: a [`Producer`]/[`Consumer`] pair that may live on different
//!   threads. Indices are atomics with acquire/release ordering.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
}

/// How the shared read/write indices are stored.
pub trait ThreadSafety: sealed::Sealed {
    type Index;

    fn new_index(value: usize) -> Self::Index;
    fn load(index: &Self::Index, order: Ordering) -> usize;
    fn store(index: &Self::Index, value: usize, order: Ordering);
}

/// Single-threaded indices; orderings are ignored.
pub enum Unsync {}

impl sealed::Sealed for Unsync {}

impl ThreadSafety for Unsync {
    type Index = Cell<usize>;

    fn new_index(value: usize) -> Cell<usize> {
        Cell::new(value)
    }

    fn load(index: &Cell<usize>, _order: Ordering) -> usize {
        index.get()
    }

    fn store(index: &Cell<usize>, value: usize, _order: Ordering) {
        index.set(value);
    }
}

/// Atomic indices for a producer and consumer on different threads.
pub enum Atomic {}

impl sealed::Sealed for Atomic {}

impl ThreadSafety for Atomic {
    type Index = AtomicUsize;

    fn new_index(value: usize) -> AtomicUsize {
        AtomicUsize::new(value)
    }

    fn load(index: &AtomicUsize, order: Ordering) -> usize {
        index.load(order)
    }

    fn store(index: &AtomicUsize, value: usize, order: Ordering) {
        index.store(value, order);
    }
}

/// Storage plus indices. The wrap flags belong to one side each and are
/// kept by the owning handle.
struct RawBipBuffer<S: ThreadSafety> {
    data: NonNull<u8>,
    size: usize,
    r: S::Index,
    w: S::Index,
    i: S::Index,
}

// The producer only touches `w`, `i` and the region it acquired; the
// consumer only touches `r` and the run it acquired. With atomic indices
// those regions never overlap.
unsafe impl Send for RawBipBuffer<Atomic> {}
unsafe impl Sync for RawBipBuffer<Atomic> {}

impl<S: ThreadSafety> RawBipBuffer<S> {
    fn new(size: usize) -> Self {
        assert!(size > 2, "ring buffer capacity must exceed 2");
        let data = NonNull::from(Box::leak(vec![0u8; size].into_boxed_slice())).cast::<u8>();
        Self {
            data,
            size,
            r: S::new_index(0),
            w: S::new_index(0),
            i: S::new_index(0),
        }
    }

    fn free_space(&self, w: usize, r: usize) -> usize {
        if r > w {
            (r - w) - 1
        } else {
            (self.size - (w - r)) - 1
        }
    }

    /// Offset of a free linear region of `required` bytes.
    fn write_acquire(&self, required: usize, wrapped: &mut bool) -> Option<usize> {
        let w = S::load(&self.w, Ordering::Relaxed);
        let r = S::load(&self.r, Ordering::Acquire);

        let free = self.free_space(w, r);
        let linear_space = self.size - w;
        let linear_free = free.min(linear_space);

        if required <= linear_free {
            *wrapped = false;
            return Some(w);
        }
        if required <= free - linear_free {
            *wrapped = true;
            return Some(0);
        }
        None
    }

    fn write_release(&self, written: usize, wrapped: &mut bool) {
        let mut w = S::load(&self.w, Ordering::Relaxed);
        let mut i = if *wrapped {
            *wrapped = false;
            let i = w;
            w = 0;
            i
        } else {
            S::load(&self.i, Ordering::Relaxed)
        };

        assert!(w + written <= self.size, "released more than acquired");
        w += written;
        // Writing past the invalidate index makes that data valid again.
        if w > i {
            i = w;
        }
        if w == self.size {
            w = 0;
        }

        S::store(&self.i, i, Ordering::Relaxed);
        S::store(&self.w, w, Ordering::Release);
    }

    /// Offset and length of the longest readable run.
    fn read_acquire(&self, wrapped: &mut bool) -> (usize, usize) {
        let r = S::load(&self.r, Ordering::Relaxed);
        let w = S::load(&self.w, Ordering::Acquire);

        *wrapped = false;
        if r == w {
            return (0, 0);
        }
        if r < w {
            return (r, w - r);
        }

        let i = S::load(&self.i, Ordering::Relaxed);
        if r == i {
            *wrapped = true;
            return (0, w);
        }
        (r, i - r)
    }

    fn read_release(&self, read: usize, wrapped: &mut bool) {
        let mut r = if *wrapped {
            *wrapped = false;
            0
        } else {
            S::load(&self.r, Ordering::Relaxed)
        };

        assert!(r + read <= self.size, "released more than acquired");
        r += read;
        if r == self.size {
            r = 0;
        }

        S::store(&self.r, r, Ordering::Release);
    }

    fn len(&self) -> usize {
        let r = S::load(&self.r, Ordering::Acquire);
        let w = S::load(&self.w, Ordering::Acquire);
        if w >= r {
            w - r
        } else {
            S::load(&self.i, Ordering::Relaxed).saturating_sub(r) + w
        }
    }

    /// # Safety
    /// The range must be inside the storage and not aliased by any other
    /// live slice.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.size);
        std::slice::from_raw_parts_mut(self.data.as_ptr().add(offset), len)
    }

    /// # Safety
    /// The range must be inside the storage and not mutably aliased.
    unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.size);
        std::slice::from_raw_parts(self.data.as_ptr().add(offset), len)
    }
}

impl<S: ThreadSafety> Drop for RawBipBuffer<S> {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.size);
        // SAFETY: `data` came from `Box::leak` of a boxed slice of `size` bytes.
        unsafe { drop(Box::from_raw(slice)) };
    }
}

/// Ring buffer with producer and consumer on the same thread.
pub struct BipBuffer {
    raw: RawBipBuffer<Unsync>,
    write_wrapped: bool,
    read_wrapped: bool,
}

impl BipBuffer {
    /// Create a buffer with `capacity` bytes of storage.
    ///
    /// # Panics
    /// Panics if `capacity` is 2 or less.
    pub fn new(capacity: usize) -> Self {
        Self {
            raw: RawBipBuffer::new(capacity),
            write_wrapped: false,
            read_wrapped: false,
        }
    }

    /// Storage size. At most `capacity() - 1` bytes can be buffered.
    pub fn capacity(&self) -> usize {
        self.raw.size
    }

    /// Acquire exactly `n` contiguous free bytes, or `None` if that much
    /// linear space is not available.
    pub fn write_acquire(&mut self, n: usize) -> Option<&mut [u8]> {
        let offset = self.raw.write_acquire(n, &mut self.write_wrapped)?;
        // SAFETY: the region is free space, and `&mut self` keeps every
        // other slice of this buffer from being alive.
        Some(unsafe { self.raw.slice_mut(offset, n) })
    }

    /// Commit `written` bytes of the last acquired region.
    pub fn write_release(&mut self, written: usize) {
        self.raw.write_release(written, &mut self.write_wrapped);
    }

    /// Longest contiguous readable run; empty when nothing is buffered.
    pub fn read_acquire(&mut self) -> &[u8] {
        let (offset, len) = self.raw.read_acquire(&mut self.read_wrapped);
        // SAFETY: committed bytes, borrowed for no longer than `&mut self`.
        unsafe { self.raw.slice(offset, len) }
    }

    /// Free `read` bytes of the last acquired run.
    pub fn read_release(&mut self, read: usize) {
        self.raw.read_release(read, &mut self.read_wrapped);
    }

    /// Bytes buffered, across the wrap point.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Create a ring buffer shared between one producer and one consumer.
pub fn shared(capacity: usize) -> (Producer, Consumer) {
    let raw = Arc::new(RawBipBuffer::<Atomic>::new(capacity));
    (
        Producer {
            raw: Arc::clone(&raw),
            wrapped: false,
        },
        Consumer {
            raw,
            wrapped: false,
        },
    )
}

/// Writing half of a [`shared`] ring buffer.
pub struct Producer {
    raw: Arc<RawBipBuffer<Atomic>>,
    wrapped: bool,
}

impl Producer {
    pub fn capacity(&self) -> usize {
        self.raw.size
    }

    pub fn write_acquire(&mut self, n: usize) -> Option<&mut [u8]> {
        let offset = self.raw.write_acquire(n, &mut self.wrapped)?;
        // SAFETY: free space is never handed to the consumer until released.
        Some(unsafe { self.raw.slice_mut(offset, n) })
    }

    pub fn write_release(&mut self, written: usize) {
        self.raw.write_release(written, &mut self.wrapped);
    }
}

/// Reading half of a [`shared`] ring buffer.
pub struct Consumer {
    raw: Arc<RawBipBuffer<Atomic>>,
    wrapped: bool,
}

impl Consumer {
    pub fn read_acquire(&mut self) -> &[u8] {
        let (offset, len) = self.raw.read_acquire(&mut self.wrapped);
        // SAFETY: committed bytes are not touched by the producer until
        // the consumer releases them.
        unsafe { self.raw.slice(offset, len) }
    }

    pub fn read_release(&mut self, read: usize) {
        self.raw.read_release(read, &mut self.wrapped);
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
