//! Frames backing cached content and the pool that owns them.
//!
//! The cache never allocates frames itself. A [Pool] hands frames to an [crate::Entry] (through
//! [crate::Cache::attach_frame]) and receives them back once eviction no longer needs them.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// A fixed-size unit of memory holding part of a cached file.
pub struct Frame {
    data: RwLock<Box<[u8]>>,
}

/// Shared reference to a [Frame].
pub type FrameRef = Arc<Frame>;

impl Frame {
    /// Create a zeroed frame of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0; size].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the frame for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().unwrap()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().unwrap()
    }
}

/// Identifier of a zero-copy buffer exported to a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Owner of the frames referenced by the cache.
pub trait Pool: Send + Sync + 'static {
    /// Take back a frame the cache evicted (or otherwise no longer references).
    fn release(&self, frame: FrameRef);
}

/// A [Pool] that allocates frames on the heap and tracks how many are outstanding.
#[derive(Clone)]
pub struct Heap {
    frame_size: usize,
    allocated: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl Heap {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            allocated: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate a new zeroed frame.
    pub fn allocate(&self) -> FrameRef {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Arc::new(Frame::new(self.frame_size))
    }

    /// Number of frames allocated so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of frames returned by the cache so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }
}

impl Pool for Heap {
    fn release(&self, frame: FrameRef) {
        self.released.fetch_add(1, Ordering::Relaxed);
        drop(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_heap_accounting() {
        let heap = Heap::new(16);

        // Allocate a few frames
        let frames: Vec<_> = (0..3).map(|_| heap.allocate()).collect();
        assert_eq!(heap.allocated(), 3);
        assert_eq!(heap.released(), 0);
        assert!(frames.iter().all(|frame| frame.len() == 16));
        assert!(frames[0].read().iter().all(|byte| *byte == 0));

        // Write into one frame
        frames[1].write()[..4].copy_from_slice(b"zero");
        assert_eq!(&frames[1].read()[..4], b"zero");

        // Return them
        for frame in frames {
            heap.release(frame);
        }
        assert_eq!(heap.allocated(), 3);
        assert_eq!(heap.released(), 3);
    }
}
