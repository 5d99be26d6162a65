//! The cached content of one backing file.

use crate::{
    frame::{BufferId, FrameRef},
    source::Identity,
    watch::Subscription,
};
use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, Weak},
    thread::JoinHandle,
};

bitflags! {
    /// State bits of an [Entry].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// A consumer is attached: the entry may be neither evicted nor destroyed.
        const DISABLE_SHRINK = 0x1;
        /// The last pass-through read failed.
        const THREAD_IO_ERR = 0x2;
        /// A destroy was requested while a consumer was attached.
        const DEFERRED_DESTROY = 0x4;
    }
}

/// Progress of an [Entry] through the destroy protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// In the registry and usable.
    Live,
    /// Marked for destroy. New attachments are refused but eviction may still drain it.
    Stage1,
    /// Unlinked from the registry and waiting for readers to finish.
    Stage2,
    /// Resources released.
    Freed,
}

/// State of the prefetch worker of an [Entry].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No worker has run since the entry was created.
    Idle,
    /// Reading frames as the consumer hands them over.
    Running,
    /// Asked to stop and not yet exited.
    Draining,
    /// Every frame is cached.
    Done,
    /// Opening or reading the backing file failed. The valid prefix is kept.
    Failed,
}

/// Snapshot of an [Entry]'s bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Frames needed to cache the whole range.
    pub total: usize,
    /// Length of the valid prefix, in frames.
    pub remained: usize,
    /// Frames handed over by the attached consumer.
    pub allocated: usize,
    /// Frames a read has been issued for (the prefetch cursor).
    pub read: usize,
    /// Frames evicted since the last attachment.
    pub reclaimed: usize,
    pub flags: Flags,
    pub stage: Stage,
    pub phase: Phase,
    /// Set once the attachment is committed or torn down. The worker exits when it sees it.
    pub stop_worker: bool,
}

/// Subscription to the parent directory of one or more entries (owned by the cache).
pub(crate) struct DirWatch {
    pub path: String,
    pub subscription: Subscription,
}

pub(crate) struct State {
    pub frames: Vec<Option<FrameRef>>,
    pub remained: usize,
    pub allocated: usize,
    pub read: usize,
    pub reclaimed: usize,
    pub flags: Flags,
    pub stage: Stage,
    pub phase: Phase,
    pub stop_worker: bool,
    pub identity: Option<Identity>,
    pub subscription: Option<Subscription>,
    pub dir: Weak<DirWatch>,
    pub buffer: Option<BufferId>,
    pub worker: Option<JoinHandle<()>>,
}

impl State {
    fn new(total: usize) -> Self {
        Self {
            frames: vec![None; total],
            remained: 0,
            allocated: 0,
            read: 0,
            reclaimed: 0,
            flags: Flags::empty(),
            stage: Stage::Live,
            phase: Phase::Idle,
            stop_worker: false,
            identity: None,
            subscription: None,
            dir: Weak::new(),
            buffer: None,
            worker: None,
        }
    }

    pub fn attached(&self) -> bool {
        self.flags.contains(Flags::DISABLE_SHRINK)
    }

    /// Forget all content and zero the counters.
    ///
    /// Frame references are dropped rather than released: the caller reports a full reclaim so the
    /// pool takes back every frame of the buffer itself.
    pub fn discard(&mut self) {
        self.frames.iter_mut().for_each(|slot| *slot = None);
        self.remained = 0;
        self.allocated = 0;
        self.read = 0;
        self.reclaimed = 0;
    }

    /// Take every frame outside of the valid prefix.
    pub fn take_tail(&mut self) -> Vec<FrameRef> {
        let remained = self.remained;
        self.frames[remained..]
            .iter_mut()
            .filter_map(Option::take)
            .collect()
    }

    /// Returns true if the valid prefix is intact.
    pub fn is_consistent(&self) -> bool {
        self.remained <= self.frames.len()
            && self.remained + self.reclaimed <= self.frames.len()
            && self.frames[..self.remained].iter().all(Option::is_some)
    }
}

/// The cached content of one backing file.
///
/// Frame `i` holds the file bytes starting at `position + i * frame_size`.
pub struct Entry {
    path: String,
    dir: String,
    position: u64,
    length: u64,
    frame_size: usize,
    total: usize,
    state: Mutex<State>,
}

impl Entry {
    pub(crate) fn new(path: &str, position: u64, length: u64, frame_size: usize) -> Arc<Self> {
        let total = length.div_ceil(frame_size as u64) as usize;
        let dir = Path::new(path)
            .parent()
            .and_then(Path::to_str)
            .unwrap_or_default()
            .to_string();
        Arc::new(Self {
            path: path.to_string(),
            dir,
            position,
            length,
            frame_size,
            total,
            state: Mutex::new(State::new(total)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn dir(&self) -> &str {
        &self.dir
    }

    /// Offset in the backing file that frame 0 corresponds to.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of bytes cached by this entry (once fully populated).
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn total_frames(&self) -> usize {
        self.total
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn stats(&self) -> Stats {
        let state = self.lock();
        Stats {
            total: self.total,
            remained: state.remained,
            allocated: state.allocated,
            read: state.read,
            reclaimed: state.reclaimed,
            flags: state.flags,
            stage: state.stage,
            phase: state.phase,
            stop_worker: state.stop_worker,
        }
    }

    /// Returns true if a consumer is attached.
    pub fn is_attached(&self) -> bool {
        self.lock().attached()
    }

    /// Copy `len` bytes starting at `offset` (relative to [Entry::position]) out of the valid
    /// prefix, or return `None` if any of them is not cached.
    pub fn read(&self, offset: u64, len: usize) -> Option<Bytes> {
        let end = offset.checked_add(len as u64)?;
        if end > self.length {
            return None;
        }
        let frame_size = self.frame_size as u64;

        // Grab the frames covering the range
        let first = (offset / frame_size) as usize;
        let last = end.div_ceil(frame_size) as usize;
        let frames: Vec<FrameRef> = {
            let state = self.lock();
            if last > state.remained {
                return None;
            }
            state.frames[first..last]
                .iter()
                .cloned()
                .collect::<Option<_>>()?
        };

        // Copy without holding the entry lock
        let mut out = BytesMut::with_capacity(len);
        let mut pos = offset;
        for frame in frames {
            if pos >= end {
                break;
            }
            let within = (pos % frame_size) as usize;
            let n = (frame_size - within as u64).min(end - pos) as usize;
            out.extend_from_slice(&frame.read()[within..within + n]);
            pos += n as u64;
        }
        Some(out.freeze())
    }
}
