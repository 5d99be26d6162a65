//! Cache large read-mostly files in frames handed out as zero-copy buffers.
//!
//! [Cache] keeps one [Entry] per backing file (keyed by path). A consumer attaches to an entry with
//! [Cache::create_or_lookup], hands it the frames that will back its exported buffer, and then
//! either waits for the background prefetch worker to stream the file into those frames or calls
//! [Cache::read_passthrough] to read the missing range synchronously across a small thread pool.
//! When the consumer detaches, the frames holding valid content stay behind so the next consumer of
//! the same file starts from a warm cache.
//!
//! # Valid Prefix
//!
//! Cached content always forms a contiguous prefix of the entry's frames: frames `[0, remained)`
//! hold file content and every other slot is logically empty. Population (prefetch and
//! pass-through) only extends the prefix and eviction only shrinks it from the tail. Content near
//! the start of a file is assumed to be consumed first and is therefore retained longest.
//!
//! # Attachment
//!
//! While a consumer is attached (`DISABLE_SHRINK`), the entry cannot be evicted or destroyed. A
//! destroy requested during an attachment is deferred and completed when the consumer detaches. A
//! second consumer requesting the same path during an attachment (or a pending destroy) receives
//! [Error::Busy].
//!
//! # Memory Pressure
//!
//! [Cache::pressure_count] and [Cache::pressure_scan] are the two hooks a memory-pressure
//! collaborator calls to learn how many frames the cache could give back and to reclaim them.
//! Frames are always reclaimed tail-first.
//!
//! # Destroy
//!
//! An entry whose backing file is opened for writing, deleted, or moved (as reported by the
//! configured [watch::Watcher]) or that is explicitly dropped goes through a two-stage destroy:
//! it is first marked, then fully evicted, then unlinked from the registry, and finally freed once
//! no reader can still observe it.
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use zerofs_cache::{
//!     frame::Heap,
//!     source::{Identity, Memory},
//!     watch::Manual,
//!     Cache, Config,
//! };
//!
//! // Back the cache with an in-memory file
//! let source = Memory::default();
//! source.insert("/models/weights.bin", vec![7u8; 64 * 1024]);
//!
//! // Initialize the cache
//! let pool = Heap::new(4096);
//! let mut registry = Registry::default();
//! let cache = Cache::init(
//!     Config::default(),
//!     source,
//!     pool.clone(),
//!     Manual::default(),
//!     &mut registry,
//! )
//! .unwrap();
//!
//! // Attach to the entry and hand it frames
//! let identity = Identity::new(1000, 1000);
//! let entry = cache
//!     .create_or_lookup("/models/weights.bin", 0, 64 * 1024, identity)
//!     .unwrap();
//! for index in 0..entry.total_frames() {
//!     let frame = cache
//!         .frame_for(&entry, index)
//!         .unwrap_or_else(|| pool.allocate());
//!     cache.attach_frame(&entry, index, frame).unwrap();
//! }
//!
//! // Read whatever is still missing and commit the content
//! cache.read_passthrough(&entry, 0, 64 * 1024).unwrap();
//! assert_eq!(entry.read(0, 4).unwrap().as_ref(), &[7, 7, 7, 7]);
//!
//! // Detach (cached frames stay behind for the next consumer)
//! let need_full_reclaim = cache.detach(&entry).unwrap();
//! assert!(!need_full_reclaim);
//! assert_eq!(cache.count(), 16);
//! ```

use commonware_utils::{NZUsize, NZU64};
use std::{
    io,
    num::{NonZeroU64, NonZeroUsize},
    time::Duration,
};
use thiserror::Error;

pub mod frame;
pub mod source;
pub mod watch;

mod cache;
mod destroy;
mod entry;
mod evict;
mod metrics;
mod passthrough;
mod prefetch;
mod registry;

pub use cache::{Cache, Scene, Target};
pub use entry::{Entry, Flags, Phase, Stage, Stats};

#[cfg(test)]
mod mocks;

/// Errors that can occur when interacting with the [Cache].
#[derive(Debug, Error)]
pub enum Error {
    #[error("no entry for path: {0}")]
    NotFound(String),
    #[error("entry busy: {0}")]
    Busy(String),
    #[error("invalid request: {0}")]
    Invalid(&'static str),
    #[error("path too long: {0}")]
    PathTooLong(usize),
    #[error("file too large: {0}")]
    FileTooLarge(u64),
    #[error("cache disabled")]
    Disabled,
    #[error("frame missing: {0}")]
    FrameMissing(usize),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to spawn worker: {0}")]
    Spawn(io::Error),
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Reject a request that violates a structural precondition.
///
/// Such requests should not be reachable through the public contract, so they are fatal in debug
/// builds and logged-and-rejected otherwise.
pub(crate) fn invalid(reason: &'static str) -> Error {
    tracing::error!(reason, "invalid request");
    if cfg!(debug_assertions) {
        panic!("invalid request: {reason}");
    }
    Error::Invalid(reason)
}

/// Configuration for [Cache].
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of each frame (in bytes). Every frame handed to the cache must be this size.
    pub frame_size: NonZeroUsize,

    /// Number of frames the prefetch worker reads per batch.
    pub prefetch_batch: NonZeroUsize,

    /// Number of frames a pass-through reader reads per batch.
    pub passthrough_batch: NonZeroUsize,

    /// Number of threads that split a pass-through read.
    pub passthrough_threads: NonZeroUsize,

    /// Maximum length (in bytes) of a cached path.
    pub max_path_len: usize,

    /// Maximum size of a cached file.
    pub max_file_size: NonZeroU64,

    /// Delay before retrying a read that asked to be retried.
    pub retry_delay: Duration,

    /// Delay before the prefetch worker checks whether more frames were handed over.
    pub allocation_poll: Duration,

    /// How long to wait for a worker or reader thread to start or stop before treating it as a
    /// fatal error.
    pub join_timeout: Duration,

    /// How long a [Scene] hint stays active.
    pub scene_timeout: Duration,

    /// While a [Scene::Segmentation] hint is active, memory pressure is ignored as long as more
    /// than this many frames are available.
    pub scene_watermark: NonZeroUsize,

    /// Evict an entry completely as soon as its consumer detaches.
    pub shrink_on_release: bool,

    /// Subscribe to changes of cached files (and their parent directories).
    pub watch: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_size: NZUsize!(4096),
            prefetch_batch: NZUsize!(32),
            passthrough_batch: NZUsize!(128),
            passthrough_threads: NZUsize!(4),
            max_path_len: 511,
            max_file_size: NZU64!(2 << 30),
            retry_delay: Duration::from_millis(4),
            allocation_poll: Duration::from_millis(8),
            join_timeout: Duration::from_secs(30),
            scene_timeout: Duration::from_secs(10),
            scene_watermark: NZUsize!((2 << 30) / 4096),
            shrink_on_release: false,
            watch: true,
        }
    }
}
