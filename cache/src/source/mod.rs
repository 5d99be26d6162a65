//! Backing files the cache reads from.
//!
//! A [Source] opens the file behind a cached path on behalf of an [Identity] (the requester whose
//! credentials the open is performed with). Reads are positional and vectored: a batch of frames is
//! filled with one call to [File::read_at].
//!
//! Reads that fail with [io::ErrorKind::WouldBlock] or [io::ErrorKind::Interrupted] are considered
//! transient and are retried by the cache. Any other error is terminal.

use crate::{frame::FrameRef, metrics::Metrics};
use std::{io, thread, time::Duration};
use tracing::warn;

mod disk;
mod faulty;
mod memory;

pub use disk::{Disk, DiskBlob};
pub use faulty::{Access, Faulty, FaultyBlob};
pub use memory::{Memory, MemoryBlob};

/// Credentials captured from the requester of a cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Opens backing files.
pub trait Source: Send + Sync + 'static {
    type File: File;

    /// Open `path` with the credentials of `identity`.
    fn open(&self, path: &str, identity: &Identity) -> io::Result<Self::File>;
}

/// An open backing file.
pub trait File: Send + Sync + 'static {
    /// Size of the file (in bytes).
    fn size(&self) -> io::Result<u64>;

    /// Fill `bufs` (in order) with consecutive bytes starting at `offset`.
    ///
    /// Bytes beyond the end of the file are zero-filled.
    fn read_at(&self, bufs: &mut [&mut [u8]], offset: u64) -> io::Result<()>;
}

/// Returns true if a read that failed with `err` should be retried.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Fill `frames` with the file content starting at `offset`, retrying transient failures after
/// `retry_delay` until `stopped` returns true.
///
/// Returns `Ok(false)` if the read was abandoned because `stopped` returned true.
pub(crate) fn read_frames<F: File>(
    file: &F,
    frames: &[FrameRef],
    offset: u64,
    retry_delay: Duration,
    stopped: impl Fn() -> bool,
    metrics: &Metrics,
) -> io::Result<bool> {
    let mut guards: Vec<_> = frames.iter().map(|frame| frame.write()).collect();
    let mut bufs: Vec<&mut [u8]> = guards.iter_mut().map(|guard| &mut guard[..]).collect();
    let mut retries: u64 = 0;
    loop {
        let err = match file.read_at(&mut bufs, offset) {
            Ok(()) => return Ok(true),
            Err(err) => err,
        };
        if !is_transient(&err) {
            metrics.io_errors.inc();
            return Err(err);
        }
        metrics.io_retries.inc();
        if retries % 64 == 0 {
            warn!(offset, retries, ?err, "retrying read");
        }
        retries += 1;
        if stopped() {
            return Ok(false);
        }
        thread::sleep(retry_delay);
    }
}
