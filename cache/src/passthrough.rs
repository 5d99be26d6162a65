//! Synchronous multi-threaded reads of the missing part of an entry.
//!
//! A pass-through read takes over population of the entry from its prefetch worker (stopping and
//! joining it first), then reads everything between the end of the valid prefix and the end of the
//! requested range. The range is split into one equal share per reader thread (each a multiple of
//! the batch size) and a leftover that the calling thread reads itself. No reader outlives the
//! call.
//!
//! Stopping the worker also commits the attachment: a consumer that detaches without ever
//! calling [crate::Cache::read_passthrough] has its content discarded.

use crate::{
    cache::Inner,
    frame::{FrameRef, Pool},
    metrics::Metrics,
    prefetch,
    source::{read_frames, File, Source},
    watch::Watcher,
    Entry, Error, Flags,
};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error};

/// Read `frames` (starting at file `offset`) in batches of `batch` frames, giving up early once
/// another reader has `failed`.
fn read_share<F: File>(
    file: &F,
    frames: &[FrameRef],
    offset: u64,
    batch: usize,
    retry_delay: Duration,
    failed: &AtomicBool,
    metrics: &Metrics,
) -> io::Result<()> {
    let mut offset = offset;
    for chunk in frames.chunks(batch) {
        if failed.load(Ordering::Acquire) {
            return Ok(());
        }
        read_frames(
            file,
            chunk,
            offset,
            retry_delay,
            || failed.load(Ordering::Acquire),
            metrics,
        )?;
        offset += chunk.iter().map(|frame| frame.len() as u64).sum::<u64>();
    }
    Ok(())
}

/// Record the first error seen by any reader.
fn record(failed: &AtomicBool, slot: &Mutex<Option<io::Error>>, err: io::Error) {
    failed.store(true, Ordering::Release);
    slot.lock().unwrap().get_or_insert(err);
}

impl<S: Source, P: Pool, W: Watcher> Inner<S, P, W> {
    pub(crate) fn read_passthrough(
        &self,
        entry: &Arc<Entry>,
        pos: u64,
        len: u64,
    ) -> Result<(), Error> {
        let _serial = self.passthrough.lock().unwrap();
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= entry.length())
            .ok_or(Error::Invalid("range beyond end of entry"))?;
        let frame_size = entry.frame_size() as u64;
        let last = end.div_ceil(frame_size) as usize;

        // Take over population from the prefetch worker
        let identity = {
            let state = entry.lock();
            if !state.attached() {
                return Err(Error::Invalid("entry is not attached"));
            }
            state.identity.clone()
        };
        prefetch::stop(entry, self.cfg.join_timeout);

        // Find what is missing
        let (start, frames) = {
            let state = entry.lock();
            let start = state.remained;
            if last <= start {
                debug!(
                    path = entry.path(),
                    pos,
                    len,
                    remained = start,
                    "range already cached"
                );
                return Ok(());
            }
            if let Some(missing) = state.frames[start..last].iter().position(Option::is_none) {
                return Err(Error::FrameMissing(start + missing));
            }
            let frames: Vec<FrameRef> = state.frames[start..last]
                .iter()
                .flatten()
                .cloned()
                .collect();
            (start, frames)
        };
        let identity = identity.ok_or_else(|| crate::invalid("attached entry has no identity"))?;
        let file = self.source.open(entry.path(), &identity)?;

        // Split into equal shares and a leftover
        let count = frames.len();
        let threads = self.cfg.passthrough_threads.get();
        let batch = self.cfg.passthrough_batch.get();
        let shared = count - count % (threads * batch);
        let share = shared / threads;
        let base = entry.position() + start as u64 * frame_size;
        debug!(
            path = entry.path(),
            start,
            count,
            share,
            leftover = count - shared,
            "pass-through read started"
        );

        let failed = AtomicBool::new(false);
        let first_error = Mutex::new(None);
        let started = AtomicUsize::new(0);
        let retry_delay = self.cfg.retry_delay;
        let metrics = &*self.metrics;
        self.readers.in_place_scope(|scope| {
            let (file, failed, first_error, started) = (&file, &failed, &first_error, &started);
            if share > 0 {
                for (i, chunk) in frames[..shared].chunks(share).enumerate() {
                    let offset = base + (i * share) as u64 * frame_size;
                    scope.spawn(move |_| {
                        started.fetch_add(1, Ordering::AcqRel);
                        if let Err(err) =
                            read_share(file, chunk, offset, batch, retry_delay, failed, metrics)
                        {
                            record(failed, first_error, err);
                        }
                    });
                }

                // Every reader must be running before the leftover is read
                let deadline = Instant::now() + self.cfg.join_timeout;
                while started.load(Ordering::Acquire) < threads {
                    if Instant::now() > deadline {
                        panic!(
                            "pass-through readers did not start within {:?}",
                            self.cfg.join_timeout
                        );
                    }
                    thread::yield_now();
                }
            }

            let offset = base + shared as u64 * frame_size;
            if let Err(err) = read_share(
                file,
                &frames[shared..],
                offset,
                batch,
                retry_delay,
                failed,
                metrics,
            ) {
                record(failed, first_error, err);
            }
        });

        // Surface the first failure
        if let Some(err) = first_error.into_inner().unwrap() {
            entry.lock().flags.insert(Flags::THREAD_IO_ERR);
            error!(path = entry.path(), ?err, "pass-through read failed");
            return Err(Error::Io(err));
        }

        // Extend the valid prefix over the range just read
        {
            let mut state = entry.lock();
            state.remained = last;
            state.read = state.read.max(last);
        }
        self.metrics.passthrough_frames.inc_by(count as u64);
        debug!(path = entry.path(), remained = last, "pass-through read complete");
        Ok(())
    }
}
