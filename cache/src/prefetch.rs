//! Background worker that streams the rest of a backing file into an entry's frames.
//!
//! The worker starts at the end of the valid prefix and reads in batches, but never ahead of the
//! frames the pool has handed over. It is cancelled cooperatively with `stop_worker`, checked once
//! per batch and between retries.

use crate::{
    entry::Entry,
    metrics::Metrics,
    source::{read_frames, File, Identity, Source},
    Phase,
};
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error};

/// Delay between checks for a stopped worker.
const JOIN_POLL: Duration = Duration::from_micros(100);

#[derive(Clone)]
pub(crate) struct Settings {
    pub batch: usize,
    pub retry_delay: Duration,
    pub allocation_poll: Duration,
}

/// Start the prefetch worker for `entry`, opening the backing file as `identity`.
pub(crate) fn spawn<S: Source>(
    source: Arc<S>,
    entry: Arc<Entry>,
    identity: Identity,
    settings: Settings,
    metrics: Arc<Metrics>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("prefetch".into())
        .spawn(move || run(source, entry, identity, settings, metrics))
}

fn run<S: Source>(
    source: Arc<S>,
    entry: Arc<Entry>,
    identity: Identity,
    settings: Settings,
    metrics: Arc<Metrics>,
) {
    // Skip if everything is already cached
    let cursor = {
        let mut state = entry.lock();
        if state.stop_worker {
            state.phase = Phase::Draining;
            return;
        }
        if state.remained == entry.total_frames() {
            state.phase = Phase::Done;
            return;
        }
        state.phase = Phase::Running;
        state.remained
    };
    debug!(path = entry.path(), cursor, "prefetch started");

    let phase = match source.open(entry.path(), &identity) {
        Ok(file) => fill(&file, &entry, cursor, &settings, &metrics),
        Err(err) => {
            error!(path = entry.path(), ?err, "failed to open file");
            metrics.io_errors.inc();
            Phase::Failed
        }
    };

    // The file is closed and the captured identity released before reporting
    drop(identity);
    let mut state = entry.lock();
    state.phase = phase;
    debug!(
        path = entry.path(),
        ?phase,
        remained = state.remained,
        "prefetch exited"
    );
}

fn fill<F: File>(
    file: &F,
    entry: &Entry,
    mut cursor: usize,
    settings: &Settings,
    metrics: &Metrics,
) -> Phase {
    let total = entry.total_frames();
    let frame_size = entry.frame_size() as u64;
    loop {
        // Pick the next batch
        let frames = {
            let state = entry.lock();
            if state.stop_worker {
                return Phase::Draining;
            }
            if cursor >= total || state.read >= total {
                return Phase::Done;
            }
            let count = if state.allocated >= state.remained
                && state.allocated.saturating_sub(cursor) >= settings.batch
            {
                settings.batch
            } else if state.allocated >= total {
                total - cursor
            } else {
                0
            };
            if count == 0 {
                None
            } else {
                state.frames[cursor..cursor + count]
                    .iter()
                    .cloned()
                    .collect::<Option<Vec<_>>>()
            }
        };

        // Wait for the pool to catch up
        let Some(frames) = frames else {
            thread::sleep(settings.allocation_poll);
            continue;
        };

        let count = frames.len();
        let offset = entry.position() + cursor as u64 * frame_size;
        let stopped = || entry.lock().stop_worker;
        match read_frames(file, &frames, offset, settings.retry_delay, stopped, metrics) {
            Ok(true) => {
                let mut state = entry.lock();
                if state.remained == cursor {
                    state.remained += count;
                }
                state.read += count;
                cursor += count;
                metrics.prefetched_frames.inc_by(count as u64);
            }
            Ok(false) => return Phase::Draining,
            Err(err) => {
                error!(path = entry.path(), offset, ?err, "prefetch read failed");
                return Phase::Failed;
            }
        }
    }
}

/// Ask the prefetch worker of `entry` (if any) to stop and wait for it to exit.
///
/// # Panics
///
/// Panics if the worker does not exit within `timeout`.
pub(crate) fn stop(entry: &Entry, timeout: Duration) {
    let handle = {
        let mut state = entry.lock();
        state.stop_worker = true;
        if state.phase == Phase::Running {
            state.phase = Phase::Draining;
        }
        state.worker.take()
    };
    let Some(handle) = handle else {
        return;
    };
    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() > timeout {
            panic!(
                "prefetch worker for {} did not stop within {:?}",
                entry.path(),
                timeout
            );
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        error!(path = entry.path(), "prefetch worker panicked");
    }
}
