//! Two-stage removal of an entry.
//!
//! An entry is first marked (`Stage1`), which refuses new attachments while eviction drains its
//! frames. Once empty it is unlinked from the registry (`Stage2`) and, after every reader that may
//! still observe it has finished, its subscriptions and frames are released (`Freed`). Stages only
//! move forward and every transition happens under the entry lock.
//!
//! A destroy requested while a consumer is attached is recorded with
//! [crate::Flags::DEFERRED_DESTROY] and completed when the consumer detaches.

use crate::{
    cache::Inner,
    entry::DirWatch,
    frame::{FrameRef, Pool},
    source::Source,
    watch::{Event, Watcher},
    Entry, Error, Flags, Stage,
};
use std::{
    mem,
    sync::{Arc, Weak},
};
use tracing::{debug, error, info};

/// Result of a destroy request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Destroyed,
    /// A consumer is attached: the destroy completes when it detaches.
    Deferred,
    /// Another caller already destroyed (or is destroying) the entry.
    InProgress,
}

impl<S: Source, P: Pool, W: Watcher> Inner<S, P, W> {
    /// Destroy `entry`: mark it, evict every frame, unlink it, and free it.
    pub(crate) fn destroy(&self, entry: &Arc<Entry>) -> Result<Outcome, Error> {
        let _serial = self.destroying.lock().unwrap();
        if let Some(outcome) = self.mark(entry) {
            return Ok(outcome);
        }
        self.evict(entry, usize::MAX);
        self.unlink(entry)?;
        self.free(entry);
        Ok(Outcome::Destroyed)
    }

    /// Enter `Stage1`, or return why the destroy cannot proceed.
    fn mark(&self, entry: &Entry) -> Option<Outcome> {
        let mut state = entry.lock();
        if state.stage != Stage::Live {
            return Some(Outcome::InProgress);
        }
        if state.attached() {
            if !state.flags.contains(Flags::DEFERRED_DESTROY) {
                state.flags.insert(Flags::DEFERRED_DESTROY);
                self.metrics.deferred_destroys.inc();
                info!(path = entry.path(), "destroy deferred");
            }
            return Some(Outcome::Deferred);
        }
        state.flags.remove(Flags::DEFERRED_DESTROY);
        state.stage = Stage::Stage1;
        None
    }

    /// Enter `Stage2` and remove `entry` from the registry.
    fn unlink(&self, entry: &Arc<Entry>) -> Result<(), Error> {
        let drained = {
            let mut state = entry.lock();
            let drained =
                state.stage == Stage::Stage1 && !state.attached() && state.remained == 0;
            if drained {
                state.stage = Stage::Stage2;
            }
            drained
        };
        if !drained {
            return Err(crate::invalid("unlinking an entry that is not drained"));
        }
        if !self.registry.remove(entry) {
            error!(path = entry.path(), "destroyed entry was not registered");
        }
        Ok(())
    }

    /// Release everything `entry` still holds.
    fn free(&self, entry: &Entry) {
        let (frames, subscription, dir) = {
            let mut state = entry.lock();
            state.stage = Stage::Freed;
            state.identity = None;
            state.buffer = None;
            let frames: Vec<FrameRef> = mem::take(&mut state.frames)
                .into_iter()
                .flatten()
                .collect();
            (frames, state.subscription.take(), mem::take(&mut state.dir))
        };
        for frame in frames {
            self.pool.release(frame);
        }
        if let Some(subscription) = subscription {
            self.watcher.unsubscribe(subscription);
        }
        self.release_dir(entry.dir(), dir);
        self.metrics.entries.dec();
        self.metrics.destroyed.inc();
        info!(path = entry.path(), "entry destroyed");
    }

    /// Drop the subscription to `dir` once no registered entry lives there.
    fn release_dir(&self, dir: &str, watch: Weak<DirWatch>) {
        let mut dirs = self.dirs.lock().unwrap();
        if !dirs
            .get(dir)
            .is_some_and(|current| Weak::as_ptr(&watch) == Arc::as_ptr(current))
        {
            return;
        }
        if self
            .registry
            .snapshot()
            .iter()
            .any(|other| other.dir() == dir)
        {
            return;
        }
        if let Some(watch) = dirs.remove(dir) {
            self.watcher.unsubscribe(watch.subscription);
            debug!(dir = watch.path, "stopped watching directory");
        }
    }

    pub(crate) fn on_file_event(&self, entry: &Arc<Entry>, event: Event) {
        debug!(path = entry.path(), ?event, "file changed");
        match self.destroy(entry) {
            Ok(outcome) => debug!(path = entry.path(), ?outcome, "destroy requested"),
            Err(err) => error!(path = entry.path(), ?err, "failed to destroy entry"),
        }
    }

    pub(crate) fn on_dir_event(&self, dir: &str, event: Event) {
        debug!(dir, ?event, "directory changed");
        for entry in self
            .registry
            .entries()
            .into_iter()
            .filter(|entry| entry.dir() == dir)
        {
            if let Err(err) = self.destroy(&entry) {
                error!(path = entry.path(), ?err, "failed to destroy entry");
            }
        }

        // Deferred entries keep the directory watched until they are freed
        let mut dirs = self.dirs.lock().unwrap();
        if self
            .registry
            .snapshot()
            .iter()
            .any(|other| other.dir() == dir)
        {
            debug!(dir, "directory still holds entries");
            return;
        }
        if let Some(watch) = dirs.remove(dir) {
            self.watcher.unsubscribe(watch.subscription);
            debug!(dir = watch.path, "stopped watching directory");
        }
    }
}
