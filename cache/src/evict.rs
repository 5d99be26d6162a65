//! Tail-first reclamation of cached frames.
//!
//! Entries are visited in registry order and frames are always removed from the end of the valid
//! prefix, so the start of every file (assumed to be consumed first) is kept longest. The entry lock
//! is taken once per removed frame and never held across the whole scan.

use crate::{
    cache::Inner,
    frame::Pool,
    source::Source,
    watch::Watcher,
    Entry, Stage,
};
use std::sync::Arc;
use tracing::debug;

impl<S: Source, P: Pool, W: Watcher> Inner<S, P, W> {
    /// Number of cached frames in entries without an attached consumer.
    pub(crate) fn count(&self) -> usize {
        self.registry
            .snapshot()
            .iter()
            .map(|entry| {
                let state = entry.lock();
                if state.attached() {
                    0
                } else {
                    state.remained
                }
            })
            .sum()
    }

    /// Reclaim up to `target` frames from `only` (or from every entry), returning how many were
    /// reclaimed. A `target` of zero reclaims nothing and returns [Inner::count].
    pub(crate) fn scan(&self, target: usize, only: Option<&Arc<Entry>>) -> usize {
        if target == 0 {
            return self.count();
        }
        let entries = match only {
            Some(entry) => vec![entry.clone()],
            None => self.registry.entries(),
        };
        let mut reclaimed = 0;
        for entry in &entries {
            if reclaimed >= target {
                break;
            }
            reclaimed += self.evict(entry, target - reclaimed);
        }
        debug!(target, reclaimed, "scan complete");
        reclaimed
    }

    /// Remove up to `max` frames from the tail of `entry`'s valid prefix.
    pub(crate) fn evict(&self, entry: &Entry, max: usize) -> usize {
        let mut reclaimed = 0;
        while reclaimed < max {
            let frame = {
                let mut state = entry.lock();
                if state.attached() || state.remained == 0 || state.stage >= Stage::Stage2 {
                    break;
                }
                state.remained -= 1;
                state.reclaimed += 1;
                let index = state.remained;
                state.frames[index].take()
            };
            if let Some(frame) = frame {
                self.pool.release(frame);
            }
            reclaimed += 1;
        }
        self.metrics.evicted_frames.inc_by(reclaimed as u64);
        reclaimed
    }
}
