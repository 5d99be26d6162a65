//! Collection of live entries keyed by path.
//!
//! Readers take a snapshot (a reference-counted list of entries) and never wait on writers.
//! Writers serialize on a registry-wide lock, build a new list, and publish it. Every replaced list
//! is remembered as a retired generation. After an entry is unlinked, [Registry::remove] waits
//! until every retired generation published before the unlink has been dropped by its readers (a
//! grace period), so callers may free the entry's resources once it returns.
//!
//! Snapshots must be held only briefly and never across a call that removes entries.

use crate::{entry::Entry, Error, Flags, Stage};
use std::{
    mem,
    sync::{Arc, Mutex, RwLock, Weak},
    thread,
    time::Duration,
};
use tracing::debug;

type Snapshot = Arc<Vec<Arc<Entry>>>;

/// Delay between checks for outstanding snapshots.
const GRACE_POLL: Duration = Duration::from_micros(50);

#[derive(Default)]
pub(crate) struct Registry {
    writer: Mutex<()>,
    entries: RwLock<Snapshot>,
    retired: Mutex<Vec<Weak<Vec<Arc<Entry>>>>>,
}

impl Registry {
    pub fn snapshot(&self) -> Snapshot {
        self.entries.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Clone every entry out of the current snapshot.
    pub fn entries(&self) -> Vec<Arc<Entry>> {
        self.snapshot().iter().cloned().collect()
    }

    /// Find the linked entry for `path` (regardless of its destroy stage).
    pub fn get(&self, path: &str) -> Option<Arc<Entry>> {
        self.snapshot()
            .iter()
            .find(|entry| entry.path() == path)
            .cloned()
    }

    /// Find the entry for `path`.
    ///
    /// A lookup `for_allocation` re-arms the entry for a new attachment (see [arm]) and fails with
    /// [Error::Busy] if that is not possible. Otherwise the lookup is read-only and returns `None`
    /// for an entry that is being destroyed.
    pub fn find(&self, path: &str, for_allocation: bool) -> Result<Option<Arc<Entry>>, Error> {
        let Some(entry) = self.get(path) else {
            return Ok(None);
        };
        if for_allocation {
            arm(&entry)?;
            return Ok(Some(entry));
        }
        if entry.lock().stage != Stage::Live {
            debug!(path, "lookup during destroy");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Atomically find and re-arm the entry for `path`, or insert the entry built by `make`.
    ///
    /// An existing entry must satisfy `compatible` (it is left untouched otherwise). Returns the
    /// entry and whether it was inserted.
    pub fn find_or_insert(
        &self,
        path: &str,
        compatible: impl FnOnce(&Entry) -> bool,
        make: impl FnOnce() -> Arc<Entry>,
    ) -> Result<(Arc<Entry>, bool), Error> {
        let _writer = self.writer.lock().unwrap();
        if let Some(entry) = self.get(path) {
            if !compatible(&entry) {
                return Err(Error::Invalid("range differs from cached entry"));
            }
            arm(&entry)?;
            return Ok((entry, false));
        }
        let entry = make();
        arm(&entry)?;
        let mut next = Vec::clone(&self.snapshot());
        next.push(entry.clone());
        self.publish(next);
        Ok((entry, true))
    }

    /// Replace the current list with `next` and retire the old one.
    ///
    /// Must be called with the writer lock held.
    fn publish(&self, next: Vec<Arc<Entry>>) {
        let old = mem::replace(&mut *self.entries.write().unwrap(), Arc::new(next));
        let mut retired = self.retired.lock().unwrap();
        retired.retain(|generation| generation.strong_count() > 0);
        retired.push(Arc::downgrade(&old));
    }

    /// Unlink `entry` and wait out the grace period.
    ///
    /// Returns false if the entry was not linked.
    pub fn remove(&self, entry: &Arc<Entry>) -> bool {
        let pending = {
            let _writer = self.writer.lock().unwrap();
            let mut next = Vec::clone(&self.snapshot());
            let Some(index) = next.iter().position(|other| Arc::ptr_eq(other, entry)) else {
                return false;
            };
            next.remove(index);
            self.publish(next);
            self.retired.lock().unwrap().clone()
        };

        // Wait for readers of every earlier generation to finish
        for generation in pending {
            while generation.strong_count() > 0 {
                thread::sleep(GRACE_POLL);
            }
        }
        true
    }
}

/// Prepare `entry` for a new attachment.
///
/// Fails if a consumer is already attached or the entry is being destroyed. Otherwise marks the
/// entry attached, restarts frame accounting, clears the worker stop signal, and starts the read
/// cursor at the valid prefix.
pub(crate) fn arm(entry: &Entry) -> Result<(), Error> {
    let mut state = entry.lock();
    if state.attached()
        || state.stage != Stage::Live
        || state.flags.contains(Flags::DEFERRED_DESTROY)
    {
        return Err(Error::Busy(entry.path().to_string()));
    }
    state.flags.insert(Flags::DISABLE_SHRINK);
    state.allocated = 0;
    state.stop_worker = false;
    state.read = state.remained;
    state.reclaimed = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Barrier,
    };

    #[test_traced]
    fn test_insert_find_remove() {
        let registry = Registry::default();

        // Insert
        let (entry, inserted) = registry
            .find_or_insert("/a", |_| true, || Entry::new("/a", 0, 100, 10))
            .unwrap();
        assert!(inserted);
        assert!(entry.is_attached());
        assert_eq!(registry.len(), 1);

        // Lookup for allocation while attached
        assert!(matches!(registry.find("/a", true), Err(Error::Busy(_))));

        // Read-only lookup
        let found = registry.find("/a", false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &entry));
        assert!(registry.find("/b", false).unwrap().is_none());
        drop(found);

        // Remove
        assert!(registry.remove(&entry));
        assert!(!registry.remove(&entry));
        assert_eq!(registry.len(), 0);
        assert!(registry.get("/a").is_none());
    }

    #[test_traced]
    fn test_arm_resets_counters() {
        let registry = Registry::default();
        let (entry, _) = registry
            .find_or_insert("/a", |_| true, || Entry::new("/a", 0, 100, 10))
            .unwrap();

        // Detach with a partially cached prefix
        {
            let mut state = entry.lock();
            state.flags.remove(Flags::DISABLE_SHRINK);
            state.remained = 4;
            state.allocated = 10;
            state.read = 4;
            state.reclaimed = 2;
            state.stop_worker = true;
        }

        // Re-arm
        let found = registry.find("/a", true).unwrap().unwrap();
        let stats = found.stats();
        assert!(stats.flags.contains(Flags::DISABLE_SHRINK));
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.read, 4);
        assert_eq!(stats.reclaimed, 0);
        assert!(!stats.stop_worker);
    }

    #[test_traced]
    fn test_lookup_during_destroy() {
        let registry = Registry::default();
        let (entry, _) = registry
            .find_or_insert("/a", |_| true, || Entry::new("/a", 0, 100, 10))
            .unwrap();
        {
            let mut state = entry.lock();
            state.flags.remove(Flags::DISABLE_SHRINK);
            state.stage = Stage::Stage1;
        }
        assert!(registry.find("/a", false).unwrap().is_none());
        assert!(matches!(registry.find("/a", true), Err(Error::Busy(_))));
        assert!(matches!(
            registry.find_or_insert("/a", |_| true, || Entry::new("/a", 0, 100, 10)),
            Err(Error::Busy(_))
        ));

        // A deferred destroy also refuses new attachments
        {
            let mut state = entry.lock();
            state.stage = Stage::Live;
            state.flags.insert(Flags::DEFERRED_DESTROY);
        }
        assert!(matches!(registry.find("/a", true), Err(Error::Busy(_))));
    }

    #[test_traced]
    fn test_incompatible_entry_untouched() {
        let registry = Registry::default();
        let (entry, _) = registry
            .find_or_insert("/a", |_| true, || Entry::new("/a", 0, 100, 10))
            .unwrap();
        entry.lock().flags.remove(Flags::DISABLE_SHRINK);
        assert!(matches!(
            registry.find_or_insert("/a", |e| e.length() == 50, || Entry::new("/a", 0, 50, 10)),
            Err(Error::Invalid(_))
        ));
        assert!(!entry.is_attached());
        assert_eq!(registry.len(), 1);
    }

    #[test_traced]
    fn test_concurrent_insert_single_entry() {
        let registry = Arc::new(Registry::default());
        let barrier = Arc::new(Barrier::new(8));

        // Race eight attachments for the same path
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry
                        .find_or_insert("/a", |_| true, || Entry::new("/a", 0, 100, 10))
                        .map(|(_, inserted)| inserted)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Exactly one wins, the others are busy
        assert_eq!(results.iter().filter(|r| matches!(r, Ok(true))).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::Busy(_))))
                .count(),
            7
        );
        assert_eq!(registry.len(), 1);
    }

    #[test_traced]
    fn test_remove_waits_for_readers() {
        let registry = Arc::new(Registry::default());
        let (entry, _) = registry
            .find_or_insert("/a", |_| true, || Entry::new("/a", 0, 100, 10))
            .unwrap();

        // Hold a snapshot on another thread
        let snapshot = registry.snapshot();
        let removed = Arc::new(AtomicBool::new(false));
        let handle = {
            let registry = registry.clone();
            let removed = removed.clone();
            let entry = entry.clone();
            thread::spawn(move || {
                registry.remove(&entry);
                removed.store(true, Ordering::SeqCst);
            })
        };

        // New readers no longer see the entry but removal has not completed
        while registry.len() != 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!removed.load(Ordering::SeqCst));
        assert_eq!(snapshot.len(), 1);

        // Release the snapshot
        drop(snapshot);
        handle.join().unwrap();
        assert!(removed.load(Ordering::SeqCst));
    }

    #[test_traced]
    fn test_remove_waits_for_stale_snapshot() {
        let registry = Arc::new(Registry::default());
        let (entry, _) = registry
            .find_or_insert("/a", |_| true, || Entry::new("/a", 0, 100, 10))
            .unwrap();

        // Hold a snapshot that is then superseded by an unrelated insert
        let stale = registry.snapshot();
        registry
            .find_or_insert("/b", |_| true, || Entry::new("/b", 0, 100, 10))
            .unwrap();
        assert_eq!(registry.len(), 2);

        // Removing the entry must still wait for the stale snapshot
        let removed = Arc::new(AtomicBool::new(false));
        let handle = {
            let registry = registry.clone();
            let removed = removed.clone();
            let entry = entry.clone();
            thread::spawn(move || {
                assert!(registry.remove(&entry));
                removed.store(true, Ordering::SeqCst);
            })
        };
        while registry.len() != 1 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!removed.load(Ordering::SeqCst));
        assert!(stale.iter().any(|other| Arc::ptr_eq(other, &entry)));

        // Release the stale snapshot
        drop(stale);
        handle.join().unwrap();
        assert!(removed.load(Ordering::SeqCst));
        assert!(registry.get("/a").is_none());
        assert!(registry.get("/b").is_some());
    }
}
