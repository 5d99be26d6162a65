//! The public face of the cache.
//!
//! [Cache] owns the registry, the pass-through thread pool, and the directory subscriptions, and
//! implements the consumer lifecycle: attach (with [Cache::create_or_lookup]), hand over frames,
//! commit with [Cache::read_passthrough], and [Cache::detach] or [Cache::abort]. Memory pressure is
//! served by [Cache::pressure_count] and [Cache::pressure_scan], and a [Scene] temporarily bounds
//! how many frames may stay cached.

use crate::{
    entry::DirWatch,
    frame::{BufferId, FrameRef, Pool},
    metrics::Metrics,
    prefetch, registry,
    source::{File, Identity, Source},
    watch::{Callback, Watcher},
    Config, Entry, Error, Flags, Stage,
};
use prometheus_client::registry::Registry;
use rayon::ThreadPoolBuilder;
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Workload hint that changes how eagerly the cache gives memory back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scene {
    Default,
    /// A memory-hungry workload is running: keep cached content while plenty of memory is free.
    Segmentation,
}

/// What a drop or trim applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target<'a> {
    Path(&'a str),
    All,
}

/// State shared by every handle to a [Cache] and by the callbacks it registers.
pub(crate) struct Inner<S: Source, P: Pool, W: Watcher> {
    pub me: Weak<Self>,
    pub cfg: Config,
    pub source: Arc<S>,
    pub pool: P,
    pub watcher: W,
    pub registry: registry::Registry,
    pub metrics: Arc<Metrics>,
    pub readers: rayon::ThreadPool,

    /// Serializes pass-through reads.
    pub passthrough: Mutex<()>,
    /// Serializes destroys.
    pub destroying: Mutex<()>,
    /// Parent directory subscriptions, shared by every entry in the directory.
    pub dirs: Mutex<HashMap<String, Arc<DirWatch>>>,

    scene: Mutex<Option<(Scene, Instant)>>,
    enabled: AtomicBool,
}

impl<S: Source, P: Pool, W: Watcher> Inner<S, P, W> {
    pub(crate) fn settings(&self) -> prefetch::Settings {
        prefetch::Settings {
            batch: self.cfg.prefetch_batch.get(),
            retry_delay: self.cfg.retry_delay,
            allocation_poll: self.cfg.allocation_poll,
        }
    }

    /// Subscribe to changes of `entry`'s file and of its parent directory.
    fn watch(&self, entry: &Arc<Entry>) -> io::Result<()> {
        let me = self.me.clone();
        let weak = Arc::downgrade(entry);
        let callback: Callback = Arc::new(move |event| {
            if let (Some(inner), Some(entry)) = (me.upgrade(), weak.upgrade()) {
                inner.on_file_event(&entry, event);
            }
        });
        let subscription = self.watcher.subscribe(entry.path(), callback)?;
        entry.lock().subscription = Some(subscription);

        if let Some(dir) = self.dir_watch(entry.dir())? {
            entry.lock().dir = Arc::downgrade(&dir);
        }
        Ok(())
    }

    /// Get (or create) the subscription to `dir`.
    fn dir_watch(&self, dir: &str) -> io::Result<Option<Arc<DirWatch>>> {
        if dir.is_empty() {
            return Ok(None);
        }
        let mut dirs = self.dirs.lock().unwrap();
        if let Some(watch) = dirs.get(dir) {
            return Ok(Some(watch.clone()));
        }
        let me = self.me.clone();
        let path = dir.to_string();
        let callback: Callback = Arc::new(move |event| {
            if let Some(inner) = me.upgrade() {
                inner.on_dir_event(&path, event);
            }
        });
        let subscription = self.watcher.subscribe(dir, callback)?;
        let watch = Arc::new(DirWatch {
            path: dir.to_string(),
            subscription,
        });
        dirs.insert(dir.to_string(), watch.clone());
        debug!(dir, "watching directory");
        Ok(Some(watch))
    }
}

/// Page-granular cache of backing files, handing cached frames to consumers of exported buffers.
///
/// Cloning a [Cache] returns another handle to the same cache.
pub struct Cache<S: Source, P: Pool, W: Watcher> {
    pub(crate) inner: Arc<Inner<S, P, W>>,
}

impl<S: Source, P: Pool, W: Watcher> Clone for Cache<S, P, W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Source, P: Pool, W: Watcher> Cache<S, P, W> {
    /// Initialize a new, empty cache reading from `source`, returning frames to `pool`, and
    /// learning about file changes from `watcher`.
    ///
    /// Metrics are registered in `registry`.
    pub fn init(
        cfg: Config,
        source: S,
        pool: P,
        watcher: W,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let readers = ThreadPoolBuilder::new()
            .num_threads(cfg.passthrough_threads.get())
            .thread_name(|i| format!("passthrough-{i}"))
            .build()?;
        let metrics = Arc::new(Metrics::new(registry));
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            cfg,
            source: Arc::new(source),
            pool,
            watcher,
            registry: registry::Registry::default(),
            metrics,
            readers,
            passthrough: Mutex::new(()),
            destroying: Mutex::new(()),
            dirs: Mutex::new(HashMap::new()),
            scene: Mutex::new(None),
            enabled: AtomicBool::new(true),
        });
        Ok(Self { inner })
    }

    /// Attach to the entry caching `length` bytes of `path` starting at `start_offset` (creating
    /// it on a miss) and start its prefetch worker with the credentials of `identity`.
    ///
    /// `length` is clamped to the end of the file. Fails with [Error::Busy] if another consumer is
    /// attached to the entry or the entry is being destroyed.
    pub fn create_or_lookup(
        &self,
        path: &str,
        start_offset: u64,
        length: u64,
        identity: Identity,
    ) -> Result<Arc<Entry>, Error> {
        let inner = &self.inner;
        if !inner.enabled.load(Ordering::Acquire) {
            return Err(Error::Disabled);
        }
        if path.len() > inner.cfg.max_path_len {
            return Err(Error::PathTooLong(path.len()));
        }
        if length == 0 {
            return Err(Error::Invalid("empty range"));
        }
        let frame_size = inner.cfg.frame_size.get();
        if start_offset % frame_size as u64 != 0 {
            return Err(Error::Invalid("offset not aligned to frame size"));
        }

        // Validate the request against the file
        let size = inner.source.open(path, &identity)?.size()?;
        if size > inner.cfg.max_file_size.get() {
            return Err(Error::FileTooLarge(size));
        }
        if start_offset >= size {
            return Err(Error::Invalid("offset beyond end of file"));
        }
        let length = length.min(size - start_offset);

        // Find or create the entry
        let (entry, inserted) = inner.registry.find_or_insert(
            path,
            |existing| existing.position() == start_offset && existing.length() == length,
            || Entry::new(path, start_offset, length, frame_size),
        )?;
        if inserted {
            inner.metrics.entries.inc();
            if inner.cfg.watch {
                if let Err(err) = inner.watch(&entry) {
                    error!(path, ?err, "failed to watch file");
                    entry.lock().flags.remove(Flags::DISABLE_SHRINK);
                    inner.destroy(&entry)?;
                    return Err(Error::Io(err));
                }
            }
            info!(
                path,
                position = start_offset,
                frames = entry.total_frames(),
                "entry created"
            );
        }
        inner.metrics.attachments.inc();

        // Start populating the entry
        entry.lock().identity = Some(identity.clone());
        match prefetch::spawn(
            inner.source.clone(),
            entry.clone(),
            identity,
            inner.settings(),
            inner.metrics.clone(),
        ) {
            Ok(handle) => entry.lock().worker = Some(handle),
            Err(err) => {
                error!(path, ?err, "failed to spawn prefetch worker");
                entry.lock().stop_worker = true;
                self.abort(&entry)?;
                return Err(Error::Spawn(err));
            }
        }
        debug!(path, remained = entry.stats().remained, "attached");
        Ok(entry)
    }

    /// Find the entry for `path` without attaching to it.
    pub fn lookup(&self, path: &str) -> Result<Arc<Entry>, Error> {
        self.inner
            .registry
            .find(path, false)?
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    /// Hand `frame` to the attached `entry` as the backing of frame `index`.
    ///
    /// A slot that already holds cached content keeps it (pass the frame returned by
    /// [Cache::frame_for] to share it).
    pub fn attach_frame(&self, entry: &Entry, index: usize, frame: FrameRef) -> Result<(), Error> {
        if frame.len() != entry.frame_size() {
            return Err(Error::Invalid("frame size mismatch"));
        }
        if index >= entry.total_frames() {
            return Err(Error::Invalid("frame index out of range"));
        }
        let mut state = entry.lock();
        if !state.attached() {
            return Err(Error::Invalid("entry is not attached"));
        }
        if state.frames[index].is_none() {
            state.frames[index] = Some(frame);
        }
        state.allocated += 1;
        Ok(())
    }

    /// Cached frame `index` of `entry`, if it is part of the valid prefix.
    pub fn frame_for(&self, entry: &Entry, index: usize) -> Option<FrameRef> {
        let state = entry.lock();
        if index >= state.remained {
            return None;
        }
        state.frames[index].clone()
    }

    /// Record the exported buffer backed by the attached `entry`.
    pub fn attach_buffer(&self, entry: &Entry, buffer: BufferId) -> Result<(), Error> {
        let mut state = entry.lock();
        if !state.attached() {
            return Err(Error::Invalid("entry is not attached"));
        }
        state.buffer = Some(buffer);
        Ok(())
    }

    /// Find the entry backing `buffer`.
    pub fn find_by_buffer(&self, buffer: BufferId) -> Option<Arc<Entry>> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .find(|entry| {
                let state = entry.lock();
                state.buffer == Some(buffer) && state.stage < Stage::Stage2
            })
            .cloned()
    }

    /// Detach the consumer from `entry`.
    ///
    /// Returns true if the entry was reset and the pool must reclaim every frame of the buffer
    /// itself (the consumer never committed, the last pass-through read failed, or a destroy is
    /// pending). Otherwise the valid prefix stays cached and every other frame is released.
    pub fn detach(&self, entry: &Arc<Entry>) -> Result<bool, Error> {
        let inner = &self.inner;
        let committed = {
            let state = entry.lock();
            if !state.attached() {
                return Err(Error::Invalid("entry is not attached"));
            }
            state.stop_worker
        };
        if !committed {
            prefetch::stop(entry, inner.cfg.join_timeout);
        }

        let (reset, deferred, full, tail) = {
            let mut state = entry.lock();
            let reset = !committed
                || state
                    .flags
                    .intersects(Flags::THREAD_IO_ERR | Flags::DEFERRED_DESTROY);
            let tail = if reset {
                state.discard();
                state.flags.remove(Flags::THREAD_IO_ERR);
                Vec::new()
            } else {
                let tail = state.take_tail();
                state.allocated = state.remained;
                tail
            };
            state.flags.remove(Flags::DISABLE_SHRINK);
            state.identity = None;
            state.buffer = None;
            (
                reset,
                state.flags.contains(Flags::DEFERRED_DESTROY),
                state.remained == entry.total_frames(),
                tail,
            )
        };
        for frame in tail {
            inner.pool.release(frame);
        }
        if !committed {
            inner.metrics.detach_stopped_worker.inc();
            warn!(path = entry.path(), "detached before commit");
        } else if reset {
            inner.metrics.detach_reset.inc();
        }
        info!(path = entry.path(), reset, deferred, "detached");

        if deferred {
            inner.destroy(entry)?;
        } else if !full && inner.cfg.shrink_on_release {
            inner.scan(usize::MAX, Some(entry));
        }
        Ok(reset)
    }

    /// Abandon an attachment whose frames could not all be allocated.
    pub fn abort(&self, entry: &Arc<Entry>) -> Result<(), Error> {
        let inner = &self.inner;
        let running = {
            let state = entry.lock();
            if !state.attached() {
                return Err(Error::Invalid("entry is not attached"));
            }
            !state.stop_worker
        };
        if running {
            prefetch::stop(entry, inner.cfg.join_timeout);
        }

        let (deferred, tail) = {
            let mut state = entry.lock();
            let tail = if running {
                state.discard();
                Vec::new()
            } else {
                state.allocated = 0;
                state.take_tail()
            };
            state.flags.remove(Flags::DISABLE_SHRINK);
            state.identity = None;
            state.buffer = None;
            (state.flags.contains(Flags::DEFERRED_DESTROY), tail)
        };
        for frame in tail {
            inner.pool.release(frame);
        }
        if running {
            inner.metrics.abort_stopped_worker.inc();
        } else {
            inner.metrics.abort_idle.inc();
        }
        info!(path = entry.path(), running, "aborted");

        if deferred {
            inner.destroy(entry)?;
        }
        Ok(())
    }

    /// Read `len` bytes at `pos` (relative to the entry's position) into `entry`'s frames now,
    /// taking over from the prefetch worker.
    ///
    /// Every frame up to the end of the range must have been handed over. Calling this (even for
    /// a range that is already cached) commits the attachment.
    pub fn read_passthrough(&self, entry: &Arc<Entry>, pos: u64, len: u64) -> Result<(), Error> {
        self.inner.read_passthrough(entry, pos, len)
    }

    /// Destroy the entry for a path (or every entry).
    ///
    /// Entries with an attached consumer are destroyed once it detaches.
    pub fn drop_cached(&self, target: Target<'_>) -> Result<(), Error> {
        let inner = &self.inner;
        match target {
            Target::Path(path) => {
                let entry = inner
                    .registry
                    .get(path)
                    .ok_or_else(|| Error::NotFound(path.to_string()))?;
                let outcome = inner.destroy(&entry)?;
                debug!(path, ?outcome, "dropped");
            }
            Target::All => {
                for entry in inner.registry.entries() {
                    inner.destroy(&entry)?;
                }
            }
        }
        Ok(())
    }

    /// Evict up to `frames` frames without destroying any entry.
    pub fn trim(&self, target: Target<'_>, frames: usize) -> Result<usize, Error> {
        if frames == 0 {
            return Err(Error::Invalid("nothing to trim"));
        }
        let inner = &self.inner;
        let reclaimed = match target {
            Target::Path(path) => {
                let entry = inner
                    .registry
                    .find(path, false)?
                    .ok_or_else(|| Error::NotFound(path.to_string()))?;
                inner.scan(frames, Some(&entry))
            }
            Target::All => inner.scan(frames, None),
        };
        info!(frames, reclaimed, "trimmed");
        Ok(reclaimed)
    }

    /// Number of frames eviction could reclaim right now.
    pub fn count(&self) -> usize {
        self.inner.count()
    }

    /// Reclaim up to `target` frames tail-first from `only` (or from every entry). A `target` of
    /// zero only counts.
    pub fn scan(&self, target: usize, only: Option<&Arc<Entry>>) -> usize {
        self.inner.scan(target, only)
    }

    /// How many frames the memory-pressure collaborator may ask for, given how many frames are
    /// still available system-wide.
    pub fn pressure_count(&self, available_frames: usize) -> usize {
        if self.scene() == Scene::Segmentation
            && available_frames > self.inner.cfg.scene_watermark.get()
        {
            return 0;
        }
        self.inner.count()
    }

    /// Reclaim up to `frames` frames on behalf of the memory-pressure collaborator.
    pub fn pressure_scan(&self, frames: usize) -> usize {
        if frames == 0 {
            return 0;
        }
        self.inner.scan(frames, None)
    }

    /// Set the workload hint. Anything but [Scene::Default] expires after the configured timeout.
    pub fn set_scene(&self, scene: Scene) {
        let mut current = self.inner.scene.lock().unwrap();
        *current = match scene {
            Scene::Default => None,
            scene => Some((scene, Instant::now())),
        };
        debug!(?scene, "scene set");
    }

    /// The active workload hint.
    pub fn scene(&self) -> Scene {
        let mut current = self.inner.scene.lock().unwrap();
        match *current {
            Some((scene, since)) if since.elapsed() < self.inner.cfg.scene_timeout => scene,
            Some(_) => {
                *current = None;
                Scene::Default
            }
            None => Scene::Default,
        }
    }

    /// Enable or disable the cache. Disabling destroys every entry without a consumer.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), Error> {
        let inner = &self.inner;
        inner.enabled.store(enabled, Ordering::Release);
        info!(enabled, "cache toggled");
        if enabled {
            return Ok(());
        }
        for entry in inner.registry.entries() {
            if !entry.is_attached() {
                inner.destroy(&entry)?;
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Number of entries in the registry.
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
