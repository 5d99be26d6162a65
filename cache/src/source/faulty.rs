//! A [Source] wrapper for exercising failure and concurrency paths.
//!
//! Failures are injected per read. Every read is also recorded as an [Access] stamped with the
//! reading thread and a global sequence number taken when the read starts and when it finishes, so
//! tests can check which reads overlapped. A closed gate holds reads after they start.

use super::{File, Identity, Source};
use std::{
    io,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

/// One read observed by [Faulty].
#[derive(Clone, Debug)]
pub struct Access {
    /// Name of the reading thread (`"unnamed"` if it has none).
    pub thread: String,
    pub offset: u64,
    pub started: u64,
    pub finished: u64,
}

#[derive(Default)]
struct Faults {
    transient: AtomicUsize,
    fail_from: Mutex<Option<u64>>,
    delay: Mutex<Duration>,
    attempts: AtomicUsize,
    reads: AtomicUsize,

    sequence: AtomicU64,
    accesses: Mutex<Vec<Access>>,
    closed: Mutex<bool>,
    opened: Condvar,
    waiting: AtomicUsize,
}

impl Faults {
    /// Block while the gate is closed.
    fn pass_gate(&self) {
        let mut closed = self.closed.lock().unwrap();
        if !*closed {
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        while *closed {
            closed = self.opened.wait(closed).unwrap();
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [Source] wrapper that injects read failures and records reads.
#[derive(Clone)]
pub struct Faulty<S> {
    inner: S,
    faults: Arc<Faults>,
}

impl<S: Source> Faulty<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    /// Fail the next `count` reads with [io::ErrorKind::WouldBlock].
    pub fn inject_transient(&self, count: usize) {
        self.faults.transient.store(count, Ordering::SeqCst);
    }

    /// Fail every read touching bytes at or beyond `offset` (or stop failing with `None`).
    pub fn fail_from(&self, offset: Option<u64>) {
        *self.faults.fail_from.lock().unwrap() = offset;
    }

    /// Sleep for `delay` before every read.
    pub fn delay(&self, delay: Duration) {
        *self.faults.delay.lock().unwrap() = delay;
    }

    /// Hold every read that starts from now on until [Faulty::open_gate].
    pub fn close_gate(&self) {
        *self.faults.closed.lock().unwrap() = true;
    }

    pub fn open_gate(&self) {
        *self.faults.closed.lock().unwrap() = false;
        self.faults.opened.notify_all();
    }

    /// Number of reads currently held by the gate.
    pub fn waiting(&self) -> usize {
        self.faults.waiting.load(Ordering::SeqCst)
    }

    /// Number of reads attempted (including injected failures).
    pub fn attempts(&self) -> usize {
        self.faults.attempts.load(Ordering::SeqCst)
    }

    /// Number of reads that completed.
    pub fn reads(&self) -> usize {
        self.faults.reads.load(Ordering::SeqCst)
    }

    /// Every finished read, in the order they finished.
    pub fn accesses(&self) -> Vec<Access> {
        self.faults.accesses.lock().unwrap().clone()
    }
}

impl<S: Source> Source for Faulty<S> {
    type File = FaultyBlob<S::File>;

    fn open(&self, path: &str, identity: &Identity) -> io::Result<Self::File> {
        Ok(FaultyBlob {
            inner: self.inner.open(path, identity)?,
            faults: self.faults.clone(),
        })
    }
}

/// A file opened from [Faulty].
pub struct FaultyBlob<F> {
    inner: F,
    faults: Arc<Faults>,
}

impl<F: File> FaultyBlob<F> {
    fn attempt(&self, bufs: &mut [&mut [u8]], offset: u64) -> io::Result<()> {
        let delay = *self.faults.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.faults.attempts.fetch_add(1, Ordering::SeqCst);

        // Transient failures are consumed first
        let transient = self.faults.transient.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |remaining| remaining.checked_sub(1),
        );
        if transient.is_ok() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "injected retry"));
        }

        // Check for a terminal failure in range
        let len: u64 = bufs.iter().map(|buf| buf.len() as u64).sum();
        if let Some(fail_from) = *self.faults.fail_from.lock().unwrap() {
            if offset + len > fail_from {
                return Err(io::Error::other("injected failure"));
            }
        }

        self.inner.read_at(bufs, offset)?;
        self.faults.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<F: File> File for FaultyBlob<F> {
    fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    fn read_at(&self, bufs: &mut [&mut [u8]], offset: u64) -> io::Result<()> {
        let started = self.faults.sequence.fetch_add(1, Ordering::SeqCst);
        self.faults.pass_gate();
        let result = self.attempt(bufs, offset);
        let finished = self.faults.sequence.fetch_add(1, Ordering::SeqCst);
        self.faults.accesses.lock().unwrap().push(Access {
            thread: thread::current().name().unwrap_or("unnamed").to_string(),
            offset,
            started,
            finished,
        });
        result
    }
}
