//! Helpers shared by tests.

use crate::{entry::Entry, frame::Heap};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{
    ops::Range,
    thread,
    time::{Duration, Instant},
};

/// Deterministic file content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Hand `range` of fresh frames to `entry` the way a pool would.
pub fn hand_over(entry: &Entry, heap: &Heap, range: Range<usize>) {
    let mut state = entry.lock();
    for index in range {
        if state.frames[index].is_none() {
            state.frames[index] = Some(heap.allocate());
        }
        state.allocated += 1;
    }
}

/// Poll `condition` until it holds.
///
/// # Panics
///
/// Panics if `condition` does not hold within ten seconds.
pub fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Render `registry` in the text exposition format.
pub fn metrics(registry: &Registry) -> String {
    let mut buffer = String::new();
    encode(&mut buffer, registry).unwrap();
    buffer
}
