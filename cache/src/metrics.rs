//! Prometheus metrics of a [crate::Cache].

use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;

pub struct Metrics {
    pub entries: Gauge,
    pub attachments: Counter,
    pub prefetched_frames: Counter,
    pub passthrough_frames: Counter,
    pub evicted_frames: Counter,
    pub io_retries: Counter,
    pub io_errors: Counter,
    pub destroyed: Counter,
    pub deferred_destroys: Counter,
    pub detach_stopped_worker: Counter,
    pub detach_reset: Counter,
    pub abort_stopped_worker: Counter,
    pub abort_idle: Counter,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the provided registry.
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            entries: Gauge::default(),
            attachments: Counter::default(),
            prefetched_frames: Counter::default(),
            passthrough_frames: Counter::default(),
            evicted_frames: Counter::default(),
            io_retries: Counter::default(),
            io_errors: Counter::default(),
            destroyed: Counter::default(),
            deferred_destroys: Counter::default(),
            detach_stopped_worker: Counter::default(),
            detach_reset: Counter::default(),
            abort_stopped_worker: Counter::default(),
            abort_idle: Counter::default(),
        };

        registry.register(
            "entries",
            "Number of entries in the registry",
            metrics.entries.clone(),
        );
        registry.register(
            "attachments",
            "Number of times a consumer attached to an entry",
            metrics.attachments.clone(),
        );
        registry.register(
            "prefetched_frames",
            "Number of frames read by prefetch workers",
            metrics.prefetched_frames.clone(),
        );
        registry.register(
            "passthrough_frames",
            "Number of frames read by pass-through readers",
            metrics.passthrough_frames.clone(),
        );
        registry.register(
            "evicted_frames",
            "Number of frames reclaimed by eviction",
            metrics.evicted_frames.clone(),
        );
        registry.register(
            "io_retries",
            "Number of reads retried after a transient failure",
            metrics.io_retries.clone(),
        );
        registry.register(
            "io_errors",
            "Number of reads that failed terminally",
            metrics.io_errors.clone(),
        );
        registry.register(
            "destroyed",
            "Number of entries destroyed",
            metrics.destroyed.clone(),
        );
        registry.register(
            "deferred_destroys",
            "Number of destroys deferred until the consumer detached",
            metrics.deferred_destroys.clone(),
        );
        registry.register(
            "detach_stopped_worker",
            "Number of detaches that stopped a running prefetch worker and reset the entry",
            metrics.detach_stopped_worker.clone(),
        );
        registry.register(
            "detach_reset",
            "Number of detaches that reset the entry after an error or deferred destroy",
            metrics.detach_reset.clone(),
        );
        registry.register(
            "abort_stopped_worker",
            "Number of aborted attachments that stopped a running prefetch worker",
            metrics.abort_stopped_worker.clone(),
        );
        registry.register(
            "abort_idle",
            "Number of aborted attachments without a running prefetch worker",
            metrics.abort_idle.clone(),
        );

        metrics
    }
}
