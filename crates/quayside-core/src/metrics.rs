//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters - no allocations, no locking.
pub struct Metrics {
    runs_started: AtomicU64,
    stages_failed: AtomicU64,
    images_pushed: AtomicU64,
    deploys_applied: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            stages_failed: AtomicU64::new(0),
            images_pushed: AtomicU64::new(0),
            deploys_applied: AtomicU64::new(0),
        }
    }

    pub fn inc_runs(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_started", "counter incremented");
    }

    pub fn inc_stages_failed(&self) {
        self.stages_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stages_failed", "counter incremented");
    }

    /// Add `n` per-platform images pushed by one matrix build.
    pub fn add_images_pushed(&self, n: u64) {
        self.images_pushed.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "images_pushed", n, "counter incremented");
    }

    /// Count a deployment actually applied (not an already-current no-op).
    pub fn inc_deploys(&self) {
        self.deploys_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deploys_applied", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_started = self.runs_started(),
            stages_failed = self.stages_failed(),
            images_pushed = self.images_pushed(),
            deploys_applied = self.deploys_applied(),
        );
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn stages_failed(&self) -> u64 {
        self.stages_failed.load(Ordering::Relaxed)
    }

    pub fn images_pushed(&self) -> u64 {
        self.images_pushed.load(Ordering::Relaxed)
    }

    pub fn deploys_applied(&self) -> u64 {
        self.deploys_applied.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.runs_started.store(0, Ordering::Relaxed);
        self.stages_failed.store(0, Ordering::Relaxed);
        self.images_pushed.store(0, Ordering::Relaxed);
        self.deploys_applied.store(0, Ordering::Relaxed);
    }
}
