//! Engine counters.
//!
//! Plain atomics updated from the probe workers and the emitter; exporters
//! read them through [`EngineMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    probes_dispatched: AtomicU64,
    probes_succeeded: AtomicU64,
    probes_failed: AtomicU64,
    probes_skipped: AtomicU64,
    probes_active: AtomicU64,
    overruns: AtomicU64,
    outcomes_discarded: AtomicU64,
    transitions: AtomicU64,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    publish_retries: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub probes_dispatched: u64,
    pub probes_succeeded: u64,
    pub probes_failed: u64,
    pub probes_skipped: u64,
    pub probes_active: u64,
    pub overruns: u64,
    pub outcomes_discarded: u64,
    pub transitions: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub publish_retries: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe_started(&self) {
        self.probes_dispatched.fetch_add(1, Ordering::Relaxed);
        self.probes_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_finished(&self, success: bool) {
        self.probes_active.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.probes_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.probes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Probe skipped by an open circuit
    pub fn probe_skipped(&self) {
        self.probes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Task dispatched more than one interval after its due time
    pub fn overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outcome_discarded(&self) {
        self.outcomes_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            probes_dispatched: self.probes_dispatched.load(Ordering::Relaxed),
            probes_succeeded: self.probes_succeeded.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
            probes_skipped: self.probes_skipped.load(Ordering::Relaxed),
            probes_active: self.probes_active.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            outcomes_discarded: self.outcomes_discarded.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
        }
    }
}
