//! Collector statistics.
//!
//! A single [`CollectorStats`] is created by the run-loop and shared by `Arc`
//! with every pipeline stage. Counters are relaxed atomics: they are only read
//! for the periodic stats line and test assertions.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct CollectorStats {
    started: Instant,
    received: AtomicU64,
    rejected: AtomicU64,
    stored: AtomicU64,
    errors: AtomicU64,
    nodes_created: AtomicU64,
    nodes_updated: AtomicU64,
    nodeinfo_triggers: AtomicU64,
    retries: AtomicU64,
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            received: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            nodes_created: AtomicU64::new(0),
            nodes_updated: AtomicU64::new(0),
            nodeinfo_triggers: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_nodes_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_nodes_updated(&self) {
        self.nodes_updated.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_nodeinfo_triggers(&self) {
        self.nodeinfo_triggers.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            uptime: self.started.elapsed(),
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            nodes_updated: self.nodes_updated.load(Ordering::Relaxed),
            nodeinfo_triggers: self.nodeinfo_triggers.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub uptime: Duration,
    pub received: u64,
    pub rejected: u64,
    pub stored: u64,
    pub errors: u64,
    pub nodes_created: u64,
    pub nodes_updated: u64,
    pub nodeinfo_triggers: u64,
    pub retries: u64,
}

impl Snapshot {
    /// Human-readable stats line including store health.
    pub fn report(&self, store_healthy: bool) -> String {
        format!(
            "{}, DB Health: {}",
            self,
            if store_healthy { "ok" } else { "DOWN" }
        )
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.uptime.as_secs();
        write!(
            f,
            "Stats - Runtime: {}h{:02}m{:02}s, Received: {}, Stored: {}, Rejected: {}, Errors: {}, \
             Nodes Created: {}, Nodes Updated: {}, NODEINFO Triggers: {}, Retries: {}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.received,
            self.stored,
            self.rejected,
            self.errors,
            self.nodes_created,
            self.nodes_updated,
            self.nodeinfo_triggers,
            self.retries
        )
    }
}
