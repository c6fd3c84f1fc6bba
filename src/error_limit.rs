//! Per-node error limiting.
//!
//! Each storage tier keeps one limiter. A node that keeps failing is skipped
//! by node selection until its suppression window lapses; the window is
//! re-armed by every recorded error, so a node only re-enters rotation after
//! a quiet interval. Counters are advisory: readers may observe slightly
//! stale values and that is fine.

use crate::clock::Clock;
use crate::ring::Node;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
struct NodeHealth {
    errors: usize,
    last_error_micros: u64,
}

/// Error counter table for one ring tier, keyed by device id.
#[derive(Debug)]
pub struct ErrorLimiter {
    suppression_limit: usize,
    /// Seconds; negative disables suppression entirely (useful to operators
    /// as an emergency override).
    suppression_interval: f64,
    clock: Arc<dyn Clock>,
    nodes: Mutex<HashMap<u16, NodeHealth>>,
}

impl ErrorLimiter {
    pub fn new(suppression_limit: usize, suppression_interval: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            suppression_limit,
            suppression_interval,
            clock,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Note one failure against a node: connect error, per-I/O timeout, or a
    /// 5xx response. Never called for 4xx.
    pub fn record(&self, node: &Node) {
        let now = self.clock.now_micros();
        let mut nodes = self.lock();
        let health = nodes.entry(node.id).or_insert(NodeHealth { errors: 0, last_error_micros: 0 });
        health.errors += 1;
        health.last_error_micros = now;
        tracing::debug!(node = %node, errors = health.errors, "backend error recorded");
    }

    /// Note a disk-full style failure: the node goes straight past the
    /// suppression limit.
    pub fn record_fatal(&self, node: &Node) {
        let now = self.clock.now_micros();
        let mut nodes = self.lock();
        let health = nodes.entry(node.id).or_insert(NodeHealth { errors: 0, last_error_micros: 0 });
        health.errors = health.errors.max(self.suppression_limit) + 1;
        health.last_error_micros = now;
        tracing::warn!(node = %node, errors = health.errors, "backend fatal error recorded");
    }

    /// Whether node selection should skip this node right now. A lapsed
    /// window clears the counter.
    pub fn suppressed(&self, node: &Node) -> bool {
        let mut nodes = self.lock();
        let Some(health) = nodes.get(&node.id).copied() else {
            return false;
        };
        let age_secs =
            (self.clock.now_micros() as f64 - health.last_error_micros as f64) / 1_000_000.0;
        if age_secs >= self.suppression_interval {
            nodes.remove(&node.id);
            return false;
        }
        let limited = health.errors > self.suppression_limit;
        if limited {
            tracing::warn!(node = %node, errors = health.errors, "node error limited");
        }
        limited
    }

    /// Current error count for a device; 0 if unknown or lapsed.
    pub fn errors(&self, node: &Node) -> usize {
        self.lock().get(&node.id).map(|h| h.errors).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, NodeHealth>> {
        // A poisoned map would only lose advisory counters; recover it.
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
