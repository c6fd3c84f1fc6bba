//! Node selection walk for one partition: primaries first, then handoffs.
//!
//! Suppressed nodes are skipped without counting against the cap; handoff
//! substitutions are counted and optionally logged so operators can see a
//! cluster leaning on its spares.

use crate::error_limit::ErrorLimiter;
use crate::ring::{Node, Ring};
use std::sync::Arc;

pub struct NodeIterator {
    ring: Arc<Ring>,
    part: u32,
    limiter: Arc<ErrorLimiter>,
    primaries: std::vec::IntoIter<Node>,
    handoffs: Option<std::vec::IntoIter<Node>>,
    cap: usize,
    yielded: usize,
    handoff_count: usize,
    log_handoffs: bool,
}

impl NodeIterator {
    pub fn new(
        ring: Arc<Ring>,
        part: u32,
        limiter: Arc<ErrorLimiter>,
        max_handoffs: usize,
        log_handoffs: bool,
    ) -> Self {
        let primaries = ring.get_part_nodes(part);
        let cap = primaries.len() + max_handoffs;
        Self {
            ring,
            part,
            limiter,
            primaries: primaries.into_iter(),
            handoffs: None,
            cap,
            yielded: 0,
            handoff_count: 0,
            log_handoffs,
        }
    }

    /// Number of handoff nodes yielded so far.
    pub fn handoff_count(&self) -> usize {
        self.handoff_count
    }
}

impl Iterator for NodeIterator {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        while self.yielded < self.cap {
            let (node, is_handoff) = match self.primaries.next() {
                Some(node) => (node, false),
                None => {
                    let handoffs = self
                        .handoffs
                        .get_or_insert_with(|| self.ring.more_nodes(self.part).into_iter());
                    (handoffs.next()?, true)
                }
            };
            if self.limiter.suppressed(&node) {
                continue;
            }
            if is_handoff {
                self.handoff_count += 1;
                if self.log_handoffs {
                    tracing::warn!(
                        node = %node,
                        "handoff requested ({})",
                        self.handoff_count
                    );
                }
            }
            self.yielded += 1;
            return Some(node);
        }
        None
    }
}
