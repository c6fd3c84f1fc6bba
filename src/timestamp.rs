//! Backend timestamp discipline.
//!
//! Storage nodes resolve conflicting writes by `X-Timestamp` comparison, so
//! the proxy must stamp every mutating backend request with a fixed-width,
//! lexicographically ordered value and never hand out a non-increasing one,
//! even if the wall clock steps backwards between requests.
//!
//! Normal form is `%016.5f` of epoch seconds (ten integer digits, a dot,
//! five fractional digits). The inverse form, `10^10 − t`, sorts newest-first
//! and names archived object versions.

use crate::clock::Clock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Epoch timestamp with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros: u64,
}

impl Timestamp {
    pub fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    pub fn micros(&self) -> u64 {
        self.micros
    }

    /// Parse a backend `X-Timestamp` header value (any float form accepted).
    pub fn parse(value: &str) -> Option<Self> {
        let secs: f64 = value.trim().parse().ok()?;
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        Some(Self { micros: (secs * 1_000_000.0).round() as u64 })
    }

    /// Fixed-width normal form, e.g. `0000001310393199.00000`... ten integer
    /// digits keep values ordered as strings through year 2286.
    pub fn normal(&self) -> String {
        format!("{:016.5}", self.micros as f64 / 1_000_000.0)
    }

    /// Normal form of `10^10 − t`: lexicographically newest-first. Used as the
    /// trailing component of archived version names.
    pub fn inverse(&self) -> String {
        let inv = 10_000_000_000.0 - (self.micros as f64 / 1_000_000.0);
        format!("{:016.5}", inv)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normal())
    }
}

/// Process-wide monotonic timestamp source.
///
/// Backend conflict resolution needs strictly increasing stamps per object
/// key; issuing max(now, last + 1µs) from a single issuer satisfies that for
/// every key this process touches.
#[derive(Debug)]
pub struct TimestampIssuer {
    clock: Arc<dyn Clock>,
    last_micros: AtomicU64,
}

impl TimestampIssuer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, last_micros: AtomicU64::new(0) }
    }

    pub fn next(&self) -> Timestamp {
        let now = self.clock.now_micros();
        let mut prev = self.last_micros.load(Ordering::Acquire);
        loop {
            let candidate = now.max(prev + 1);
            match self.last_micros.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Timestamp::from_micros(candidate),
                Err(observed) => prev = observed,
            }
        }
    }
}
