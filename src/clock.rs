//! Clock abstraction so time-based behavior can be faked in tests.
//!
//! The proxy needs wall-clock time in two places: backend `X-Timestamp`
//! values (epoch microseconds, fixed-width) and the error-suppression window.
//! Both read the same injected [`Clock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of epoch time in microseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_micros(&self) -> u64;

    /// Epoch seconds as a float, for timestamp formatting.
    fn now_secs(&self) -> f64 {
        self.now_micros() as f64 / 1_000_000.0
    }
}

/// Production clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Test clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        Self { micros: AtomicU64::new(start_micros) }
    }

    pub fn advance_micros(&self, by: u64) {
        self.micros.fetch_add(by, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, by: f64) {
        self.advance_micros((by * 1_000_000.0) as u64);
    }

    pub fn set_micros(&self, to: u64) {
        self.micros.store(to, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}
