//! Dispatcher time accounting.
//!
//! The dispatcher switches to [`TimeCategory::IoBound`] right before it blocks
//! in the poll engine and back to [`TimeCategory::CpuBound`] once the wait
//! returns. The CPU-bound percentage is therefore the share of wall time the
//! dispatcher spent running callbacks and bookkeeping.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// What the dispatcher is spending its time on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeCategory {
    /// Blocked in the poll engine.
    IoBound = 0,
    /// Running callbacks, jobs, and request application.
    CpuBound = 1,
}

struct Inner {
    current: TimeCategory,
    since: Instant,
    totals: [Duration; 2],
}

/// Wall time split between [`TimeCategory`] values since the last reset.
pub struct TimeMetrics {
    inner: Mutex<Inner>,
}

impl TimeMetrics {
    /// Start accounting in `initial`.
    pub fn new(initial: TimeCategory) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: initial,
                since: Instant::now(),
                totals: [Duration::ZERO; 2],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the running interval and start one in `category`.
    pub fn switch_to(&self, category: TimeCategory) {
        let now = Instant::now();
        let mut inner = self.lock();
        let elapsed = now.saturating_duration_since(inner.since);
        let current = inner.current as usize;
        inner.totals[current] += elapsed;
        inner.current = category;
        inner.since = now;
    }

    /// Share of accounted time spent in `category`, 0..=100.
    pub fn percentage(&self, category: TimeCategory) -> u32 {
        let now = Instant::now();
        let inner = self.lock();
        let mut totals = inner.totals;
        totals[inner.current as usize] += now.saturating_duration_since(inner.since);
        let all = totals[0] + totals[1];
        if all.is_zero() {
            return 0;
        }
        (totals[category as usize].as_nanos() * 100 / all.as_nanos()) as u32
    }

    /// Discard accumulated totals; the current category keeps running.
    pub fn reset_all(&self) {
        let mut inner = self.lock();
        inner.totals = [Duration::ZERO; 2];
        inner.since = Instant::now();
    }
}

impl Default for TimeMetrics {
    fn default() -> Self {
        Self::new(TimeCategory::CpuBound)
    }
}
