//! Counters for bus observability.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Events passed to `publish`.
    pub events_published: AtomicU64,
    /// Listener invocations.
    pub deliveries: AtomicU64,
    /// Invocations that returned an error.
    pub listener_errors: AtomicU64,
    /// Invocations that panicked.
    pub listener_panics: AtomicU64,
    /// Cumulative time spent dispatching, in microseconds.
    pub dispatch_micros: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_publish(&self, deliveries: u64, elapsed_micros: u64) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(deliveries, Ordering::Relaxed);
        self.dispatch_micros.fetch_add(elapsed_micros, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.listener_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.listener_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
            dispatch_micros: self.dispatch_micros.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub deliveries: u64,
    pub listener_errors: u64,
    pub listener_panics: u64,
    pub dispatch_micros: u64,
}

impl MetricsSnapshot {
    pub fn listener_failures(&self) -> u64 {
        self.listener_errors + self.listener_panics
    }
}

/// Measures how long a dispatch takes.
pub(crate) struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub(crate) fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}
