//! Metrics collection for the fetch engine

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Fetch metrics collector
#[derive(Debug, Default)]
pub struct FetchMetrics {
    pub requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub cancelled_requests: AtomicU64,
    pub records_fetched: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub workers_started: AtomicU64,
    pub partition_failures: AtomicU64,
    pub fetch_latency_sum: AtomicU64,
    pub fetch_latency_count: AtomicU64,
}

impl FetchMetrics {
    /// Record a finished request
    pub fn record_fetch(
        &self,
        record_count: u64,
        byte_count: u64,
        latency: Duration,
        cancelled: bool,
    ) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.records_fetched.fetch_add(record_count, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(byte_count, Ordering::Relaxed);
        self.fetch_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.fetch_latency_count.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.cancelled_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a request that failed before returning an outcome
    pub fn record_failed_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_workers_started(&self, count: u64) {
        self.workers_started.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_partition_failures(&self, count: u64) {
        self.partition_failures.fetch_add(count, Ordering::Relaxed);
    }

    /// Get average fetch latency in microseconds
    pub fn average_fetch_latency_us(&self) -> f64 {
        let sum = self.fetch_latency_sum.load(Ordering::Relaxed);
        let count = self.fetch_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            workers_started: self.workers_started.load(Ordering::Relaxed),
            partition_failures: self.partition_failures.load(Ordering::Relaxed),
            average_fetch_latency_us: self.average_fetch_latency_us(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    pub records_fetched: u64,
    pub bytes_fetched: u64,
    pub workers_started: u64,
    pub partition_failures: u64,
    pub average_fetch_latency_us: f64,
}

/// Timing helper for measuring request latency
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
