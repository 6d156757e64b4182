//! Runtime counters and observability hooks.
//!
//! Everything here is lock-free or bucket-based: drop/admission counters are
//! atomics, and latency percentiles come from fixed-bucket histograms so the
//! hot path never sorts raw samples.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::runtime::message::DropReason;

/// Fixed histogram bucket upper bounds, in milliseconds.
const LATENCY_BUCKETS_MS: [f64; 10] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0];

fn reason_index(reason: DropReason) -> usize {
    match reason {
        DropReason::Expired => 0,
        DropReason::MaxAttempts => 1,
        DropReason::QueueFull => 2,
        DropReason::TopologyViolation => 3,
        DropReason::DedupDuplicate => 4,
        DropReason::InvalidPayload => 5,
    }
}

/// Thread-safe runtime metrics collector.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    admitted: AtomicU64,
    dropped: [AtomicU64; 6],
    retries: AtomicU64,
    switch_commits: AtomicU64,
    switch_aborts: AtomicU64,
    switch_deferrals: AtomicU64,
    prepare_ms_total: AtomicU64,
    quiesce_ms_total: AtomicU64,
    decision_latency: LatencyHistogram,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.dropped[reason_index(reason)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, prepare: Duration, quiesce: Duration) {
        self.switch_commits.fetch_add(1, Ordering::Relaxed);
        self.prepare_ms_total
            .fetch_add(prepare.as_millis() as u64, Ordering::Relaxed);
        self.quiesce_ms_total
            .fetch_add(quiesce.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_abort(&self, prepare: Duration, quiesce: Duration) {
        self.switch_aborts.fetch_add(1, Ordering::Relaxed);
        self.prepare_ms_total
            .fetch_add(prepare.as_millis() as u64, Ordering::Relaxed);
        self.quiesce_ms_total
            .fetch_add(quiesce.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_deferral(&self) {
        self.switch_deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_latency(&self, elapsed: Duration) {
        self.decision_latency.record(elapsed);
    }

    pub fn drop_count(&self, reason: DropReason) -> u64 {
        self.dropped[reason_index(reason)].load(Ordering::Relaxed)
    }

    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut dropped_by_reason = HashMap::new();
        for reason in DropReason::ALL {
            let count = self.drop_count(reason);
            if count > 0 {
                dropped_by_reason.insert(reason, count);
            }
        }

        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            dropped_by_reason,
            retries: self.retries.load(Ordering::Relaxed),
            switch_commits: self.switch_commits.load(Ordering::Relaxed),
            switch_aborts: self.switch_aborts.load(Ordering::Relaxed),
            switch_deferrals: self.switch_deferrals.load(Ordering::Relaxed),
            prepare_ms_total: self.prepare_ms_total.load(Ordering::Relaxed),
            quiesce_ms_total: self.quiesce_ms_total.load(Ordering::Relaxed),
            decision_latency: self.decision_latency.snapshot(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub dropped_by_reason: HashMap<DropReason, u64>,
    pub retries: u64,
    pub switch_commits: u64,
    pub switch_aborts: u64,
    pub switch_deferrals: u64,
    pub prepare_ms_total: u64,
    pub quiesce_ms_total: u64,
    pub decision_latency: HistogramSnapshot,
}

/// Fixed-bucket latency histogram. Percentiles are computed from bucket
/// counts alone; raw samples are never retained.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    // One overflow bucket past the configured bounds.
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket containing the `p`-quantile, in ms.
    /// Returns None when empty; the overflow bucket reports infinity.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let rank = (p.clamp(0.0, 1.0) * total as f64).ceil().max(1.0) as u64;

        let mut cumulative = 0;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= rank {
                return Some(
                    LATENCY_BUCKETS_MS
                        .get(idx)
                        .copied()
                        .unwrap_or(f64::INFINITY),
                );
            }
        }
        Some(f64::INFINITY)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            p50_ms: self.percentile(0.50),
            p95_ms: self.percentile(0.95),
            p99_ms: self.percentile(0.99),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub bounds_ms: Vec<f64>,
    pub counts: Vec<u64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}
