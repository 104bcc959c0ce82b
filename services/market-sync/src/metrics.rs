//! Per-symbol sync metrics
//!
//! Counters are `AtomicU64` so the hub can read them from any task while
//! the feed task writes. Latency samples sit behind a `Mutex` and are only
//! touched once per handled event.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters for one symbol's coordinator.
pub struct SyncMetrics {
    // Deltas
    pub deltas_applied: AtomicU64,
    pub deltas_stale: AtomicU64,
    pub deltas_queued: AtomicU64,
    pub deltas_dropped: AtomicU64,

    // Recovery
    pub gaps_detected: AtomicU64,
    pub book_corruptions: AtomicU64,
    pub resyncs_started: AtomicU64,
    pub resyncs_completed: AtomicU64,

    // Snapshots
    pub snapshots_applied: AtomicU64,
    pub snapshots_rejected: AtomicU64,
    pub snapshot_failures: AtomicU64,

    pub malformed_events: AtomicU64,

    // Candles
    pub ticks_ingested: AtomicU64,
    pub ticks_ignored: AtomicU64,
    pub candles_started: AtomicU64,

    pub event_handling_ns: Mutex<LatencyTracker>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            deltas_applied: AtomicU64::new(0),
            deltas_stale: AtomicU64::new(0),
            deltas_queued: AtomicU64::new(0),
            deltas_dropped: AtomicU64::new(0),
            gaps_detected: AtomicU64::new(0),
            book_corruptions: AtomicU64::new(0),
            resyncs_started: AtomicU64::new(0),
            resyncs_completed: AtomicU64::new(0),
            snapshots_applied: AtomicU64::new(0),
            snapshots_rejected: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            malformed_events: AtomicU64::new(0),
            ticks_ingested: AtomicU64::new(0),
            ticks_ignored: AtomicU64::new(0),
            candles_started: AtomicU64::new(0),
            event_handling_ns: Mutex::new(LatencyTracker::new(1000)),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one event took to handle.
    pub fn record_handling(&self, latency_ns: u64) {
        if let Ok(mut tracker) = self.event_handling_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn handling_p99_ns(&self) -> Option<u64> {
        self.event_handling_ns
            .lock()
            .ok()
            .and_then(|tracker| tracker.percentile(99))
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 15] = [
            ("deltas_applied", &self.deltas_applied),
            ("deltas_stale", &self.deltas_stale),
            ("deltas_queued", &self.deltas_queued),
            ("deltas_dropped", &self.deltas_dropped),
            ("gaps_detected", &self.gaps_detected),
            ("book_corruptions", &self.book_corruptions),
            ("resyncs_started", &self.resyncs_started),
            ("resyncs_completed", &self.resyncs_completed),
            ("snapshots_applied", &self.snapshots_applied),
            ("snapshots_rejected", &self.snapshots_rejected),
            ("snapshot_failures", &self.snapshot_failures),
            ("malformed_events", &self.malformed_events),
            ("ticks_ingested", &self.ticks_ingested),
            ("ticks_ignored", &self.ticks_ignored),
            ("candles_started", &self.candles_started),
        ];

        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect();

        if let Ok(tracker) = self.event_handling_ns.lock() {
            m.insert("events_handled".to_string(), tracker.total() as u64);
            if let Some(p50) = tracker.percentile(50) {
                m.insert("event_handling_p50_ns".to_string(), p50);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("event_handling_p99_ns".to_string(), p99);
            }
        }
        m
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
    total: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
            total: 0,
        }
    }

    /// Record a latency sample.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.total += 1;
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p.min(100) * (sorted.len() - 1)) / 100;
        sorted.get(idx).copied()
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    /// Samples currently in the window.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Samples ever recorded.
    pub fn total(&self) -> usize {
        self.total
    }
}
