//! Ingestion metrics.
//!
//! Lock-free atomic counters shared by every bulk-insert operator, with a
//! serializable snapshot for the metrics endpoints. All counters use
//! `Relaxed` ordering; snapshot reads are consistent enough for
//! monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters and gauges for the ingest path.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// Rejected or failed `insert` calls.
    pub insert_errors: AtomicU64,
    /// Flushes triggered by the periodic tick.
    pub flush_by_timeout: AtomicU64,
    /// Flushes triggered by the row or buffer threshold.
    pub flush_by_size: AtomicU64,
    /// Flushes that committed.
    pub flush_success: AtomicU64,
    /// Flushes the database rejected or timed out.
    pub flush_error: AtomicU64,
    /// Submissions bounced off a full inbox.
    pub backpressure_hits: AtomicU64,
    /// Flush tasks currently executing (gauge).
    pub active_flushes: AtomicU64,
}

impl IngestMetrics {
    /// Creates a metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a rejected or failed insert.
    pub fn record_insert_error(&self) {
        self.insert_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a flush triggered by the periodic tick.
    pub fn record_flush_by_timeout(&self) {
        self.flush_by_timeout.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a flush triggered by the size threshold.
    pub fn record_flush_by_size(&self) {
        self.flush_by_size.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a committed flush.
    pub fn record_flush_success(&self) {
        self.flush_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed flush.
    pub fn record_flush_error(&self) {
        self.flush_error.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a submission bounced for backpressure.
    pub fn record_backpressure(&self) {
        self.backpressure_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks a flush task as started.
    pub fn flush_started(&self) {
        self.active_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks a flush task as finished. Saturates at zero.
    pub fn flush_finished(&self) {
        self.active_flushes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();
    }

    /// Takes a point-in-time snapshot of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            insert_errors: self.insert_errors.load(Ordering::Relaxed),
            flush_by_timeout: self.flush_by_timeout.load(Ordering::Relaxed),
            flush_by_size: self.flush_by_size.load(Ordering::Relaxed),
            flush_success: self.flush_success.load(Ordering::Relaxed),
            flush_error: self.flush_error.load(Ordering::Relaxed),
            backpressure_hits: self.backpressure_hits.load(Ordering::Relaxed),
            active_flushes: self.active_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`IngestMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Rejected or failed `insert` calls.
    pub insert_errors: u64,
    /// Flushes triggered by the periodic tick.
    pub flush_by_timeout: u64,
    /// Flushes triggered by the size threshold.
    pub flush_by_size: u64,
    /// Flushes that committed.
    pub flush_success: u64,
    /// Flushes the database rejected or timed out.
    pub flush_error: u64,
    /// Submissions bounced off a full inbox.
    pub backpressure_hits: u64,
    /// Flush tasks currently executing.
    pub active_flushes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_starts_at_zero() {
        let m = IngestMetrics::new();
        let s = m.snapshot();
        assert_eq!(s.insert_errors, 0);
        assert_eq!(s.flush_success, 0);
        assert_eq!(s.active_flushes, 0);
    }

    #[test]
    fn counters_accumulate() {
        let m = IngestMetrics::new();
        m.record_flush_by_size();
        m.record_flush_by_size();
        m.record_flush_success();
        m.record_backpressure();
        let s = m.snapshot();
        assert_eq!(s.flush_by_size, 2);
        assert_eq!(s.flush_success, 1);
        assert_eq!(s.backpressure_hits, 1);
    }

    #[test]
    fn gauge_tracks_active_flushes_and_saturates() {
        let m = IngestMetrics::new();
        m.flush_started();
        m.flush_started();
        m.flush_finished();
        assert_eq!(m.snapshot().active_flushes, 1);
        m.flush_finished();
        m.flush_finished();
        assert_eq!(m.snapshot().active_flushes, 0);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let m = IngestMetrics::new();
        m.record_flush_success();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["flush_success"], 1);
        assert_eq!(json["flush_error"], 0);
    }
}
