//! Counters for the backfill engine.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Shared atomic counters: jobs and records processed, snapshot bytes read,
/// and the number of ops currently sitting in buffers.
#[derive(Debug, Default)]
pub struct BackfillMetrics {
    jobs_processed: AtomicU64,
    records_processed: AtomicU64,
    bytes_processed: AtomicU64,
    ops_buffered: AtomicI64,
}

/// Point-in-time read-out of [`BackfillMetrics`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_processed: u64,
    pub records_processed: u64,
    pub bytes_processed: u64,
    pub ops_buffered: i64,
}

impl BackfillMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_job_processed(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_record_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_ops_buffered(&self, count: usize) {
        self.ops_buffered.fetch_add(count as i64, Ordering::Relaxed);
    }

    pub fn record_op_flushed(&self) {
        self.ops_buffered.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_ops_cleared(&self, count: usize) {
        self.ops_buffered.fetch_sub(count as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            ops_buffered: self.ops_buffered.load(Ordering::Relaxed),
        }
    }
}
