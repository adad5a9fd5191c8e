//! Lightweight global metrics for bootclone.
//!
//! Process-wide atomic counters for:
//! - Snapshots (created / released / active)
//! - Sparse pump (bytes, skipped chunks, abandoned extents)
//! - External tools
//! - Pipeline steps

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Snapshots -----
static SNAPSHOTS_CREATED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_RELEASED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_ACTIVE: AtomicU64 = AtomicU64::new(0);

// ----- Pump -----
static PUMP_BYTES_READ: AtomicU64 = AtomicU64::new(0);
static PUMP_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static PUMP_CHUNKS_SKIPPED: AtomicU64 = AtomicU64::new(0);
static PUMP_EXTENTS_ABANDONED: AtomicU64 = AtomicU64::new(0);

// ----- Tools -----
static TOOL_INVOCATIONS: AtomicU64 = AtomicU64::new(0);
static TOOL_FAILURES: AtomicU64 = AtomicU64::new(0);

// ----- Pipeline -----
static STEPS_PERFORMED: AtomicU64 = AtomicU64::new(0);
static STEPS_FAILED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub snapshots_created: u64,
    pub snapshots_released: u64,
    pub snapshots_active: u64,

    pub pump_bytes_read: u64,
    pub pump_bytes_written: u64,
    pub pump_chunks_skipped: u64,
    pub pump_extents_abandoned: u64,

    pub tool_invocations: u64,
    pub tool_failures: u64,

    pub steps_performed: u64,
    pub steps_failed: u64,
}

impl MetricsSnapshot {
    /// Share of read bytes that actually had to be written.
    pub fn write_ratio(&self) -> f64 {
        if self.pump_bytes_read == 0 {
            0.0
        } else {
            self.pump_bytes_written as f64 / self.pump_bytes_read as f64
        }
    }
}

// ----- Recorders (Snapshots) -----
pub fn record_snapshot_created() {
    SNAPSHOTS_CREATED.fetch_add(1, Ordering::Relaxed);
    SNAPSHOTS_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_released() {
    SNAPSHOTS_RELEASED.fetch_add(1, Ordering::Relaxed);
    SNAPSHOTS_ACTIVE
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
        .ok();
}

// ----- Recorders (Pump) -----
pub fn record_pump_transfer(read: u64, written: u64) {
    PUMP_BYTES_READ.fetch_add(read, Ordering::Relaxed);
    PUMP_BYTES_WRITTEN.fetch_add(written, Ordering::Relaxed);
}

pub fn record_chunk_skipped() {
    PUMP_CHUNKS_SKIPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_extent_abandoned() {
    PUMP_EXTENTS_ABANDONED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Tools) -----
pub fn record_tool_run(success: bool) {
    TOOL_INVOCATIONS.fetch_add(1, Ordering::Relaxed);
    if !success {
        TOOL_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
}

// ----- Recorders (Pipeline) -----
pub fn record_step(success: bool) {
    if success {
        STEPS_PERFORMED.fetch_add(1, Ordering::Relaxed);
    } else {
        STEPS_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

// ----- Snapshot / Reset -----
pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        snapshots_created: SNAPSHOTS_CREATED.load(Ordering::Relaxed),
        snapshots_released: SNAPSHOTS_RELEASED.load(Ordering::Relaxed),
        snapshots_active: SNAPSHOTS_ACTIVE.load(Ordering::Relaxed),

        pump_bytes_read: PUMP_BYTES_READ.load(Ordering::Relaxed),
        pump_bytes_written: PUMP_BYTES_WRITTEN.load(Ordering::Relaxed),
        pump_chunks_skipped: PUMP_CHUNKS_SKIPPED.load(Ordering::Relaxed),
        pump_extents_abandoned: PUMP_EXTENTS_ABANDONED.load(Ordering::Relaxed),

        tool_invocations: TOOL_INVOCATIONS.load(Ordering::Relaxed),
        tool_failures: TOOL_FAILURES.load(Ordering::Relaxed),

        steps_performed: STEPS_PERFORMED.load(Ordering::Relaxed),
        steps_failed: STEPS_FAILED.load(Ordering::Relaxed),
    }
}
