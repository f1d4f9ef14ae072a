//! Structured diagnostic events.
//!
//! Collection work emits `tracing` debug events so an embedder can follow
//! what the collector is doing. A [`TraceSerial`] correlates all events of
//! one collection cycle.

use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier for one collection cycle.
///
/// Monotonically increasing across the process; wraps on overflow, which is
/// effectively never at realistic collection frequencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSerial(pub u64);

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Generate the next collection serial.
pub(crate) fn next_serial() -> TraceSerial {
    TraceSerial(NEXT_SERIAL.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn trace_create(serial: TraceSerial, why: &str) {
    tracing::debug!(serial = serial.0, why, "trace_create");
}

pub(crate) fn trace_condemn(serial: TraceSerial, condemned: usize, mortality: f64) {
    tracing::debug!(serial = serial.0, condemned, mortality, "trace_condemn");
}

pub(crate) fn trace_flip(serial: TraceSerial, foundation: usize, not_condemned: usize) {
    tracing::debug!(
        serial = serial.0,
        foundation,
        not_condemned,
        "trace_flip"
    );
}

pub(crate) fn trace_band_advance(serial: TraceSerial, band: u8) {
    tracing::debug!(serial = serial.0, band, "trace_band_advance");
}

pub(crate) fn trace_scan_seg(serial: TraceSerial, base: usize, size: usize, rank: u8) {
    tracing::debug!(serial = serial.0, base, size, rank, "trace_scan_seg");
}

pub(crate) fn trace_reclaim(serial: TraceSerial, reclaimed: usize, preserved: usize) {
    tracing::debug!(serial = serial.0, reclaimed, preserved, "trace_reclaim");
}

pub(crate) fn trace_destroy(serial: TraceSerial, scanned: usize) {
    tracing::debug!(serial = serial.0, scanned, "trace_destroy");
}

pub(crate) fn barrier_hit(base: usize, addr: usize, read: bool, write: bool) {
    tracing::debug!(base, addr, read, write, "barrier_hit");
}

pub(crate) fn single_access(base: usize, addr: usize) {
    tracing::debug!(base, addr, "single_access");
}

pub(crate) fn seg_alloc(base: usize, size: usize, pool: u32) {
    tracing::debug!(base, size, pool, "seg_alloc");
}

pub(crate) fn seg_free(base: usize, size: usize, pool: u32) {
    tracing::debug!(base, size, pool, "seg_free");
}

pub(crate) fn emergency(serial: TraceSerial) {
    tracing::debug!(serial = serial.0, "emergency_mode");
}
