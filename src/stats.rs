use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Producer-side counters. Shared between the producer thread and the
/// status endpoint; every increment is mirrored to the `metrics` facade.
#[derive(Debug, Default)]
pub struct PipelineStats {
    cycles: AtomicU64,
    frames_published: AtomicU64,
    loops: AtomicU64,
    source_errors: AtomicU64,
    detection_errors: AtomicU64,
    render_errors: AtomicU64,
    skipped_cycles: AtomicU64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub cycles: u64,
    pub frames_published: u64,
    pub loops: u64,
    pub source_errors: u64,
    pub detection_errors: u64,
    pub render_errors: u64,
    pub skipped_cycles: u64,
}

impl PipelineStats {
    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("traffic_cycles_total").increment(1);
    }

    pub fn record_published(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("traffic_frames_published_total").increment(1);
    }

    pub fn record_loop(&self) {
        self.loops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("traffic_loops_total").increment(1);
    }

    pub fn record_source_error(&self) {
        self.source_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("traffic_source_errors_total").increment(1);
    }

    /// Detection failures are counted by the adapter; this only mirrors
    /// its running total into the status view.
    pub fn set_detection_errors(&self, total: u64) {
        self.detection_errors.store(total, Ordering::Relaxed);
    }

    pub fn record_render_error(&self) {
        self.render_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("traffic_render_errors_total").increment(1);
    }

    pub fn record_skipped(&self) {
        self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("traffic_skipped_cycles_total").increment(1);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            loops: self.loops.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            detection_errors: self.detection_errors.load(Ordering::Relaxed),
            render_errors: self.render_errors.load(Ordering::Relaxed),
            skipped_cycles: self.skipped_cycles.load(Ordering::Relaxed),
        }
    }
}
