use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::congestion::{CongestionReading, CongestionTier};
use crate::signal::{Phase, SignalState};

/// Signal portion of a [`Snapshot`]. Times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalView {
    pub phase: Phase,
    pub remaining: f64,
    pub elapsed: f64,
    pub duration: f64,
}

impl SignalView {
    pub fn at(state: &SignalState, now: Instant) -> Self {
        Self {
            phase: state.phase,
            remaining: state.remaining(now).as_secs_f64(),
            elapsed: state.elapsed(now).as_secs_f64(),
            duration: state.phase_duration.as_secs_f64(),
        }
    }
}

/// Per-cycle state published to push clients and `/api/snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub vehicle_count: u32,
    pub rolling_average: f64,
    pub congestion_tier: CongestionTier,
    pub signal: SignalView,
    pub frame_number: u64,
    pub loop_number: u64,
    pub fps: f64,
}

/// Inputs for one cycle's snapshot, gathered by the pipeline.
pub struct SnapshotParts<'a> {
    pub timestamp: DateTime<Utc>,
    pub vehicle_count: u32,
    pub reading: CongestionReading,
    pub signal: &'a SignalState,
    pub now: Instant,
    pub frame_number: u64,
    pub loop_number: u64,
    pub fps: f64,
}

impl Snapshot {
    pub fn build(parts: SnapshotParts<'_>) -> Self {
        Self {
            timestamp: parts.timestamp,
            vehicle_count: parts.vehicle_count,
            rolling_average: parts.reading.rolling_average,
            congestion_tier: parts.reading.tier,
            signal: SignalView::at(parts.signal, parts.now),
            frame_number: parts.frame_number,
            loop_number: parts.loop_number,
            fps: parts.fps,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
