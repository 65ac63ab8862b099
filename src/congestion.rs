//! Rolling-window congestion estimate.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discrete congestion classification of the rolling average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CongestionTier {
    Low,
    Medium,
    High,
}

impl CongestionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for CongestionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier boundaries applied to the rolling average:
/// `avg < low` ⇒ LOW, `avg < high` ⇒ MEDIUM, otherwise HIGH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: u32,
    pub high: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { low: 5, high: 15 }
    }
}

impl Thresholds {
    pub fn classify(&self, average: f64) -> CongestionTier {
        if average < self.low as f64 {
            CongestionTier::Low
        } else if average < self.high as f64 {
            CongestionTier::Medium
        } else {
            CongestionTier::High
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionSample {
    pub vehicle_count: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionReading {
    pub rolling_average: f64,
    pub tier: CongestionTier,
}

/// Fixed-capacity ring of per-frame vehicle counts.
#[derive(Debug, Clone)]
pub struct CongestionWindow {
    samples: VecDeque<CongestionSample>,
    capacity: usize,
    thresholds: Thresholds,
}

impl CongestionWindow {
    /// `capacity` is clamped to at least one sample.
    pub fn new(capacity: usize, thresholds: Thresholds) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            thresholds,
        }
    }

    /// Records a count, evicting the oldest sample when full, and returns the
    /// resulting average and tier.
    pub fn observe(&mut self, vehicle_count: u32, at: DateTime<Utc>) -> CongestionReading {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(CongestionSample { vehicle_count, at });
        self.reading()
    }

    pub fn reading(&self) -> CongestionReading {
        let rolling_average = self.average();
        CongestionReading {
            rolling_average,
            tier: self.thresholds.classify(rolling_average),
        }
    }

    /// Mean of the current contents; zero when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|s| s.vehicle_count as u64).sum();
        total as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
