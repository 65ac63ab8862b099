//! Detection adapter.
//!
//! Wraps any [`Detector`], normalizes its output to [`Detection`] records,
//! applies the confidence threshold and keeps only the vehicle classes the
//! congestion estimate counts.

mod detector;
mod http;
mod stub;

pub use detector::Detector;
pub use http::HttpDetector;
pub use stub::{NullDetector, StaticDetector};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frame::Frame;

/// Vehicle classes the system recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 5] = [
        VehicleClass::Bicycle,
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
    ];

    /// Maps a COCO class id onto a vehicle class.
    pub fn from_coco_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Bicycle),
            2 => Some(Self::Car),
            3 => Some(Self::Motorcycle),
            5 => Some(Self::Bus),
            7 => Some(Self::Truck),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bicycle => "bicycle",
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Bus => "bus",
            Self::Truck => "truck",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleClass {
    type Err = ();

    /// Accepts class names (any case) or numeric COCO ids.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(id) = s.parse::<u32>() {
            return Self::from_coco_id(id).ok_or(());
        }
        match s.to_ascii_lowercase().as_str() {
            "bicycle" | "bike" => Ok(Self::Bicycle),
            "car" => Ok(Self::Car),
            "motorcycle" | "motorbike" => Ok(Self::Motorcycle),
            "bus" => Ok(Self::Bus),
            "truck" => Ok(Self::Truck),
            _ => Err(()),
        }
    }
}

/// Axis-aligned box in frame pixels: top-left corner plus size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }
}

/// Detector output before normalization. `label` is whatever the detector
/// calls the class: a name or a numeric id.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// A normalized vehicle detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub class: VehicleClass,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Log the first failure and then every Nth, so a dead detector does not
/// flood the log at the cycle rate.
const ERROR_LOG_EVERY: u64 = 100;

pub struct DetectionAdapter {
    detector: Box<dyn Detector>,
    threshold: f32,
    errors: u64,
}

impl DetectionAdapter {
    pub fn new(detector: Box<dyn Detector>, threshold: f32) -> Self {
        Self {
            detector,
            threshold,
            errors: 0,
        }
    }

    /// Runs the detector on `frame`. A detector failure yields an empty list
    /// and bumps the error counter.
    pub fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        match self.detector.detect(frame) {
            Ok(raw) => {
                let kept = normalize(raw, self.threshold);
                debug!(frame = frame.sequence, kept = kept.len(), "Detections normalized");
                kept
            }
            Err(err) => {
                self.errors += 1;
                metrics::counter!("traffic_detection_errors_total").increment(1);
                if self.errors == 1 || self.errors % ERROR_LOG_EVERY == 0 {
                    warn!(
                        detector = self.detector.name(),
                        errors = self.errors,
                        error = %err,
                        "Detection failed; continuing with no detections"
                    );
                }
                Vec::new()
            }
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }
}

/// Drops low-confidence and non-vehicle detections, preserving order.
pub fn normalize(raw: Vec<RawDetection>, threshold: f32) -> Vec<Detection> {
    raw.into_iter()
        .filter(|d| d.confidence.is_finite() && d.confidence >= threshold)
        .filter_map(|d| {
            let class = d.label.parse::<VehicleClass>().ok()?;
            Some(Detection {
                class,
                confidence: d.confidence.clamp(0.0, 1.0),
                bbox: d.bbox,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectionError;
    use chrono::Utc;
    use image::RgbImage;

    fn raw(label: &str, confidence: f32) -> RawDetection {
        RawDetection {
            label: label.to_string(),
            confidence,
            bbox: BBox::new(1.0, 2.0, 3.0, 4.0),
        }
    }

    fn frame() -> Frame {
        Frame {
            pixels: RgbImage::new(4, 4),
            sequence: 1,
            frame_number: 1,
            loop_number: 1,
            captured_at: Utc::now(),
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, DetectionError> {
            Err(DetectionError::Status(503))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_class_parsing_accepts_names_and_coco_ids() {
        assert_eq!("Car".parse::<VehicleClass>(), Ok(VehicleClass::Car));
        assert_eq!("motorbike".parse::<VehicleClass>(), Ok(VehicleClass::Motorcycle));
        assert_eq!("7".parse::<VehicleClass>(), Ok(VehicleClass::Truck));
        assert_eq!("5".parse::<VehicleClass>(), Ok(VehicleClass::Bus));
        assert!("0".parse::<VehicleClass>().is_err());
        assert!("person".parse::<VehicleClass>().is_err());
    }

    #[test]
    fn test_normalize_filters_threshold_and_class_preserving_order() {
        let input = vec![
            raw("truck", 0.9),
            raw("person", 0.99),
            raw("car", 0.29),
            raw("bus", 0.3),
            raw("bicycle", f32::NAN),
        ];
        let out = normalize(input, 0.3);

        let classes: Vec<_> = out.iter().map(|d| d.class).collect();
        assert_eq!(classes, vec![VehicleClass::Truck, VehicleClass::Bus]);
    }

    #[test]
    fn test_failure_degrades_to_empty_and_counts() {
        let mut adapter = DetectionAdapter::new(Box::new(Failing), 0.3);

        assert!(adapter.detect(&frame()).is_empty());
        assert!(adapter.detect(&frame()).is_empty());
        assert_eq!(adapter.error_count(), 2);
    }

    #[test]
    fn test_adapter_applies_threshold_to_static_detector() {
        let detector = StaticDetector::new(vec![raw("car", 0.8), raw("car", 0.1)]);
        let mut adapter = DetectionAdapter::new(Box::new(detector), 0.5);

        let out = adapter.detect(&frame());
        assert_eq!(out.len(), 1);
        assert_eq!(adapter.error_count(), 0);
    }
}
