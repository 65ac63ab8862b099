use crate::detect::{Detector, RawDetection};
use crate::error::DetectionError;
use crate::frame::Frame;

/// Detects nothing. Runs the stream without a model attached.
#[derive(Debug, Default)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, DetectionError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Returns the same detections for every frame.
#[derive(Debug, Clone)]
pub struct StaticDetector {
    detections: Vec<RawDetection>,
}

impl StaticDetector {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self { detections }
    }
}

impl Detector for StaticDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, DetectionError> {
        Ok(self.detections.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}
