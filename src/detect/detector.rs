use crate::detect::RawDetection;
use crate::error::DetectionError;
use crate::frame::Frame;

/// The external detection capability: accepts a frame, returns detections.
///
/// Implementations run on the producer thread and may block.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, DetectionError>;

    /// Detector name for logs.
    fn name(&self) -> &str;
}
