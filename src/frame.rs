use chrono::{DateTime, Utc};
use image::RgbImage;

/// A decoded video frame, immutable once produced by the source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: RgbImage,
    /// Monotonic across loops; never resets.
    pub sequence: u64,
    /// 1-based position inside the current loop.
    pub frame_number: u64,
    /// 1-based loop index.
    pub loop_number: u64,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}
