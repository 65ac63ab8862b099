use image::{Rgb, RgbImage};

use super::{VideoInput, VideoOpener};
use crate::error::SourceError;

/// Synthetic source: a diagonal gradient that scrolls one step per frame and
/// ends after `frames_per_loop` frames. Lets the stream run without a decoder.
pub struct PatternOpener {
    width: u32,
    height: u32,
    frames_per_loop: u64,
}

impl PatternOpener {
    pub fn new(width: u32, height: u32, frames_per_loop: u64) -> Self {
        Self {
            width,
            height,
            frames_per_loop,
        }
    }
}

impl VideoOpener for PatternOpener {
    fn open(&self) -> Result<Box<dyn VideoInput>, SourceError> {
        Ok(Box::new(PatternInput {
            width: self.width,
            height: self.height,
            remaining: self.frames_per_loop,
            offset: 0,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "test-pattern {}x{} ({} frames/loop)",
            self.width, self.height, self.frames_per_loop
        )
    }
}

struct PatternInput {
    width: u32,
    height: u32,
    remaining: u64,
    offset: u32,
}

impl VideoInput for PatternInput {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let offset = self.offset;
        self.offset = self.offset.wrapping_add(4);

        Ok(Some(RgbImage::from_fn(self.width, self.height, |x, y| {
            let v = x.wrapping_add(y).wrapping_add(offset);
            Rgb([(v % 256) as u8, ((v / 2) % 256) as u8, 96])
        })))
    }
}
