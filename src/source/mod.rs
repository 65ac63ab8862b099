//! Looping frame source.
//!
//! [`VideoOpener`] opens a decoding session over the video asset and
//! [`VideoInput`] reads raw frames from it. [`FrameSource`] owns the single
//! live session, restarts it on exhaustion or failure, and keeps the loop
//! counter.

mod ffmpeg;
mod pattern;

pub use ffmpeg::FfmpegOpener;
pub use pattern::PatternOpener;

use std::thread;
use std::time::Duration;

use chrono::Utc;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::frame::Frame;

/// An open decoding session. Dropping it releases the underlying resource.
pub trait VideoInput: Send {
    /// Reads the next frame, or `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

/// Opens fresh decoding sessions over the same asset.
pub trait VideoOpener: Send {
    fn open(&self) -> Result<Box<dyn VideoInput>, SourceError>;

    /// Human-readable name of the asset, for logs.
    fn describe(&self) -> String;
}

/// Result of one [`FrameSource::next_frame`] call.
#[derive(Debug)]
pub enum SourceEvent {
    Frame(Frame),
    EndOfLoop,
}

const RESTART_BACKOFF: Duration = Duration::from_millis(50);

pub struct FrameSource {
    opener: Box<dyn VideoOpener>,
    input: Option<Box<dyn VideoInput>>,
    pending: Option<RgbImage>,
    restart_attempts: u32,
    loop_number: u64,
    frame_number: u64,
    sequence: u64,
}

impl FrameSource {
    /// Opens the asset and reads its first frame, retrying up to
    /// `restart_attempts` times. Failure here is a startup-fatal condition.
    #[tracing::instrument(skip(opener), fields(asset = %opener.describe()))]
    pub fn start(opener: Box<dyn VideoOpener>, restart_attempts: u32) -> Result<Self, SourceError> {
        let attempts = restart_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            match Self::open_primed(opener.as_ref()) {
                Ok((input, first)) => {
                    info!(attempt, "Video source opened");
                    return Ok(Self {
                        opener,
                        input: Some(input),
                        pending: Some(first),
                        restart_attempts: attempts,
                        loop_number: 1,
                        frame_number: 0,
                        sequence: 0,
                    });
                }
                // A missing file will not appear by retrying.
                Err(err @ SourceError::NotFound { .. }) => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, "Video source failed to open");
                    last = Some(err);
                    if attempt < attempts {
                        thread::sleep(RESTART_BACKOFF);
                    }
                }
            }
        }

        Err(SourceError::Exhausted {
            attempts,
            last: Box::new(last.unwrap_or(SourceError::Empty)),
        })
    }

    fn open_primed(
        opener: &dyn VideoOpener,
    ) -> Result<(Box<dyn VideoInput>, RgbImage), SourceError> {
        let mut input = opener.open()?;
        match input.read_frame()? {
            Some(first) => Ok((input, first)),
            None => Err(SourceError::Empty),
        }
    }

    /// Reads the next frame of the current loop.
    ///
    /// A closed source (after a failed restart) reports `EndOfLoop` so the
    /// caller keeps driving restarts.
    pub fn next_frame(&mut self) -> Result<SourceEvent, SourceError> {
        let pixels = match self.pending.take() {
            Some(pixels) => pixels,
            None => {
                let Some(input) = self.input.as_mut() else {
                    return Ok(SourceEvent::EndOfLoop);
                };
                match input.read_frame()? {
                    Some(pixels) => pixels,
                    None => return Ok(SourceEvent::EndOfLoop),
                }
            }
        };

        self.frame_number += 1;
        self.sequence += 1;
        Ok(SourceEvent::Frame(Frame {
            pixels,
            sequence: self.sequence,
            frame_number: self.frame_number,
            loop_number: self.loop_number,
            captured_at: Utc::now(),
        }))
    }

    /// Closes the current session and reopens the asset from the start.
    ///
    /// On success the loop counter advances by exactly one. On failure the
    /// source is left closed and the loop counter is untouched, so the next
    /// call retries.
    #[tracing::instrument(skip(self), fields(loop_number = self.loop_number))]
    pub fn restart(&mut self) -> Result<u64, SourceError> {
        self.close();

        let mut last = None;
        for attempt in 1..=self.restart_attempts {
            match Self::open_primed(self.opener.as_ref()) {
                Ok((input, first)) => {
                    self.input = Some(input);
                    self.pending = Some(first);
                    self.loop_number += 1;
                    self.frame_number = 0;
                    info!(loop_number = self.loop_number, "Video loop restarted");
                    return Ok(self.loop_number);
                }
                Err(err) => {
                    debug!(attempt, error = %err, "Restart attempt failed");
                    last = Some(err);
                    if attempt < self.restart_attempts {
                        thread::sleep(RESTART_BACKOFF);
                    }
                }
            }
        }

        Err(SourceError::Exhausted {
            attempts: self.restart_attempts,
            last: Box::new(last.unwrap_or(SourceError::Empty)),
        })
    }

    /// Releases the decoding session. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.pending = None;
        if self.input.take().is_some() {
            debug!("Video session closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.input.is_some()
    }

    pub fn loop_number(&self) -> u64 {
        self.loop_number
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
