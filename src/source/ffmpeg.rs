use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};

use image::RgbImage;
use tracing::{debug, warn};

use super::{VideoInput, VideoOpener};
use crate::error::SourceError;

/// Decodes a video file through an `ffmpeg` child process emitting raw RGB24
/// frames scaled to a fixed size.
pub struct FfmpegOpener {
    path: PathBuf,
    width: u32,
    height: u32,
}

impl FfmpegOpener {
    pub fn new(path: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-nostdin")
            .arg("-i")
            .arg(&self.path)
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", self.width, self.height))
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl VideoOpener for FfmpegOpener {
    fn open(&self) -> Result<Box<dyn VideoInput>, SourceError> {
        if !self.path.is_file() {
            return Err(SourceError::NotFound {
                path: self.path.clone(),
            });
        }

        let mut child = self.command().spawn().map_err(|source| SourceError::Spawn {
            path: self.path.clone(),
            source,
        })?;
        let Some(stdout) = child.stdout.take() else {
            reap(&mut child);
            return Err(SourceError::Spawn {
                path: self.path.clone(),
                source: std::io::Error::other("decoder stdout not captured"),
            });
        };
        debug!(pid = child.id(), path = %self.path.display(), "Decoder started");

        Ok(Box::new(FfmpegInput {
            child,
            stdout,
            frame_len: (self.width as usize) * (self.height as usize) * 3,
            width: self.width,
            height: self.height,
            frames_read: 0,
        }))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

struct FfmpegInput {
    child: Child,
    stdout: ChildStdout,
    frame_len: usize,
    width: u32,
    height: u32,
    frames_read: u64,
}

impl FfmpegInput {
    /// Fills `buf` completely, returning how many bytes arrived before EOF.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }
}

impl VideoInput for FfmpegInput {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let mut buf = vec![0u8; self.frame_len];
        let got = self.fill(&mut buf)?;

        if got == 0 {
            // Clean EOF after frames is the end of the loop; EOF before any
            // frame means the decoder rejected the asset.
            if self.frames_read == 0 {
                let status = self
                    .child
                    .wait()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|err| err.to_string());
                return Err(SourceError::Decoder { status });
            }
            return Ok(None);
        }
        if got < self.frame_len {
            return Err(SourceError::Truncated {
                expected: self.frame_len,
                got,
            });
        }

        self.frames_read += 1;
        RgbImage::from_raw(self.width, self.height, buf)
            .map(Some)
            .ok_or(SourceError::Truncated {
                expected: self.frame_len,
                got,
            })
    }
}

impl Drop for FfmpegInput {
    fn drop(&mut self) {
        reap(&mut self.child);
    }
}

fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        // Already exited is the common case at end of stream.
        if err.kind() != ErrorKind::InvalidInput {
            warn!(error = %err, "Failed to kill decoder");
        }
    }
    let _ = child.wait();
}
