//! Error taxonomy for the frame pipeline and its serving surface.
//!
//! Each stage reports its own error type so the pipeline can decide, per
//! class, whether to recover, degrade, or refuse to start.

use std::path::PathBuf;

use thiserror::Error;

/// Video open/read failures. Recovered by restarting the source; fatal only
/// while the pipeline is starting up.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("video asset not found at {path:?}")]
    NotFound { path: PathBuf },

    #[error("failed to launch decoder for {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decoder read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("decoder exited with {status} before producing a frame")]
    Decoder { status: String },

    #[error("video asset produced no frames")]
    Empty,

    #[error("source gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<SourceError>,
    },
}

/// Failures of the external detection capability. The adapter turns these
/// into an empty detection list for the cycle.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detector request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("detector returned HTTP {0}")]
    Status(u16),

    #[error("failed to encode frame for detector: {0}")]
    Encode(#[from] image::ImageError),

    #[error("detector response malformed: {0}")]
    Malformed(String),
}

/// Render/encode failures. A failed render aborts the cycle before anything
/// is committed or published.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("encoded frame is {bytes} bytes, limit is {limit}")]
    Oversized { bytes: usize, limit: usize },
}

/// Invalid configuration. Always fatal, reported before serving begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Why a push-channel client was let go.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientDisconnect {
    #[error("client fell {missed} snapshots behind")]
    Lagged { missed: u64 },

    #[error("client write stalled past the cycle deadline")]
    Stalled,

    #[error("hub closed")]
    Closed,
}
