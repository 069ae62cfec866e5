/*
Error types for the feature pipeline.
*/

use std::path::PathBuf;

use thiserror::Error;

use crate::artifact::Stage;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required input (audio, upstream artifact, marker) does not exist.
    #[error("missing input for {track}: {what}")]
    MissingInput { track: String, what: String },

    /// No counterpart artifact of `stage` could be matched to the track.
    #[error("no {stage} artifact matches track {track}")]
    MismatchedIdentity { track: String, stage: Stage },

    /// A stage parameter is out of range. Raised before any file is touched.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode audio {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    #[error("could not resample from {from} Hz to {to} Hz: {reason}")]
    Resample { from: u32, to: u32, reason: String },

    /// A numeric array or marker file exists but has unexpected content.
    #[error("malformed file {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("could not parse marker file {}: {source}", path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(track: impl Into<String>, what: impl Into<String>) -> Self {
        Error::MissingInput {
            track: track.into(),
            what: what.into(),
        }
    }

    /// Skips leave the batch successful; everything else counts as a failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Error::MissingInput { .. } | Error::MismatchedIdentity { .. }
        )
    }
}
