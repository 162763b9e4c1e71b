// THEORY:
// Every failure the engine can produce is one variant of `SpotError`. The batch
// layer converts any of them into a failed `ProgressEvent` for the image that
// raised it, so the variants carry enough context (the offending path, the
// rejected parameter) to be read by a person without the log.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpotError>;

#[derive(Debug, Error)]
pub enum SpotError {
    /// The source image could not be opened or decoded.
    #[error("cannot decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The annotated raster could not be encoded or saved.
    #[error("cannot write {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// A filesystem operation on the output directory or statistics table failed.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("processing timed out after {0:?}")]
    Timeout(Duration),

    /// The image was given up on while it was still running; none of its output was kept.
    #[error("processing abandoned")]
    Abandoned,

    /// The blocking task that was processing an image did not finish normally.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl SpotError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
