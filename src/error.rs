//! mptools error types

use std::path::PathBuf;

/// mptools result type
pub type Result<T> = std::result::Result<T, Error>;

/// mptools errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from candle tensor operations
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },

    /// Checkpoint layout or conversion error
    #[error("checkpoint error: {reason}")]
    CheckpointError {
        /// Description of what went wrong
        reason: String,
    },

    /// Filesystem error, with the path that caused it
    #[error("io error at {}: {source}", path.display())]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
