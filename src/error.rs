//! Crate-wide error type and result alias.
//!
//! Every fallible operation in the engine returns [`Result`]. I/O failures are
//! wrapped transparently; the remaining variants carry the condition that
//! callers are expected to branch on.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error conditions surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Dimension or quantization-parameter mismatch. Never mutates state.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Identifier is absent (or shadowed by a tombstone).
    #[error("not found")]
    NotFound,

    /// Training corpus cannot supply `2^nbits` distinct points in a subspace.
    #[error("insufficient training data: subspace {subspace} has {distinct} distinct points, {required} centroids requested")]
    InsufficientTrainingData {
        subspace: usize,
        distinct: usize,
        required: usize,
    },

    /// Magic/version/CRC/size mismatch while opening an on-disk artifact.
    #[error("corrupt segment {path:?}: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },

    /// A second live engine holds the store's lock file.
    #[error("store is locked by another engine instance")]
    ConcurrentModification,

    /// Underlying storage failure, propagated as-is.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for shape errors built from format arguments.
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::InvalidShape(msg.into())
    }

    /// Shorthand for corruption errors.
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptSegment {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
