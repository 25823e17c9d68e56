use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors surfaced by the encode pipeline.
///
/// Only `Configuration`, `Persistence`, `FailureThresholdExceeded`,
/// `NoChunkCommitted` and `Interrupted` ever reach the caller of a run. The
/// rest describe a single chunk and end up as the reason an unresolved chunk
/// is reported with.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("chunk {chunk}: frame count mismatch ({actual}/{expected} actual/expected frames)")]
    ProbeMismatch {
        chunk:    String,
        expected: usize,
        actual:   usize,
    },

    #[error("{failures} encoder failures exceeded the allowed maximum of {threshold}")]
    FailureThresholdExceeded { failures: usize, threshold: usize },

    #[error("checkpoint {path:?} could not be read or written: {source}")]
    Persistence {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "chunk {chunk}: committing {frames} frames would exceed the session total ({committed} \
         committed of {total})"
    )]
    FrameTotalExceeded {
        chunk:     String,
        frames:    usize,
        committed: usize,
        total:     usize,
    },

    #[error("only {distinct} distinct probe score(s), cannot interpolate")]
    InterpolationDegenerate { distinct: usize },

    #[error("chunk {chunk}: quality probe failed: {reason}")]
    ProbeFailed { chunk: String, reason: String },

    #[error("no chunk could be committed ({attempted} attempted)")]
    NoChunkCommitted { attempted: usize },

    #[error("encoding was interrupted")]
    Interrupted,
}

impl PipelineError {
    #[inline]
    pub fn persistence(path: impl Into<PathBuf>, source: impl Into<io::Error>) -> Self {
        Self::Persistence {
            path:   path.into(),
            source: source.into(),
        }
    }
}
