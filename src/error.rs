//! Error types shared by every pipeline stage.

use thiserror::Error;

/// Errors raised by ingest, clustering and fitting.
///
/// Every stage propagates these to its caller; nothing is retried.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O failure while opening or reading an input file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or truncated trace, toggle file, or missing clock/reset.
    #[error("format error: {0}")]
    Format(String),

    /// Two collections that must line up do not.
    #[error("dimension mismatch: {what} ({left} != {right})")]
    DimensionMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },

    /// The regression solver or a clustering run produced no usable result.
    #[error("degenerate fit: {0}")]
    DegenerateFit(String),

    /// A signal or module name could not be resolved.
    #[error("lookup error: {0} not found")]
    Lookup(String),

    /// The cluster sweep finished without retaining any candidate.
    #[error("no cluster found for k in {min_k}..={max_k}")]
    NoClusterFound { min_k: usize, max_k: usize },
}

/// Shorthand result type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    #[inline]
    pub(crate) fn format(msg: impl Into<String>) -> Error {
        Error::Format(msg.into())
    }

    #[inline]
    pub(crate) fn mismatch(what: &'static str, left: usize, right: usize) -> Error {
        Error::DimensionMismatch { what, left, right }
    }
}
