//! Error types shared by the bucket, limiter and connection wrapper.
//!
//! Every failure is per call: nothing is retried internally and nothing is swallowed. Errors
//! raised by a multi-round transfer are paired with the number of bytes that were moved before
//! the failure in a [`TransferError`], so callers can resume or account correctly.
use std::io;

use thiserror::Error;

/// Failure raised by the rate-limiting engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A quota or pacing wait was interrupted by its cancellation token.
    #[error("bandwidth wait was cancelled")]
    Cancelled,

    /// The wrapped read or write failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A bandwidth setter received a value that is not a positive number of bytes per second.
    ///
    /// Pass [`UNLIMITED`](crate::UNLIMITED) to disable throttling explicitly.
    #[error("invalid bandwidth {0} bytes/s; must be positive (use UNLIMITED to disable throttling)")]
    InvalidBandwidth(usize),

    /// A single reservation asked for more tokens than a finite bucket can ever hold.
    #[error("requested {requested} tokens exceeds bucket burst of {burst}")]
    ExceedsBurst { requested: usize, burst: usize },
}

impl Error {
    /// `true` when the error came from a cancelled wait.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::InvalidBandwidth(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            other => io::Error::other(other),
        }
    }
}

/// Error returned by [`LimitedConn::read_limited`](crate::conn::LimitedConn::read_limited) and
/// [`LimitedConn::write_limited`](crate::conn::LimitedConn::write_limited).
///
/// `moved` is the exact number of bytes transferred before `source` occurred.
#[derive(Debug, Error)]
#[error("{source} (after {moved} bytes)")]
pub struct TransferError {
    pub moved: usize,
    #[source]
    pub source: Error,
}

impl TransferError {
    pub(crate) fn new(moved: usize, source: impl Into<Error>) -> Self {
        Self {
            moved,
            source: source.into(),
        }
    }

    /// Consume the error and return the underlying cause.
    pub fn into_source(self) -> Error {
        self.source
    }
}

impl From<TransferError> for io::Error {
    fn from(err: TransferError) -> Self {
        err.source.into()
    }
}
