/*! Error taxonomy shared by every layer of this crate.

The codec and transport surface typed errors upward; the device façade
narrows exception responses and framing mismatches into [`ProtocolError`]
variants. One-shot modes surface all errors to the caller; the daemon's
polling worker recovers locally from [`Error::Timeout`] and [`Error::Io`]
(see [`crate::daemon`]).
*/

use thiserror::Error;

use crate::frame::ExceptionCode;

/// Semantic mismatch between what the wire returned and what was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The device answered with an exception response.
    #[error("device exception: {0:?}")]
    Exception(ExceptionCode),
    /// The response's function code (or frame kind) didn't match the request.
    #[error("response did not match the requested function")]
    UnexpectedFrame,
    /// The response's transaction-id didn't match the request's.
    #[error("response transaction-id did not match the request")]
    Desync,
    /// Fewer values were decoded than were requested.
    #[error("response carried fewer values than requested")]
    Truncated,
}

/// The closed set of failure modes produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// API misuse, e.g. a quantity outside `[1, 0x7d]`.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// A frame header failed structural validation.
    #[error("bad frame header: {0}")]
    BadHeader(String),

    /// A frame failed structural validation beyond the header.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// A response's register/byte-count bookkeeping didn't add up.
    #[error("corrupt response: {0}")]
    Corrupt(String),

    /// A semantic mismatch between request and response.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The exchange's deadline expired before it completed.
    #[error("exchange timed out")]
    Timeout,

    /// The underlying transport failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A cache was read before it was ever successfully populated.
    #[error("{0} has not been read yet")]
    NotYetRead(&'static str),

    /// A channel index fell outside `[0, 50)`.
    #[error("channel index {0} out of range")]
    OutOfRange(usize),

    /// Unrecoverable daemon setup failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// True for the transport-loss conditions the daemon's polling worker
    /// recovers from by reconnecting (§4.E): timeouts and I/O failures.
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, Error::Timeout | Error::Io(_))
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
