//! Error taxonomy for the RXM endpoint core.
//!
//! Mirrors the abstract taxonomy of the design: resource exhaustion surfaces
//! as [`Error::Again`] and is deliberately never logged above `debug`, since
//! it is an ordinary operating condition rather than an anomaly. Protocol and
//! transport failures are distinguished so callers can decide whether a
//! retry is meaningful.

use thiserror::Error;

/// Any error produced by the endpoint core.
///
/// `T` is the transport's own error type, threaded through unchanged so a
/// caller can downcast or match on it without the core needing to know its
/// shape.
#[derive(Debug, Error)]
pub enum Error<T> {
    /// A pool or entry table has no free slot. Equivalent to `EAGAIN`.
    #[error("resource exhausted, try again")]
    Again,

    /// `FI_INJECT` requested for a payload larger than the RXM inject size.
    #[error("message of {size} bytes too large for inject (limit {limit})")]
    MsgTooLarge { size: usize, limit: usize },

    /// A posted receive was removed by [`crate::endpoint::Endpoint::cancel`].
    #[error("operation canceled")]
    Canceled,

    /// `FI_PEEK` found no unexpected message matching the given filter.
    /// Delivered as an error completion (`FI_ENOMSG`), not a call-time error,
    /// since the peek itself succeeded -- it just has nothing to report.
    #[error("no matching message")]
    NoMsg,

    /// An operation requires a bound completion queue that is missing.
    #[error("no completion queue bound")]
    NoCq,

    /// The endpoint is not in a state that permits the requested operation
    /// (e.g. `enable` before `bind`, or any call after `close`).
    #[error("endpoint in wrong state for this operation")]
    BadState,

    /// Caller-supplied arguments are invalid (iov count over limit, `CLAIM`
    /// without a preceding `PEEK`, wire version mismatch, etc).
    #[error("invalid argument")]
    Inval,

    /// A capability was requested that this endpoint configuration does not
    /// provide (e.g. directed receive on an endpoint opened without it).
    #[error("unsupported operation")]
    Unsupported,

    /// Propagated verbatim from the transport.
    #[error(transparent)]
    Transport(#[from] T),
}

impl<T> Error<T> {
    /// True for the one error variant that simply means "retry later, no
    /// state was changed". Split out because callers very commonly want to
    /// treat `Again` differently from every other variant without writing a
    /// full match.
    pub fn is_again(&self) -> bool {
        matches!(self, Error::Again)
    }
}

pub type Result<T, E> = std::result::Result<T, Error<E>>;
