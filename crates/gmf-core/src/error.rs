//! Error types shared by every GMF layer.
//!
//! Two families live here:
//!
//! - [`IoError`] is the outcome of a blocking bus or port call. It only has
//!   three members so callers can match exhaustively and tell a deliberate
//!   [`IoError::Abort`] apart from a real failure.
//! - [`Error`] covers argument, resource, state and capacity problems raised
//!   by constructors and control APIs.
//!
//! Job flow control (`CONTINUE`, `DONE`, `TRUNCATE`) is not an error and is
//! modelled by [`JobStatus`](crate::JobStatus) instead.

use thiserror::Error;

/// Outcome of an acquire/release call on a bus or port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    /// The call could not be satisfied (bad size, capacity exceeded, foreign payload).
    #[error("bus operation failed")]
    Fail,

    /// The blocking wait elapsed before data or space became available.
    #[error("bus operation timed out")]
    Timeout,

    /// The bus was aborted while the caller was (or would have been) blocked.
    #[error("bus operation aborted")]
    Abort,
}

impl IoError {
    /// Whether this outcome is an expected shutdown rather than a failure.
    ///
    /// Aborts are logged at debug level; everything else deserves an error log.
    pub fn is_abort(self) -> bool {
        matches!(self, IoError::Abort)
    }
}

/// Result alias for bus and port I/O.
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Errors returned by GMF constructors and control operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An argument was out of its accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// An allocation failed while creating or growing a resource.
    #[error("out of memory while allocating {0} bytes")]
    MemoryLack(usize),

    /// The operation is not valid in the object's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A size exceeded the capacity of its destination.
    #[error("size {size} out of range (limit {limit})")]
    OutOfRange {
        /// Requested size.
        size: usize,
        /// Largest size that would have been accepted.
        limit: usize,
    },

    /// The operation is not supported by this object or in this state.
    #[error("not supported: {0}")]
    NotSupport(String),

    /// A named entry (element, method, IO) was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object is not ready yet.
    #[error("not ready: {0}")]
    NotReady(String),

    /// A named entry is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A synchronous control call did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A bus or port call failed.
    #[error(transparent)]
    Io(#[from] IoError),

    /// Generic failure.
    #[error("operation failed: {0}")]
    Fail(String),
}

impl Error {
    /// Create an invalid-argument error.
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Error::InvalidArg(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Create a not-supported error.
    pub fn not_support(msg: impl Into<String>) -> Self {
        Error::NotSupport(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a generic failure.
    pub fn fail(msg: impl Into<String>) -> Self {
        Error::Fail(msg.into())
    }
}

/// Result alias for GMF control operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Allocates a zeroed byte vector, mapping allocator failure to [`Error::MemoryLack`].
pub(crate) fn try_alloc(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::MemoryLack(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- IoError ---

    #[test]
    fn io_errors_are_distinguishable() {
        assert_ne!(IoError::Fail, IoError::Timeout);
        assert_ne!(IoError::Timeout, IoError::Abort);
        assert!(IoError::Abort.is_abort());
        assert!(!IoError::Timeout.is_abort());
        assert!(!IoError::Fail.is_abort());
    }

    #[test]
    fn io_error_converts_into_error() {
        let err: Error = IoError::Timeout.into();
        assert_eq!(err, Error::Io(IoError::Timeout));
        assert_eq!(err.to_string(), "bus operation timed out");
    }

    // --- Display formatting ---

    #[test]
    fn out_of_range_display() {
        let err = Error::OutOfRange { size: 10, limit: 4 };
        assert_eq!(err.to_string(), "size 10 out of range (limit 4)");
    }

    #[test]
    fn factory_helpers_pick_variants() {
        assert!(matches!(Error::invalid_arg("x"), Error::InvalidArg(_)));
        assert!(matches!(Error::invalid_state("x"), Error::InvalidState(_)));
        assert!(matches!(Error::not_support("x"), Error::NotSupport(_)));
        assert!(matches!(Error::not_found("x"), Error::NotFound(_)));
        assert!(matches!(Error::fail("x"), Error::Fail(_)));
    }

    // --- allocation ---

    #[test]
    fn try_alloc_zeroes_buffer() {
        let buf = try_alloc(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
