//! Error types for rpcmux.
//!
//! Two layers:
//! - [`ClientError`] is the public error every client operation returns.
//!   It carries exactly one [`ErrorKind`] so callers can branch on the
//!   failure class (timeout, connection, server, overflow, canceled).
//! - [`WireError`] is internal to the connection loops. A writer or reader
//!   terminates with a `WireError`; the supervisor wraps it into a
//!   connection-kind `ClientError` and delivers it to every pending waiter.

use thiserror::Error;

/// Failure class of a [`ClientError`]. Exactly one kind per error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The waiter's deadline elapsed before a response arrived.
    Timeout,
    /// Dial, handshake, encode/decode, or stream failure. The connection
    /// is torn down and re-established; the affected calls fail.
    Connection,
    /// The server answered with a non-empty error string.
    Server,
    /// The submission queue was full and no room could be made.
    /// Increase `pending_requests` if these are frequent.
    Overflow,
    /// The call was canceled before it was written to the wire.
    Canceled,
}

/// Error returned from client operations.
///
/// Cloneable so a single connection failure can be delivered to every
/// pending call on that connection.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ClientError {
    kind: ErrorKind,
    message: String,
}

impl ClientError {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub(crate) fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub(crate) fn overflow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overflow, message)
    }

    /// The canceled sentinel delivered when a call is dropped before encode.
    pub(crate) fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "the call has been canceled")
    }

    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_connection(&self) -> bool {
        self.kind == ErrorKind::Connection
    }

    pub fn is_server(&self) -> bool {
        self.kind == ErrorKind::Server
    }

    pub fn is_overflow(&self) -> bool {
        self.kind == ErrorKind::Overflow
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }
}

/// Connection-level fault raised by the codec or a connection loop.
///
/// Fatal to the connection that raised it, never to the client: the
/// supervisor folds it into a connection-kind [`ClientError`] for every
/// affected call and reconnects.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot encode request: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("cannot decode response: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("corrupt compressed record: {0}")]
    Corrupt(std::io::Error),

    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("unexpected response id {0} obtained from server")]
    UnknownResponseId(u64),

    #[error("the server didn't return {0} responses yet; closing the connection to prevent resource leaks")]
    TooManyPending(usize),
}

/// Result alias for codec and connection-loop operations.
pub type WireResult<T> = Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_predicates() {
        assert!(ClientError::timeout("t").is_timeout());
        assert!(ClientError::connection("c").is_connection());
        assert!(ClientError::server("s").is_server());
        assert!(ClientError::overflow("o").is_overflow());
        assert!(ClientError::canceled().is_canceled());
    }

    #[test]
    fn test_exactly_one_kind() {
        let err = ClientError::timeout("deadline elapsed");
        assert!(err.is_timeout());
        assert!(!err.is_connection());
        assert!(!err.is_server());
        assert!(!err.is_overflow());
        assert!(!err.is_canceled());
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_display_carries_message() {
        let err = ClientError::connection("dial tcp 10.0.0.1:9000 refused");
        assert_eq!(err.to_string(), "dial tcp 10.0.0.1:9000 refused");
    }

    #[test]
    fn test_clone_preserves_kind() {
        let err = ClientError::overflow("queue full");
        let clone = err.clone();
        assert_eq!(clone.kind(), ErrorKind::Overflow);
        assert_eq!(clone.to_string(), err.to_string());
    }

    #[test]
    fn test_wire_error_display() {
        let err = WireError::UnknownResponseId(17);
        assert!(err.to_string().contains("17"));

        let err = WireError::FrameTooLarge {
            len: 2048,
            max: 1024,
        };
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("1024"));
    }
}
