use std::fmt;
use std::io;

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::Operation;

/// type alias for all fallible operations of this crate
pub type Result<T> = std::result::Result<T, VbkvError>;

/// The kinds of errors a cluster operation can fail with.
///
/// The first group is reported by the server as a response status, see
/// [`ErrorKind::from_status`]. The second group is never carried over the wire and is
/// raised by the client itself (network failures, bad configuration, broken packets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// no such key
    NotFound,
    /// key already exists (or the cas did not match)
    KeyExists,
    /// object too big
    TooBig,
    /// invalid arguments
    Invalid,
    /// not stored
    NotStored,
    /// the stored value is not a number
    DeltaBadVal,
    /// the partition is not located on the contacted server
    NotMyVbucket,
    /// authentication error
    Auth,
    /// invalid range
    Range,
    /// unknown command
    UnknownCommand,
    /// out of memory
    NoMemory,
    /// not supported
    NotSupported,
    /// internal server error
    Internal,
    /// the cluster is too busy, try again later
    Busy,
    /// any other non-zero status, carrying the raw code
    Base(u16),

    /// network error
    Network,
    /// unknown host
    UnknownHost,
    /// failed to decode or encode a value
    ValueFormat,
    /// broken packet on the wire
    Protocol,
    /// timeout
    Timeout,
    /// could not connect to a node
    Connect,
    /// temporary failure, try again later
    TemporaryFail,
    /// the given bucket was not found in the cluster
    BucketNotFound,
}

impl ErrorKind {
    /// maps a response `status` onto an error kind.
    /// Returns `None` for `0x00` (success).
    pub fn from_status(status: u16) -> Option<ErrorKind> {
        let kind = match status {
            0x00 => return None,
            0x01 => ErrorKind::NotFound,
            0x02 => ErrorKind::KeyExists,
            0x03 => ErrorKind::TooBig,
            0x04 => ErrorKind::Invalid,
            0x05 => ErrorKind::NotStored,
            0x06 => ErrorKind::DeltaBadVal,
            0x07 => ErrorKind::NotMyVbucket,
            0x20 => ErrorKind::Auth,
            0x22 => ErrorKind::Range,
            0x81 => ErrorKind::UnknownCommand,
            0x82 => ErrorKind::NoMemory,
            0x83 => ErrorKind::NotSupported,
            0x84 => ErrorKind::Internal,
            0x85 => ErrorKind::Busy,
            other => ErrorKind::Base(other),
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "key not found"),
            ErrorKind::KeyExists => write!(f, "key exists"),
            ErrorKind::TooBig => write!(f, "object too big"),
            ErrorKind::Invalid => write!(f, "invalid arguments"),
            ErrorKind::NotStored => write!(f, "not stored"),
            ErrorKind::DeltaBadVal => write!(f, "value is not a number"),
            ErrorKind::NotMyVbucket => write!(f, "not my vbucket"),
            ErrorKind::Auth => write!(f, "authentication error"),
            ErrorKind::Range => write!(f, "invalid range"),
            ErrorKind::UnknownCommand => write!(f, "unknown command"),
            ErrorKind::NoMemory => write!(f, "out of memory"),
            ErrorKind::NotSupported => write!(f, "not supported"),
            ErrorKind::Internal => write!(f, "internal error"),
            ErrorKind::Busy => write!(f, "server busy"),
            ErrorKind::Base(code) => write!(f, "error status {:#04x}", code),
            ErrorKind::Network => write!(f, "network error"),
            ErrorKind::UnknownHost => write!(f, "unknown host"),
            ErrorKind::ValueFormat => write!(f, "value format error"),
            ErrorKind::Protocol => write!(f, "protocol error"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Connect => write!(f, "connect error"),
            ErrorKind::TemporaryFail => write!(f, "temporary failure"),
            ErrorKind::BucketNotFound => write!(f, "bucket not found"),
        }
    }
}

/// An error attached to a single operation's result.
///
/// These are never fatal to a connection, they are handed to the operation's handler
/// as part of its [`OperationResult`](crate::OperationResult).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    /// the error kind
    pub kind: ErrorKind,
    /// the raw status code from the response, `0` for client side errors
    pub status: u16,
    /// the key which generated the error
    pub key: Bytes,
    /// the version of the key, `0` unless known
    pub cas: u64,
    /// the operation that failed
    pub operation: Operation,
    /// server supplied (or client generated) description
    pub message: String,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {} (status {:#04x})", self.operation, self.kind, self.status)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for OperationError {}

impl OperationError {
    /// builds the error for a non-zero response `status`, `None` for success
    pub fn from_status(
        status: u16,
        key: Bytes,
        cas: u64,
        operation: Operation,
        body: &[u8],
    ) -> Option<OperationError> {
        ErrorKind::from_status(status).map(|kind| OperationError {
            kind,
            status,
            key,
            cas,
            operation,
            message: String::from_utf8_lossy(body).into_owned(),
        })
    }

    /// builds a client side error that never travelled over the wire
    pub fn local(kind: ErrorKind, key: Bytes, operation: Operation, message: impl Into<String>) -> Self {
        OperationError {
            kind,
            status: 0,
            key,
            cas: 0,
            operation,
            message: message.into(),
        }
    }
}

/// The error variants used by the client.
///
/// Per-operation status errors are *not* represented here, they travel inside an
/// [`OperationResult`](crate::OperationResult). `VbkvError` is for failures of whole
/// components: a broken connection, a bad feed document, a closed client.
#[derive(Debug, Error)]
pub enum VbkvError {
    /// an I/O error on a socket or file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// a (de)serialization error from serde_json
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// the configuration feed request failed
    #[error("configuration feed error: {0}")]
    Http(#[from] reqwest::Error),

    /// the configuration feed was closed or failed
    #[error("configuration feed error: {0}")]
    Feed(String),

    /// a packet with a broken header was received
    #[error("protocol error: {0}")]
    Protocol(String),

    /// an opcode this client never sends
    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),

    /// a response carried an opcode this client never sends
    #[error("unknown command {opcode:#04x} in response to opaque {opaque}")]
    UnknownResponse {
        /// the opcode of the response
        opcode: u8,
        /// correlation id of the operation it answers
        opaque: u32,
    },

    /// a configuration document could not be turned into a snapshot
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// SASL authentication was rejected by a node
    #[error("authentication failed: {0}")]
    Auth(OperationError),

    /// a TCP connection could not be established
    #[error("could not connect to {address}: {source}")]
    Connect {
        /// the address that was dialed
        address: String,
        /// the underlying cause
        source: io::Error,
    },

    /// an address did not resolve
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// a key or value could not be encoded
    #[error("value format error: {0}")]
    ValueFormat(String),

    /// invalid user supplied options
    #[error("{0}")]
    Parsing(String),

    /// an operation came back with an error result
    #[error("{0}")]
    Operation(OperationError),

    /// no result arrived in time
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// the client has been closed
    #[error("client is closed")]
    Closed,
}

impl VbkvError {
    /// maps this error onto the [`ErrorKind`] taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            VbkvError::Http(e) if e.status() == Some(reqwest::StatusCode::NOT_FOUND) => ErrorKind::BucketNotFound,
            VbkvError::Io(_) | VbkvError::Http(_) | VbkvError::Feed(_) | VbkvError::Closed => {
                ErrorKind::Network
            }
            VbkvError::Json(_) | VbkvError::ValueFormat(_) => ErrorKind::ValueFormat,
            VbkvError::Protocol(_) => ErrorKind::Protocol,
            VbkvError::UnknownCommand(_) | VbkvError::UnknownResponse { .. } => ErrorKind::UnknownCommand,
            VbkvError::InvalidConfiguration(_) | VbkvError::Parsing(_) => ErrorKind::Invalid,
            VbkvError::Auth(_) => ErrorKind::Auth,
            VbkvError::Connect { .. } => ErrorKind::Connect,
            VbkvError::UnknownHost(_) => ErrorKind::UnknownHost,
            VbkvError::Operation(e) => e.kind,
            VbkvError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_status_codes_map_to_kinds() {
        let table = [
            (0x01, ErrorKind::NotFound),
            (0x02, ErrorKind::KeyExists),
            (0x03, ErrorKind::TooBig),
            (0x04, ErrorKind::Invalid),
            (0x05, ErrorKind::NotStored),
            (0x06, ErrorKind::DeltaBadVal),
            (0x07, ErrorKind::NotMyVbucket),
            (0x20, ErrorKind::Auth),
            (0x22, ErrorKind::Range),
            (0x81, ErrorKind::UnknownCommand),
            (0x82, ErrorKind::NoMemory),
            (0x83, ErrorKind::NotSupported),
            (0x84, ErrorKind::Internal),
            (0x85, ErrorKind::Busy),
        ];
        for (status, kind) in table.iter() {
            assert_eq!(ErrorKind::from_status(*status), Some(*kind), "status {:#04x}", status);
        }
    }

    #[test]
    fn success_has_no_kind() {
        assert_eq!(ErrorKind::from_status(0x00), None);
        assert!(OperationError::from_status(0, Bytes::new(), 0, Operation::Get, b"").is_none());
    }

    #[test]
    fn undocumented_status_keeps_raw_code() {
        assert_eq!(ErrorKind::from_status(0x86), Some(ErrorKind::Base(0x86)));
        assert_eq!(ErrorKind::from_status(0x21), Some(ErrorKind::Base(0x21)));
    }

    #[test]
    fn operation_error_carries_context() {
        let err = OperationError::from_status(
            0x01,
            Bytes::from_static(b"missing"),
            42,
            Operation::Get,
            b"Not found",
        )
        .unwrap();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.key, Bytes::from_static(b"missing"));
        assert_eq!(err.cas, 42);
        assert_eq!(err.operation, Operation::Get);
        assert_eq!(err.to_string(), "get failed: key not found (status 0x01): Not found");
    }

    #[test]
    fn component_errors_map_to_internal_kinds() {
        assert_eq!(VbkvError::Protocol("bad magic".into()).kind(), ErrorKind::Protocol);
        assert_eq!(VbkvError::UnknownHost("nowhere".into()).kind(), ErrorKind::UnknownHost);
        assert_eq!(VbkvError::Closed.kind(), ErrorKind::Network);
    }
}
