use std::fmt;
use std::io;

use thiserror::Error;

use crate::wait::Direction;

/// Errors that prevent an engine from being configured or started.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Unknown service name {0:?}")]
    UnknownService(String),

    #[error("Failed to resolve {0}: {1}")]
    ResolveError(String, io::Error),

    #[error("No usable address candidate for {0}")]
    NoUsableAddress(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(ErrorClass),

    #[error("Handshake gave up after {0} attempts")]
    HandshakeTimeout(usize),

    #[error("Crypto context error: {0}")]
    CryptoError(String),

    #[error("{0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Classification of a single crypto library call that did not succeed.
///
/// Every handshake, read, write and close step reports one of these. The
/// retry classes are recovered locally by waiting for readiness; everything
/// else ends the operation and, apart from [`ErrorClass::PeerClosedWrite`],
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Would block reading. Wait until readable, then retry.
    RetryRead,

    /// Would block writing. Wait until writable, then retry.
    RetryWrite,

    /// The peer cleanly ended their sending direction.
    PeerClosedWrite,

    /// Unrecoverable protocol error.
    FatalProtocol,

    /// Error from the underlying OS socket.
    FatalSystem,

    /// Anything the library reported that we do not recognize. Treated as fatal.
    Unclassified,
}

impl ErrorClass {
    pub fn is_retry(&self) -> bool {
        matches!(self, ErrorClass::RetryRead | ErrorClass::RetryWrite)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorClass::FatalProtocol | ErrorClass::FatalSystem | ErrorClass::Unclassified
        )
    }

    /// The readiness to wait for before retrying, if this is a retry class.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            ErrorClass::RetryRead => Some(Direction::Read),
            ErrorClass::RetryWrite => Some(Direction::Write),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::RetryRead => "retry-read",
            ErrorClass::RetryWrite => "retry-write",
            ErrorClass::PeerClosedWrite => "peer-closed-write",
            ErrorClass::FatalProtocol => "fatal-protocol",
            ErrorClass::FatalSystem => "fatal-system",
            ErrorClass::Unclassified => "unclassified",
        };
        f.write_str(s)
    }
}

/// Outcome of a failed `send`.
///
/// Each variant maps to the signed code reported by [`SendError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Engine is not running")]
    NotRunning,

    #[error("Connection dropped ({0})")]
    Dropped(ErrorClass),

    #[error("Gave up after {0} attempts")]
    TimedOut(usize),

    #[error("No such connection")]
    NoSuchConnection,
}

impl SendError {
    /// Negative numeric result, for callers that want a plain integer.
    pub fn code(&self) -> i32 {
        match self {
            SendError::NotRunning => -1,
            SendError::Dropped(_) => -2,
            SendError::TimedOut(_) => -3,
            SendError::NoSuchConnection => -4,
        }
    }
}
