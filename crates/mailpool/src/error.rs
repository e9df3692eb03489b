//! Error types shared by the token cache, connection pool and orchestrator
//!
//! Retry decisions are made on the variant, never on message text:
//! [`ErrorKind`] tells a caller whether an error is worth retrying.

use std::time::Duration;

/// Coarse retry classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, TLS or provider-side hiccup; a later attempt may succeed
    Transient,
    /// Retrying with the same inputs will fail again
    Permanent,
    /// An explicit deadline elapsed
    Timeout,
}

/// Errors surfaced by mailpool operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid credential for {account}: {reason}")]
    InvalidCredential { account: String, reason: String },

    #[error("Transient upstream failure: {message}")]
    TransientUpstream { message: String },

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("Connection pool for {account} exhausted after waiting {waited:?}")]
    PoolExhausted { account: String, waited: Duration },

    #[error("Could not open a session for {account} after {attempts} attempts: {message}")]
    ConnectionFailed {
        account: String,
        attempts: u32,
        message: String,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// Retry classification for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransientUpstream { .. } => ErrorKind::Transient,
            Error::Timeout { .. } | Error::PoolExhausted { .. } => ErrorKind::Timeout,
            Error::InvalidCredential { .. }
            | Error::ConnectionFailed { .. }
            | Error::Protocol { .. }
            | Error::PoolClosed
            | Error::Storage(_) => ErrorKind::Permanent,
        }
    }

    /// Whether the credential itself was rejected
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::InvalidCredential { .. })
    }

    pub(crate) fn transient(message: impl Into<String>) -> Self {
        Error::TransientUpstream {
            message: message.into(),
        }
    }
}

/// Failures reported by a mail transport session
///
/// Implementations of [`crate::transport::MailSession`] and
/// [`crate::transport::SessionConnector`] pick the variant; the pool uses it
/// to decide between retrying, discarding and surfacing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Retry classification for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Network(_) | TransportError::Tls(_) => ErrorKind::Transient,
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::Auth(_) | TransportError::Protocol(_) => ErrorKind::Permanent,
        }
    }

    /// Convert into a crate error, attributing auth failures to `account`
    pub fn into_error(self, account: &str) -> Error {
        match self {
            TransportError::Auth(reason) => Error::InvalidCredential {
                account: account.to_string(),
                reason,
            },
            TransportError::Network(message) | TransportError::Tls(message) => {
                Error::TransientUpstream { message }
            }
            TransportError::Timeout(elapsed) => Error::Timeout {
                operation: "session operation",
                elapsed,
            },
            TransportError::Protocol(message) => Error::Protocol { message },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
