//! Error types for Fidias
//!
//! Business logic uses the sentinel variants below so callers match on the
//! variant. Errors cross the wire as a [`WireError`] carrying a stable
//! numeric [`ErrorCode`]; the receiving side rebuilds the same variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for Fidias operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Fidias
#[derive(Debug, Error)]
pub enum Error {
    // Log and index errors
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("entry not found: {key} @ {id}")]
    EntryNotFound { key: String, id: String },

    #[error("previous hash mismatch: {0}")]
    PreviousHashMismatch(String),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    // Ballot errors
    #[error("insufficient peers: have {have}, need {need}")]
    InsufficientPeers { have: usize, need: usize },

    #[error("ballot timed out: {0}")]
    BallotTimeout(String),

    #[error("host not in set: {0}")]
    HostNotInSet(String),

    #[error("no replica available: {0}")]
    ReplicaUnavailable(String),

    // FSM errors
    #[error("type change refused: {0}")]
    TypeChange(String),

    #[error("already exists: {0}")]
    Exists(String),

    // Block errors
    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("block exists: {0}")]
    BlockExists(String),

    // Network/RPC errors
    #[error("transport error ({host}): {message}")]
    Transport { host: String, message: String },

    #[error("transport shut down")]
    TransportShutdown,

    #[error("request timeout")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    // Storage errors
    #[error("store error: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Key-not-found for a raw key
    pub fn key_not_found(key: &[u8]) -> Self {
        Self::KeyNotFound(String::from_utf8_lossy(key).into_owned())
    }

    /// Previous-hash mismatch for a raw key
    pub fn mismatch(key: &[u8]) -> Self {
        Self::PreviousHashMismatch(String::from_utf8_lossy(key).into_owned())
    }

    /// Wrap a transport failure with the remote host
    pub fn transport(host: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            host: host.into(),
            message: err.to_string(),
        }
    }

    /// Wrap a storage backend error
    pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store(Box::new(err))
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::BallotTimeout(_)
                | Self::Transport { .. }
                | Self::ReplicaUnavailable(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::KeyNotFound(_) | Self::EntryNotFound { .. } | Self::BlockNotFound(_)
        )
    }

    /// HTTP-equivalent status for a gateway in front of the node
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) | Self::InvalidEntry(_) => 400,
            Self::KeyNotFound(_) | Self::EntryNotFound { .. } | Self::BlockNotFound(_) => 404,
            Self::PreviousHashMismatch(_)
            | Self::TypeChange(_)
            | Self::Exists(_)
            | Self::BlockExists(_) => 409,
            Self::HostNotInSet(_) => 421,
            Self::Transport { .. } => 502,
            Self::InsufficientPeers { .. }
            | Self::ReplicaUnavailable(_)
            | Self::TransportShutdown => 503,
            Self::Timeout | Self::BallotTimeout(_) => 504,
            _ => 500,
        }
    }

    /// Stable numeric code for this error
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::KeyNotFound(_) => ErrorCode::KeyNotFound,
            Self::EntryNotFound { .. } => ErrorCode::EntryNotFound,
            Self::PreviousHashMismatch(_) => ErrorCode::PreviousHashMismatch,
            Self::InvalidEntry(_) => ErrorCode::InvalidEntry,
            Self::InsufficientPeers { .. } => ErrorCode::InsufficientPeers,
            Self::BallotTimeout(_) => ErrorCode::BallotTimeout,
            Self::HostNotInSet(_) => ErrorCode::HostNotInSet,
            Self::ReplicaUnavailable(_) => ErrorCode::ReplicaUnavailable,
            Self::TypeChange(_) => ErrorCode::TypeChange,
            Self::Exists(_) => ErrorCode::Exists,
            Self::BlockNotFound(_) => ErrorCode::BlockNotFound,
            Self::BlockExists(_) => ErrorCode::BlockExists,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::TransportShutdown => ErrorCode::TransportShutdown,
            Self::Timeout => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Store(_) | Self::Io(_) => ErrorCode::Store,
            Self::Serialization(_) => ErrorCode::Serialization,
            Self::Configuration(_) | Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Convert into the wire representation
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        let (subject, have, need) = match self {
            Self::KeyNotFound(s)
            | Self::PreviousHashMismatch(s)
            | Self::InvalidEntry(s)
            | Self::BallotTimeout(s)
            | Self::HostNotInSet(s)
            | Self::ReplicaUnavailable(s)
            | Self::TypeChange(s)
            | Self::Exists(s)
            | Self::BlockNotFound(s)
            | Self::BlockExists(s)
            | Self::Serialization(s)
            | Self::Configuration(s)
            | Self::InvalidArgument(s)
            | Self::Internal(s) => (s.clone(), 0, 0),
            Self::EntryNotFound { key, id } => (format!("{key}\n{id}"), 0, 0),
            Self::Transport { host, .. } => (host.clone(), 0, 0),
            Self::InsufficientPeers { have, need } => (String::new(), *have as u64, *need as u64),
            Self::TransportShutdown | Self::Timeout | Self::Cancelled => (String::new(), 0, 0),
            Self::Store(_) | Self::Io(_) => (String::new(), 0, 0),
        };
        let message = match self {
            Self::Transport { message, .. } => message.clone(),
            other => other.to_string(),
        };
        WireError {
            code: self.code() as u16,
            subject,
            message,
            have,
            need,
        }
    }

    /// Rebuild the sentinel variant from its wire representation
    #[must_use]
    pub fn from_wire(wire: WireError) -> Self {
        let WireError {
            code,
            subject,
            message,
            have,
            need,
        } = wire;
        let Some(code) = ErrorCode::from_u16(code) else {
            return Self::Internal(message);
        };
        match code {
            ErrorCode::KeyNotFound => Self::KeyNotFound(subject),
            ErrorCode::EntryNotFound => {
                let (key, id) = subject.split_once('\n').unwrap_or((subject.as_str(), ""));
                Self::EntryNotFound {
                    key: key.to_string(),
                    id: id.to_string(),
                }
            }
            ErrorCode::PreviousHashMismatch => Self::PreviousHashMismatch(subject),
            ErrorCode::InvalidEntry => Self::InvalidEntry(subject),
            ErrorCode::InsufficientPeers => Self::InsufficientPeers {
                have: usize::try_from(have).unwrap_or(usize::MAX),
                need: usize::try_from(need).unwrap_or(usize::MAX),
            },
            ErrorCode::BallotTimeout => Self::BallotTimeout(subject),
            ErrorCode::HostNotInSet => Self::HostNotInSet(subject),
            ErrorCode::ReplicaUnavailable => Self::ReplicaUnavailable(subject),
            ErrorCode::TypeChange => Self::TypeChange(subject),
            ErrorCode::Exists => Self::Exists(subject),
            ErrorCode::BlockNotFound => Self::BlockNotFound(subject),
            ErrorCode::BlockExists => Self::BlockExists(subject),
            ErrorCode::Transport => Self::Transport {
                host: subject,
                message,
            },
            ErrorCode::TransportShutdown => Self::TransportShutdown,
            ErrorCode::Timeout => Self::Timeout,
            ErrorCode::Cancelled => Self::Cancelled,
            ErrorCode::Serialization => Self::Serialization(subject),
            ErrorCode::InvalidArgument => Self::InvalidArgument(subject),
            ErrorCode::Store | ErrorCode::Internal => Self::Internal(message),
        }
    }
}

/// Stable error codes carried on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    KeyNotFound = 1,
    EntryNotFound = 2,
    PreviousHashMismatch = 3,
    InvalidEntry = 4,
    InsufficientPeers = 10,
    BallotTimeout = 11,
    HostNotInSet = 12,
    ReplicaUnavailable = 13,
    TypeChange = 20,
    Exists = 21,
    BlockNotFound = 30,
    BlockExists = 31,
    Transport = 40,
    TransportShutdown = 41,
    Timeout = 42,
    Cancelled = 43,
    Store = 50,
    Serialization = 51,
    InvalidArgument = 52,
    Internal = 99,
}

impl ErrorCode {
    /// Parse a wire code
    #[must_use]
    pub const fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::KeyNotFound,
            2 => Self::EntryNotFound,
            3 => Self::PreviousHashMismatch,
            4 => Self::InvalidEntry,
            10 => Self::InsufficientPeers,
            11 => Self::BallotTimeout,
            12 => Self::HostNotInSet,
            13 => Self::ReplicaUnavailable,
            20 => Self::TypeChange,
            21 => Self::Exists,
            30 => Self::BlockNotFound,
            31 => Self::BlockExists,
            40 => Self::Transport,
            41 => Self::TransportShutdown,
            42 => Self::Timeout,
            43 => Self::Cancelled,
            50 => Self::Store,
            51 => Self::Serialization,
            52 => Self::InvalidArgument,
            99 => Self::Internal,
            _ => return None,
        })
    }
}

/// Error as carried in a response frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Numeric [`ErrorCode`]
    pub code: u16,
    /// Key, id or host the error is about
    pub subject: String,
    /// Human-readable message
    pub message: String,
    /// Reachable peers (InsufficientPeers only)
    pub have: u64,
    /// Required peers (InsufficientPeers only)
    pub need: u64,
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        Self::from_wire(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn through_wire(err: &Error) -> Error {
        Error::from_wire(err.to_wire())
    }

    #[test]
    fn test_sentinels_survive_the_wire() {
        assert!(matches!(
            through_wire(&Error::key_not_found(b"a/b")),
            Error::KeyNotFound(k) if k == "a/b"
        ));
        assert!(matches!(
            through_wire(&Error::mismatch(b"k")),
            Error::PreviousHashMismatch(k) if k == "k"
        ));
        assert!(matches!(
            through_wire(&Error::InsufficientPeers { have: 1, need: 2 }),
            Error::InsufficientPeers { have: 1, need: 2 }
        ));
        assert!(matches!(
            through_wire(&Error::EntryNotFound {
                key: "k".into(),
                id: "ab".into()
            }),
            Error::EntryNotFound { key, id } if key == "k" && id == "ab"
        ));
        assert!(matches!(
            through_wire(&Error::transport("10.0.0.1:7000", "refused")),
            Error::Transport { host, message } if host == "10.0.0.1:7000" && message == "refused"
        ));
        assert!(matches!(
            through_wire(&Error::TransportShutdown),
            Error::TransportShutdown
        ));
    }

    #[test]
    fn test_store_errors_become_internal_remotely() {
        let err = Error::Io(std::io::Error::other("disk gone"));
        assert!(matches!(through_wire(&err), Error::Internal(m) if m.contains("disk gone")));
    }

    #[test]
    fn test_unknown_code() {
        let wire = WireError {
            code: 4242,
            subject: String::new(),
            message: "boom".into(),
            have: 0,
            need: 0,
        };
        assert!(matches!(Error::from_wire(wire), Error::Internal(m) if m == "boom"));
    }

    #[test]
    fn test_predicates() {
        assert!(Error::key_not_found(b"x").is_not_found());
        assert!(Error::BlockNotFound("x".into()).is_not_found());
        assert!(!Error::mismatch(b"x").is_not_found());
        assert!(Error::Timeout.is_retryable());
        assert!(!Error::mismatch(b"x").is_retryable());
        assert_eq!(Error::key_not_found(b"x").status_code(), 404);
        assert_eq!(Error::mismatch(b"x").status_code(), 409);
        assert_eq!(Error::HostNotInSet("h".into()).status_code(), 421);
    }
}
