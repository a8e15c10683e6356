//! Error types for the cachemgr control plane.
//!
//! This module provides a unified error type [`CacheMgrError`] for all
//! operations, along with a convenient [`Result`] type alias and the
//! [`MultiError`] aggregator used where several independent failures must be
//! reported as one.

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for cachemgr operations.
#[derive(Error, Debug)]
pub enum CacheMgrError {
    // Validation errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Entity lookup / conflict errors
    #[error("{kind}-[{name}] not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind}-[{name}] already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    // Metadata store errors
    #[error("store node not found: {0}")]
    StoreNodeMissing(String),

    #[error("store node is not a directory: {0}")]
    StoreNotDir(String),

    #[error("store node is not a file: {0}")]
    StoreNotFile(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("use of closed store client")]
    StoreClosed,

    // Service lifecycle
    #[error("use of closed topom")]
    ClosedTopom,

    // Sentinel fan-out
    #[error("lost majority ({voted}/{total})")]
    LostMajority { voted: usize, total: usize },

    #[error("sentinel error: {0}")]
    Sentinel(String),

    // Promotion state machine
    #[error("group-[{0}] action state is invalid")]
    InvalidPromotionState(String),

    // Network / wire errors
    #[error("redis protocol error: {0}")]
    RedisProtocol(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    // Serialization
    #[error("serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl CacheMgrError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheMgrError::LostMajority { .. }
                | CacheMgrError::Timeout(_)
                | CacheMgrError::Network(_)
                | CacheMgrError::Store(_)
        )
    }

    /// Check if error should surface with 400-class semantics.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CacheMgrError::InvalidArgument(_)
                | CacheMgrError::InvalidConfig { .. }
                | CacheMgrError::NotFound { .. }
                | CacheMgrError::AlreadyExists { .. }
                | CacheMgrError::Conflict(_)
        )
    }
}

impl From<serde_json::Error> for CacheMgrError {
    fn from(e: serde_json::Error) -> Self {
        CacheMgrError::Serialization(e.to_string())
    }
}

/// Result type alias for cachemgr operations.
pub type Result<T> = std::result::Result<T, CacheMgrError>;

/// Collects several independent errors and reports them as one.
///
/// Insertion order is preserved; the display form joins the messages with
/// `"; "`.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<CacheMgrError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: CacheMgrError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Consume the accumulator: `Ok(())` if nothing was recorded, otherwise
    /// the joined error.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CacheMgrError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i != 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_empty_is_ok() {
        let m = MultiError::new();
        assert!(m.is_empty());
        assert!(m.into_result().is_ok());
    }

    #[test]
    fn test_multi_error_joins_in_order() {
        let mut m = MultiError::new();
        m.push(CacheMgrError::InvalidArgument("first".into()));
        m.push(CacheMgrError::Internal("second".into()));
        let err = m.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument: first; internal error: second"
        );
    }

    #[test]
    fn test_client_error_classification() {
        assert!(CacheMgrError::NotFound {
            kind: "group",
            name: "g1".into()
        }
        .is_client_error());
        assert!(!CacheMgrError::Store("boom".into()).is_client_error());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CacheMgrError::LostMajority { voted: 1, total: 3 }.is_retryable());
        assert!(!CacheMgrError::InvalidArgument("x".into()).is_retryable());
    }
}
