//! Error types for the store adapter

use crate::config::ConfigError;
use crate::driver::DriverError;
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by [`Store`](crate::Store) and [`Library`](crate::Library)
#[derive(Debug, Error)]
pub enum StoreError {
    /// Driver call failed
    #[error("Storage error: {0}")]
    Driver(DriverError),

    /// Cluster could not be reached or rejected the credentials
    #[error("Connection error: {0}")]
    Connection(DriverError),

    /// A provisioned object did not become usable in time
    #[error("Timed out after {elapsed:?} waiting for {target}")]
    Timeout { target: String, elapsed: Duration },

    /// Mutation attempted before initialization finished
    #[error("Library {library} is not ready (state: {state})")]
    NotReady { library: String, state: String },

    /// Synchronized object without a string `key` field
    #[error("Object has no key: {0}")]
    MissingKey(String),

    /// Stored document had an unexpected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Logging setup failed
    #[error("Logging error: {0}")]
    Logging(String),
}

impl StoreError {
    /// Whether the throw/log error policy may swallow this error.
    ///
    /// Timeouts, connection failures and lifecycle misuse always propagate.
    pub fn is_policy_governed(&self) -> bool {
        matches!(
            self,
            StoreError::Driver(_) | StoreError::MissingKey(_) | StoreError::Decode(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

impl From<DriverError> for StoreError {
    fn from(err: DriverError) -> Self {
        if err.is_connection() {
            StoreError::Connection(err)
        } else {
            StoreError::Driver(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverErrorKind;

    #[test]
    fn test_driver_error_conversion() {
        let err: StoreError = DriverError::other("disk full").into();
        assert!(matches!(err, StoreError::Driver(_)));
        assert!(err.is_policy_governed());

        let err: StoreError = DriverError::new(DriverErrorKind::Authentication, "denied").into();
        assert!(matches!(err, StoreError::Connection(_)));
        assert!(!err.is_policy_governed());
    }

    #[test]
    fn test_timeout_display() {
        let err = StoreError::Timeout {
            target: "primary index on zotero.u1.items".to_string(),
            elapsed: Duration::from_millis(5000),
        };
        assert!(err.is_timeout());
        assert!(!err.is_policy_governed());
        assert_eq!(
            err.to_string(),
            "Timed out after 5s waiting for primary index on zotero.u1.items"
        );
    }
}
