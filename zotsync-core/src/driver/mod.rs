//! Storage Driver Abstraction
//!
//! The adapter talks to the document database exclusively through these traits.
//! The model follows the bucket / scope / collection / document hierarchy:
//! a [`Cluster`] hands out [`Bucket`]s, a bucket owns scopes and the collections
//! inside them, and a [`Collection`] stores JSON documents by key.
//!
//! Failures carry a [`DriverErrorKind`] so callers can classify them without
//! inspecting driver-specific messages.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryCluster, MemoryConnector, MemoryOptions, Operation};
pub use sqlite::{SqliteCluster, SqliteConnector};

/// Result type for driver calls
pub type DriverResult<T> = Result<T, DriverError>;

/// Classification of a driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// The scope, collection or index being created is already there
    AlreadyExists,
    /// The document, scope or index does not exist
    NotFound,
    /// The collection does not exist, was dropped, or has not materialized yet
    CollectionNotFound,
    /// The cluster could not be reached
    Connection,
    /// Credentials were rejected
    Authentication,
    /// The object exists but is temporarily not usable
    Unavailable,
    /// Anything else
    Other,
}

impl DriverErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverErrorKind::AlreadyExists => "already_exists",
            DriverErrorKind::NotFound => "not_found",
            DriverErrorKind::CollectionNotFound => "collection_not_found",
            DriverErrorKind::Connection => "connection",
            DriverErrorKind::Authentication => "authentication",
            DriverErrorKind::Unavailable => "unavailable",
            DriverErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a storage driver
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::AlreadyExists, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::NotFound, message)
    }

    pub fn collection_not_found(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::CollectionNotFound, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, message)
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == DriverErrorKind::AlreadyExists
    }

    /// Absent document, scope or index. A missing collection is reported
    /// separately, see [`DriverError::is_collection_not_found`].
    pub fn is_not_found(&self) -> bool {
        self.kind == DriverErrorKind::NotFound
    }

    pub fn is_collection_not_found(&self) -> bool {
        self.kind == DriverErrorKind::CollectionNotFound
    }

    /// Connection and authentication failures are never masked by the error policy.
    pub fn is_connection(&self) -> bool {
        matches!(
            self.kind,
            DriverErrorKind::Connection | DriverErrorKind::Authentication
        )
    }
}

/// State of a primary index as reported by the query service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Pending,
    Building,
    Online,
}

impl IndexState {
    pub fn is_online(&self) -> bool {
        matches!(self, IndexState::Online)
    }
}

/// Fully qualified collection name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyspace {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl Keyspace {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Address and credentials of a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub address: String,
    pub username: String,
    pub password: String,
}

/// Opens authenticated cluster connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectionTarget) -> DriverResult<Arc<dyn Cluster>>;
}

/// Authenticated cluster connection
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Open the bucket with the given name
    async fn bucket(&self, name: &str) -> DriverResult<Arc<dyn Bucket>>;
}

/// Scope and collection management for one bucket
///
/// Creation calls may return before the created object is usable. Callers that
/// need the object must poll [`Bucket::collection`] until it stops returning
/// `CollectionNotFound`.
#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    /// Create a scope. Returns `AlreadyExists` if it is present.
    async fn create_scope(&self, scope: &str) -> DriverResult<()>;

    /// Drop a scope together with every collection and document inside it.
    async fn drop_scope(&self, scope: &str) -> DriverResult<()>;

    /// Create a collection inside an existing scope.
    async fn create_collection(&self, scope: &str, collection: &str) -> DriverResult<()>;

    /// Obtain a live handle to a collection. Returns `CollectionNotFound`
    /// until the collection has materialized.
    async fn collection(&self, scope: &str, collection: &str)
        -> DriverResult<Arc<dyn Collection>>;
}

/// Key/value document access plus primary index management
#[async_trait]
pub trait Collection: Send + Sync {
    fn keyspace(&self) -> &Keyspace;

    /// Insert or replace the document stored under `key`.
    ///
    /// Every document call returns `CollectionNotFound` once the collection
    /// (or its scope) has been dropped.
    async fn upsert(&self, key: &str, value: &Value) -> DriverResult<()>;

    /// Fetch a document. Returns `NotFound` if absent.
    async fn get(&self, key: &str) -> DriverResult<Value>;

    /// Delete a document. Returns `NotFound` if absent.
    async fn remove(&self, key: &str) -> DriverResult<()>;

    /// Create the primary index. Returns `AlreadyExists` if it is present.
    async fn create_primary_index(&self) -> DriverResult<()>;

    /// Current state of the primary index. Returns `NotFound` if none was created.
    async fn primary_index_state(&self) -> DriverResult<IndexState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::already_exists("scope u1");
        assert_eq!(err.to_string(), "already_exists: scope u1");
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_missing_collection_is_not_a_missing_document() {
        let err = DriverError::collection_not_found("collection zotero.g1.items not found");
        assert_eq!(err.kind.to_string(), "collection_not_found");
        assert!(err.is_collection_not_found());
        assert!(!err.is_not_found());
        assert!(!DriverError::not_found("document A not found").is_collection_not_found());
    }

    #[test]
    fn test_connection_classification() {
        assert!(DriverError::connection("refused").is_connection());
        assert!(DriverError::new(DriverErrorKind::Authentication, "bad password").is_connection());
        assert!(!DriverError::other("boom").is_connection());
    }

    #[test]
    fn test_keyspace_display() {
        let ks = Keyspace::new("zotero", "u1", "items");
        assert_eq!(ks.to_string(), "zotero.u1.items");
    }
}
