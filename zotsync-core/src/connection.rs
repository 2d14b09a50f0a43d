//! Connection Manager
//!
//! Owns the single cluster connection of a store. The connection is opened on
//! first use and reused afterwards; stores and libraries only ever hold
//! references to it.

use crate::driver::{Bucket, Cluster, ConnectionTarget, Connector};
use crate::error::{StoreError, StoreResult};
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    target: ConnectionTarget,
    bucket_name: String,
    cluster: OnceCell<Arc<dyn Cluster>>,
    bucket: OnceCell<Arc<dyn Bucket>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        target: ConnectionTarget,
        bucket_name: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            target,
            bucket_name: bucket_name.into(),
            cluster: OnceCell::new(),
            bucket: OnceCell::new(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn is_connected(&self) -> bool {
        self.cluster.initialized()
    }

    /// Cluster handle, connecting on first call.
    ///
    /// Concurrent first calls share one connect attempt. A failed attempt is
    /// not cached, and the error is always returned as
    /// [`StoreError::Connection`].
    pub async fn connection(&self) -> StoreResult<Arc<dyn Cluster>> {
        let cluster = self.cluster.get_or_try_init(|| self.connect()).await?;
        Ok(cluster.clone())
    }

    /// Handle for the configured bucket
    pub async fn storage_area(&self) -> StoreResult<Arc<dyn Bucket>> {
        let bucket = self.bucket.get_or_try_init(|| self.open_bucket()).await?;
        Ok(bucket.clone())
    }

    async fn connect(&self) -> StoreResult<Arc<dyn Cluster>> {
        tracing::info!(address = %self.target.address, "connecting to cluster");
        self.connector
            .connect(&self.target)
            .await
            .map_err(StoreError::Connection)
    }

    async fn open_bucket(&self) -> StoreResult<Arc<dyn Bucket>> {
        let cluster = self.connection().await?;
        cluster
            .bucket(&self.bucket_name)
            .await
            .map_err(StoreError::Connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverErrorKind, MemoryCluster, Operation};

    fn manager(cluster: &MemoryCluster) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(cluster.connector()),
            ConnectionTarget {
                address: "memory://local".to_string(),
                username: "Administrator".to_string(),
                password: "password".to_string(),
            },
            "zotero",
        )
    }

    #[tokio::test]
    async fn test_connects_once() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster);
        assert!(!manager.is_connected());

        manager.connection().await.unwrap();
        manager.connection().await.unwrap();
        let bucket = manager.storage_area().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(bucket.name(), "zotero");
        assert_eq!(cluster.connect_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_connects_once() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster);

        let (a, b) = tokio::join!(manager.storage_area(), manager.storage_area());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(cluster.connect_count().await, 1);
    }

    #[tokio::test]
    async fn test_connection_failure_propagates_and_is_not_cached() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster);
        cluster.fail_next(Operation::Connect, DriverErrorKind::Connection).await;

        let err = manager.connection().await.err().unwrap();
        assert!(matches!(err, StoreError::Connection(_)));
        assert!(!manager.is_connected());

        manager.connection().await.unwrap();
        assert_eq!(cluster.connect_count().await, 1);
    }
}
