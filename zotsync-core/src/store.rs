//! Store adapter
//!
//! Entry point for the synchronization engine: it hands out initialized
//! [`Library`] instances, tracks which libraries it has seen, and drops the
//! storage of libraries that are removed.

use crate::config::StoreConfig;
use crate::connection::ConnectionManager;
use crate::driver::{ConnectionTarget, Connector};
use crate::error::StoreResult;
use crate::library::Library;
use crate::naming::{DefaultNamer, PartitionNamer};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct Store {
    config: Arc<StoreConfig>,
    connection: Arc<ConnectionManager>,
    namer: Arc<dyn PartitionNamer>,
    libraries: RwLock<Vec<String>>,
}

impl Store {
    /// Create a store using the default partition naming.
    ///
    /// No connection is made until the first library is requested.
    pub fn new(config: StoreConfig, connector: Arc<dyn Connector>) -> StoreResult<Self> {
        Self::with_namer(config, connector, DefaultNamer)
    }

    /// Create a store with a custom library-id to partition-name mapping
    pub fn with_namer(
        config: StoreConfig,
        connector: Arc<dyn Connector>,
        namer: impl PartitionNamer + 'static,
    ) -> StoreResult<Self> {
        config.validate()?;
        crate::metrics::describe_metrics();

        let target = ConnectionTarget {
            address: config.address.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };
        let connection = ConnectionManager::new(connector, target, config.bucket.clone());

        Ok(Self {
            config: Arc::new(config),
            connection: Arc::new(connection),
            namer: Arc::new(namer),
            libraries: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Scope name used for `library_id`
    pub fn partition_name(&self, library_id: &str) -> String {
        self.namer.partition_name(library_id)
    }

    /// Known library identifiers, in the order they were first requested
    pub async fn libraries(&self) -> Vec<String> {
        self.libraries.read().await.clone()
    }

    /// Obtain an initialized library, provisioning its storage if needed.
    pub async fn get(&self, library_id: &str) -> StoreResult<Library> {
        {
            let mut libraries = self.libraries.write().await;
            if !libraries.iter().any(|known| known == library_id) {
                libraries.push(library_id.to_string());
            }
        }

        let mut library = Library::new(
            library_id,
            self.partition_name(library_id),
            self.connection.clone(),
            self.config.clone(),
        );
        library.init().await?;
        Ok(library)
    }

    /// Drop every partition of `library_id` and forget the library.
    ///
    /// The identifier leaves the known set even when the drop fails. A drop
    /// of a library that was never provisioned fails like any other drop.
    pub async fn remove(&self, library_id: &str) -> StoreResult<()> {
        let partition = self.partition_name(library_id);

        let result = self.drop_partition(&partition).await;

        self.libraries
            .write()
            .await
            .retain(|known| known != library_id);

        if result.is_ok() {
            crate::metrics::record_library_dropped();
            tracing::info!(library = library_id, partition = %partition, "library dropped");
        }
        self.config.error_policy.apply("drop_scope", result)
    }

    async fn drop_partition(&self, partition: &str) -> StoreResult<()> {
        let bucket = self.connection.storage_area().await?;
        bucket.drop_scope(partition).await?;
        Ok(())
    }
}
