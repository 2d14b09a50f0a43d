//! Per-library adapter
//!
//! A [`Library`] mirrors one remote library inside its own scope. The scope
//! holds three collections:
//! - `items` and `collections`: synchronized objects keyed by their `key` field
//! - `meta`: the `name` and `version` documents
//!
//! A library goes through `Uninitialized -> Provisioning -> Ready` in
//! [`Library::init`]; mutations are only accepted once it is `Ready`.

use crate::config::StoreConfig;
use crate::connection::ConnectionManager;
use crate::driver::Collection;
use crate::error::{StoreError, StoreResult};
use crate::naming::LibraryKind;
use crate::provision::{self, PollSettings};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const NAME_KEY: &str = "name";
const VERSION_KEY: &str = "version";

/// Kind of document stored in a library scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Items,
    Collections,
    Meta,
}

impl ObjectType {
    /// Provisioning order
    pub const ALL: [ObjectType; 3] = [ObjectType::Items, ObjectType::Collections, ObjectType::Meta];

    /// Collection name inside the library scope
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Items => "items",
            ObjectType::Collections => "collections",
            ObjectType::Meta => "meta",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryState {
    Uninitialized,
    Provisioning,
    Ready,
    Failed,
}

impl LibraryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryState::Uninitialized => "uninitialized",
            LibraryState::Provisioning => "provisioning",
            LibraryState::Ready => "ready",
            LibraryState::Failed => "failed",
        }
    }
}

impl fmt::Display for LibraryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a synchronized object
pub fn object_key(object: &Value) -> StoreResult<&str> {
    object
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::MissingKey(object.to_string().chars().take(80).collect()))
}

fn decode_name(value: Value) -> StoreResult<String> {
    match value {
        Value::String(name) => Ok(name),
        other => Err(StoreError::Decode(format!(
            "library name must be a string, got {}",
            other
        ))),
    }
}

fn decode_version(value: Value) -> StoreResult<u64> {
    value.as_u64().ok_or_else(|| {
        StoreError::Decode(format!(
            "library version must be a non-negative integer, got {}",
            value
        ))
    })
}

/// Local mirror of one remote library
pub struct Library {
    id: String,
    partition: String,
    kind: LibraryKind,
    name: String,
    version: u64,
    state: LibraryState,
    provision_time: Option<Duration>,
    connection: Arc<ConnectionManager>,
    config: Arc<StoreConfig>,
    partitions: HashMap<ObjectType, Arc<dyn Collection>>,
}

impl Library {
    pub(crate) fn new(
        id: impl Into<String>,
        partition: impl Into<String>,
        connection: Arc<ConnectionManager>,
        config: Arc<StoreConfig>,
    ) -> Self {
        let id = id.into();
        Self {
            kind: LibraryKind::from_library_id(&id),
            id,
            partition: partition.into(),
            name: String::new(),
            version: 0,
            state: LibraryState::Uninitialized,
            provision_time: None,
            connection,
            config,
            partitions: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Scope holding this library
    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn kind(&self) -> LibraryKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Last synchronized remote version, 0 if never synchronized
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn state(&self) -> LibraryState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LibraryState::Ready
    }

    /// Duration of the last successful [`Library::init`]
    pub fn provision_time(&self) -> Option<Duration> {
        self.provision_time
    }

    /// Provision the library scope and load its metadata.
    ///
    /// Safe to call again on a ready library; every step is idempotent.
    /// Timeouts and connection failures leave the library `Failed`.
    pub async fn init(&mut self) -> StoreResult<()> {
        let started = Instant::now();
        self.state = LibraryState::Provisioning;
        tracing::debug!(library = %self.id, partition = %self.partition, "provisioning library");

        let result = match self.provision().await {
            Ok(()) => self.load_metadata().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.state = LibraryState::Failed;
            tracing::error!(library = %self.id, error = %e, "library initialization failed");
            return Err(e);
        }

        let elapsed = started.elapsed();
        self.state = LibraryState::Ready;
        self.provision_time = Some(elapsed);
        crate::metrics::record_provision_duration(elapsed);
        tracing::info!(
            library = %self.id,
            partition = %self.partition,
            name = %self.name,
            version = self.version,
            elapsed_ms = elapsed.as_millis() as u64,
            "library ready"
        );
        Ok(())
    }

    async fn provision(&mut self) -> StoreResult<()> {
        let bucket = self.connection.storage_area().await?;
        let policy = self.config.error_policy;
        let poll = PollSettings::new(self.config.provision_timeout, self.config.poll_interval);

        for object_type in ObjectType::ALL {
            let collection = object_type.as_str();

            provision::ensure_scope(bucket.as_ref(), &self.partition, policy).await?;
            provision::ensure_collection(bucket.as_ref(), &self.partition, collection, policy)
                .await?;
            let handle =
                provision::wait_for_collection(bucket.as_ref(), &self.partition, collection, poll)
                    .await?;
            provision::ensure_primary_index(handle.as_ref(), policy, poll).await?;

            tracing::debug!(library = %self.id, collection, "partition provisioned");
            self.partitions.insert(object_type, handle);
        }
        Ok(())
    }

    async fn load_metadata(&mut self) -> StoreResult<()> {
        if let Some(name) = self.read_meta(NAME_KEY, decode_name).await? {
            self.name = name;
        }
        if let Some(version) = self.read_meta(VERSION_KEY, decode_version).await? {
            self.version = version;
        }
        Ok(())
    }

    /// Missing documents mean the library was never synchronized.
    async fn read_meta<T>(
        &self,
        key: &str,
        decode: fn(Value) -> StoreResult<T>,
    ) -> StoreResult<Option<T>> {
        let meta = self.handle(ObjectType::Meta)?;
        let result = match meta.get(key).await {
            Ok(value) => decode(value).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.config.error_policy.apply("read_meta", Err(e))?;
                Ok(None)
            }
        }
    }

    fn handle(&self, object_type: ObjectType) -> StoreResult<Arc<dyn Collection>> {
        self.partitions
            .get(&object_type)
            .cloned()
            .ok_or_else(|| self.not_ready())
    }

    fn ready_handle(&self, object_type: ObjectType) -> StoreResult<Arc<dyn Collection>> {
        if self.state != LibraryState::Ready {
            return Err(self.not_ready());
        }
        self.handle(object_type)
    }

    fn not_ready(&self) -> StoreError {
        StoreError::NotReady {
            library: self.id.clone(),
            state: self.state.to_string(),
        }
    }

    /// Upsert an item under its `key`
    pub async fn add(&self, item: &Value) -> StoreResult<()> {
        self.upsert_object(ObjectType::Items, item).await
    }

    /// Upsert a collection under its `key`
    pub async fn add_collection(&self, collection: &Value) -> StoreResult<()> {
        self.upsert_object(ObjectType::Collections, collection).await
    }

    /// Delete items by key. Absent keys are ignored.
    pub async fn remove<K>(&self, keys: &[K]) -> StoreResult<()>
    where
        K: AsRef<str> + Sync,
    {
        self.remove_objects(ObjectType::Items, keys).await
    }

    /// Delete collections by key. Absent keys are ignored.
    pub async fn remove_collections<K>(&self, keys: &[K]) -> StoreResult<()>
    where
        K: AsRef<str> + Sync,
    {
        self.remove_objects(ObjectType::Collections, keys).await
    }

    /// Stored item, if any
    pub async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.fetch_object(ObjectType::Items, key).await
    }

    /// Stored collection, if any
    pub async fn get_collection(&self, key: &str) -> StoreResult<Option<Value>> {
        self.fetch_object(ObjectType::Collections, key).await
    }

    /// Record the library name and the version synchronized up to.
    ///
    /// An empty `name` (personal libraries) is replaced by the configured
    /// user library name. The two documents are written one after the other,
    /// so a crash in between can leave a fresh name next to a stale version.
    pub async fn save(&mut self, name: &str, version: u64) -> StoreResult<()> {
        let meta = self.ready_handle(ObjectType::Meta)?;
        let name = if name.is_empty() {
            self.config.user_library_name.clone()
        } else {
            name.to_string()
        };
        self.name = name.clone();
        self.version = version;

        let policy = self.config.error_policy;
        let result = meta
            .upsert(NAME_KEY, &Value::String(name))
            .await
            .map_err(StoreError::from);
        policy.apply("save_name", result)?;

        let result = meta
            .upsert(VERSION_KEY, &Value::from(version))
            .await
            .map_err(StoreError::from);
        policy.apply("save_version", result)?;

        tracing::info!(library = %self.id, name = %self.name, version, "library metadata saved");
        Ok(())
    }

    async fn upsert_object(&self, object_type: ObjectType, object: &Value) -> StoreResult<()> {
        let handle = self.ready_handle(object_type)?;

        let result = match object_key(object) {
            Ok(key) => match handle.upsert(key, object).await {
                Ok(()) => {
                    crate::metrics::record_write(object_type.as_str());
                    tracing::trace!(library = %self.id, %object_type, key, "upserted");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        self.config.error_policy.apply("upsert", result)
    }

    async fn remove_objects<K>(&self, object_type: ObjectType, keys: &[K]) -> StoreResult<()>
    where
        K: AsRef<str> + Sync,
    {
        let handle = self.ready_handle(object_type)?;

        for key in keys {
            let key = key.as_ref();
            let result = match handle.remove(key).await {
                Ok(()) => {
                    crate::metrics::record_remove(object_type.as_str());
                    Ok(())
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(library = %self.id, %object_type, key, "already absent");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
            self.config.error_policy.apply("remove", result)?;
        }
        Ok(())
    }

    async fn fetch_object(&self, object_type: ObjectType, key: &str) -> StoreResult<Option<Value>> {
        let handle = self.ready_handle(object_type)?;
        match handle.get(key).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("state", &self.state)
            .finish()
    }
}
