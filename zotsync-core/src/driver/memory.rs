//! In-Memory Storage Driver
//!
//! Keeps every bucket in process memory. Used by tests and for running the
//! adapter without a database server.
//!
//! The driver reproduces the asynchronous behavior of a real cluster: a created
//! collection only becomes openable after `collection_delay`, and a primary
//! index only reports `Online` after `index_delay`. Failures can be injected per
//! operation with [`MemoryCluster::fail_next`].

use super::{
    Bucket, Cluster, Collection, ConnectionTarget, Connector, DriverError, DriverErrorKind,
    DriverResult, IndexState, Keyspace,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Timing behavior of the in-memory cluster
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Time between `create_collection` and the collection becoming openable
    pub collection_delay: Duration,
    /// Time until a created primary index is online. `None` never comes online.
    pub index_delay: Option<Duration>,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            collection_delay: Duration::ZERO,
            index_delay: Some(Duration::ZERO),
        }
    }
}

/// Driver operations that can be targeted by fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    CreateScope,
    DropScope,
    CreateCollection,
    OpenCollection,
    Upsert,
    Get,
    Remove,
    CreatePrimaryIndex,
    IndexState,
}

struct CollectionState {
    created_at: Instant,
    documents: HashMap<String, Value>,
    index_created_at: Option<Instant>,
}

#[derive(Default)]
struct ScopeState {
    collections: HashMap<String, CollectionState>,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, HashMap<String, ScopeState>>,
    failures: HashMap<Operation, VecDeque<DriverErrorKind>>,
    connects: usize,
}

impl Inner {
    fn take_failure(&mut self, op: Operation) -> DriverResult<()> {
        match self.failures.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(kind) => Err(DriverError::new(kind, format!("injected failure on {:?}", op))),
            None => Ok(()),
        }
    }

    fn collection(&self, keyspace: &Keyspace) -> DriverResult<&CollectionState> {
        self.buckets
            .get(&keyspace.bucket)
            .and_then(|scopes| scopes.get(&keyspace.scope))
            .and_then(|scope| scope.collections.get(&keyspace.collection))
            .ok_or_else(|| {
                DriverError::collection_not_found(format!("collection {} not found", keyspace))
            })
    }

    fn collection_mut(&mut self, keyspace: &Keyspace) -> DriverResult<&mut CollectionState> {
        self.buckets
            .get_mut(&keyspace.bucket)
            .and_then(|scopes| scopes.get_mut(&keyspace.scope))
            .and_then(|scope| scope.collections.get_mut(&keyspace.collection))
            .ok_or_else(|| {
                DriverError::collection_not_found(format!("collection {} not found", keyspace))
            })
    }
}

/// Shared in-memory cluster
///
/// Clones share state, so several connectors (and therefore several stores)
/// can operate on the same data.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<Inner>>,
    options: Arc<MemoryOptions>,
}

impl MemoryCluster {
    /// Create a cluster whose collections and indexes are usable immediately
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            options: Arc::new(options),
        }
    }

    /// Connector that hands out this cluster
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            cluster: self.clone(),
        }
    }

    /// Make the next call of `op` fail with `kind`. Calls queue up.
    pub async fn fail_next(&self, op: Operation, kind: DriverErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.failures.entry(op).or_default().push_back(kind);
    }

    /// Number of successful connects so far
    pub async fn connect_count(&self) -> usize {
        self.inner.lock().await.connects
    }

    pub async fn scope_exists(&self, bucket: &str, scope: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .buckets
            .get(bucket)
            .map(|scopes| scopes.contains_key(scope))
            .unwrap_or(false)
    }

    /// Read a document directly, bypassing materialization delays
    pub async fn document(&self, keyspace: &Keyspace, key: &str) -> Option<Value> {
        let inner = self.inner.lock().await;
        inner
            .collection(keyspace)
            .ok()
            .and_then(|c| c.documents.get(key).cloned())
    }

    pub async fn document_count(&self, keyspace: &Keyspace) -> usize {
        let inner = self.inner.lock().await;
        inner
            .collection(keyspace)
            .map(|c| c.documents.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn bucket(&self, name: &str) -> DriverResult<Arc<dyn Bucket>> {
        let mut inner = self.inner.lock().await;
        inner.buckets.entry(name.to_string()).or_default();
        Ok(Arc::new(MemoryBucket {
            name: name.to_string(),
            cluster: self.clone(),
        }))
    }
}

/// Connector for [`MemoryCluster`]
///
/// Credentials are accepted as given.
#[derive(Clone)]
pub struct MemoryConnector {
    cluster: MemoryCluster,
}

impl MemoryConnector {
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &ConnectionTarget) -> DriverResult<Arc<dyn Cluster>> {
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::Connect)?;
        inner.connects += 1;
        tracing::debug!(address = %target.address, "connected to in-memory cluster");
        Ok(Arc::new(self.cluster.clone()))
    }
}

struct MemoryBucket {
    name: String,
    cluster: MemoryCluster,
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_scope(&self, scope: &str) -> DriverResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::CreateScope)?;
        let scopes = inner.buckets.entry(self.name.clone()).or_default();
        if scopes.contains_key(scope) {
            return Err(DriverError::already_exists(format!(
                "scope {} already exists",
                scope
            )));
        }
        scopes.insert(scope.to_string(), ScopeState::default());
        Ok(())
    }

    async fn drop_scope(&self, scope: &str) -> DriverResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::DropScope)?;
        inner
            .buckets
            .get_mut(&self.name)
            .and_then(|scopes| scopes.remove(scope))
            .map(|_| ())
            .ok_or_else(|| DriverError::not_found(format!("scope {} not found", scope)))
    }

    async fn create_collection(&self, scope: &str, collection: &str) -> DriverResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::CreateCollection)?;
        let scope_state = inner
            .buckets
            .get_mut(&self.name)
            .and_then(|scopes| scopes.get_mut(scope))
            .ok_or_else(|| DriverError::not_found(format!("scope {} not found", scope)))?;
        if scope_state.collections.contains_key(collection) {
            return Err(DriverError::already_exists(format!(
                "collection {}.{} already exists",
                scope, collection
            )));
        }
        scope_state.collections.insert(
            collection.to_string(),
            CollectionState {
                created_at: Instant::now(),
                documents: HashMap::new(),
                index_created_at: None,
            },
        );
        Ok(())
    }

    async fn collection(
        &self,
        scope: &str,
        collection: &str,
    ) -> DriverResult<Arc<dyn Collection>> {
        let keyspace = Keyspace::new(&self.name, scope, collection);
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::OpenCollection)?;
        let state = inner.collection(&keyspace)?;
        if state.created_at.elapsed() < self.cluster.options.collection_delay {
            return Err(DriverError::collection_not_found(format!(
                "collection {} not yet available",
                keyspace
            )));
        }
        Ok(Arc::new(MemoryCollection {
            keyspace,
            cluster: self.cluster.clone(),
        }))
    }
}

struct MemoryCollection {
    keyspace: Keyspace,
    cluster: MemoryCluster,
}

#[async_trait]
impl Collection for MemoryCollection {
    fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    async fn upsert(&self, key: &str, value: &Value) -> DriverResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::Upsert)?;
        let state = inner.collection_mut(&self.keyspace)?;
        state.documents.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> DriverResult<Value> {
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::Get)?;
        let state = inner.collection(&self.keyspace)?;
        state
            .documents
            .get(key)
            .cloned()
            .ok_or_else(|| DriverError::not_found(format!("document {} not found", key)))
    }

    async fn remove(&self, key: &str) -> DriverResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::Remove)?;
        let state = inner.collection_mut(&self.keyspace)?;
        state
            .documents
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| DriverError::not_found(format!("document {} not found", key)))
    }

    async fn create_primary_index(&self) -> DriverResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::CreatePrimaryIndex)?;
        let state = inner.collection_mut(&self.keyspace)?;
        if state.index_created_at.is_some() {
            return Err(DriverError::already_exists(format!(
                "primary index on {} already exists",
                self.keyspace
            )));
        }
        state.index_created_at = Some(Instant::now());
        Ok(())
    }

    async fn primary_index_state(&self) -> DriverResult<IndexState> {
        let delay = self.cluster.options.index_delay;
        let mut inner = self.cluster.inner.lock().await;
        inner.take_failure(Operation::IndexState)?;
        let state = inner.collection(&self.keyspace)?;
        let created_at = state.index_created_at.ok_or_else(|| {
            DriverError::not_found(format!("no primary index on {}", self.keyspace))
        })?;
        let index_state = match delay {
            Some(delay) if created_at.elapsed() >= delay => IndexState::Online,
            Some(delay) if created_at.elapsed() < delay / 2 => IndexState::Pending,
            _ => IndexState::Building,
        };
        Ok(index_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open(cluster: &MemoryCluster) -> Arc<dyn Collection> {
        let bucket = cluster.bucket("zotero").await.unwrap();
        bucket.create_scope("u1").await.unwrap();
        bucket.create_collection("u1", "items").await.unwrap();
        bucket.collection("u1", "items").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_scope_twice_reports_already_exists() {
        let cluster = MemoryCluster::new();
        let bucket = cluster.bucket("zotero").await.unwrap();

        bucket.create_scope("u1").await.unwrap();
        let err = bucket.create_scope("u1").await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_upsert_get_remove() {
        let cluster = MemoryCluster::new();
        let items = open(&cluster).await;

        items.upsert("A", &json!({"v": 1})).await.unwrap();
        items.upsert("A", &json!({"v": 2})).await.unwrap();
        assert_eq!(items.get("A").await.unwrap(), json!({"v": 2}));

        items.remove("A").await.unwrap();
        assert!(items.remove("A").await.unwrap_err().is_not_found());
        assert!(items.get("A").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_materializes_after_delay() {
        let cluster = MemoryCluster::with_options(MemoryOptions {
            collection_delay: Duration::from_millis(300),
            index_delay: Some(Duration::ZERO),
        });
        let bucket = cluster.bucket("zotero").await.unwrap();
        bucket.create_scope("g9").await.unwrap();
        bucket.create_collection("g9", "meta").await.unwrap();

        assert!(bucket.collection("g9", "meta").await.err().unwrap().is_collection_not_found());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(bucket.collection("g9", "meta").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_state_progression() {
        let cluster = MemoryCluster::with_options(MemoryOptions {
            collection_delay: Duration::ZERO,
            index_delay: Some(Duration::from_millis(200)),
        });
        let items = open(&cluster).await;

        assert!(items.primary_index_state().await.unwrap_err().is_not_found());
        items.create_primary_index().await.unwrap();
        assert_eq!(items.primary_index_state().await.unwrap(), IndexState::Pending);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(items.primary_index_state().await.unwrap(), IndexState::Building);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(items.primary_index_state().await.unwrap(), IndexState::Online);
    }

    #[tokio::test]
    async fn test_drop_scope_removes_documents() {
        let cluster = MemoryCluster::new();
        let items = open(&cluster).await;
        items.upsert("A", &json!({})).await.unwrap();

        let bucket = cluster.bucket("zotero").await.unwrap();
        bucket.drop_scope("u1").await.unwrap();

        assert!(!cluster.scope_exists("zotero", "u1").await);
        assert!(items.get("A").await.unwrap_err().is_collection_not_found());
        assert!(items.remove("A").await.unwrap_err().is_collection_not_found());
        assert!(bucket.drop_scope("u1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fail_next_fires_once() {
        let cluster = MemoryCluster::new();
        let items = open(&cluster).await;
        cluster.fail_next(Operation::Upsert, DriverErrorKind::Other).await;

        let err = items.upsert("A", &json!({})).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Other);
        items.upsert("A", &json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_connector_counts_connects() {
        let cluster = MemoryCluster::new();
        let connector = cluster.connector();
        let target = ConnectionTarget {
            address: "memory://".to_string(),
            username: String::new(),
            password: String::new(),
        };

        connector.connect(&target).await.unwrap();
        cluster.fail_next(Operation::Connect, DriverErrorKind::Connection).await;
        assert!(connector.connect(&target).await.is_err());
        assert_eq!(cluster.connect_count().await, 1);
    }
}
