//! Provisioning helpers
//!
//! Every step is idempotent: "already exists" counts as success, so the same
//! sequence can run on every sync and from several processes at once. Creation
//! is asynchronous on the server, so a successful create is confirmed by
//! polling until the object is usable.

use crate::driver::{Bucket, Collection, DriverErrorKind, DriverResult};
use crate::error::{StoreError, StoreResult};
use crate::policy::ErrorPolicy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Deadline and interval for provisioning polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

fn created(result: DriverResult<()>) -> StoreResult<()> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other.map_err(StoreError::from),
    }
}

fn is_transient(kind: DriverErrorKind) -> bool {
    matches!(
        kind,
        DriverErrorKind::NotFound | DriverErrorKind::CollectionNotFound | DriverErrorKind::Unavailable
    )
}

/// Poll `attempt` until it yields a value or the deadline passes.
///
/// `Ok(None)` means "not yet". Errors end the wait immediately.
pub async fn wait_until<T, F, Fut>(target: &str, poll: PollSettings, mut attempt: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<Option<T>>>,
{
    let start = Instant::now();
    let deadline = start + poll.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = attempt().await? {
            tracing::trace!(target_object = target, attempts, "ready");
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            crate::metrics::record_provision_timeout();
            tracing::warn!(target_object = target, attempts, "gave up waiting");
            return Err(StoreError::Timeout {
                target: target.to_string(),
                elapsed: now - start,
            });
        }
        tokio::time::sleep(poll.interval.min(deadline - now)).await;
    }
}

/// Create `scope` unless it exists
pub async fn ensure_scope(bucket: &dyn Bucket, scope: &str, policy: ErrorPolicy) -> StoreResult<()> {
    let result = created(bucket.create_scope(scope).await);
    policy.apply("create_scope", result)
}

/// Create `scope.collection` unless it exists
pub async fn ensure_collection(
    bucket: &dyn Bucket,
    scope: &str,
    collection: &str,
    policy: ErrorPolicy,
) -> StoreResult<()> {
    let result = created(bucket.create_collection(scope, collection).await);
    policy.apply("create_collection", result)
}

/// Wait until `scope.collection` can be opened and return the live handle
pub async fn wait_for_collection(
    bucket: &dyn Bucket,
    scope: &str,
    collection: &str,
    poll: PollSettings,
) -> StoreResult<Arc<dyn Collection>> {
    let target = format!("collection {}.{}.{}", bucket.name(), scope, collection);

    wait_until(&target, poll, move || async move {
        match bucket.collection(scope, collection).await {
            Ok(handle) => Ok(Some(handle)),
            Err(e) if is_transient(e.kind) => Ok(None),
            Err(e) => Err(e.into()),
        }
    })
    .await
}

/// Create the primary index of `collection` unless it exists, then wait
/// until it reports `Online`
pub async fn ensure_primary_index(
    collection: &dyn Collection,
    policy: ErrorPolicy,
    poll: PollSettings,
) -> StoreResult<()> {
    let result = created(collection.create_primary_index().await);
    policy.apply("create_primary_index", result)?;

    let target = format!("primary index on {}", collection.keyspace());
    wait_until(&target, poll, move || async move {
        match collection.primary_index_state().await {
            Ok(state) if state.is_online() => Ok(Some(())),
            Ok(_) => Ok(None),
            Err(e) if is_transient(e.kind) => Ok(None),
            Err(e) => Err(e.into()),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Cluster, MemoryCluster, MemoryOptions, Operation};

    const POLL: PollSettings = PollSettings {
        timeout: Duration::from_millis(1000),
        interval: Duration::from_millis(100),
    };

    async fn bucket(cluster: &MemoryCluster) -> Arc<dyn Bucket> {
        cluster.bucket("zotero").await.unwrap()
    }

    #[tokio::test]
    async fn test_ensure_scope_is_idempotent() {
        let cluster = MemoryCluster::new();
        let bucket = bucket(&cluster).await;

        ensure_scope(bucket.as_ref(), "u1", ErrorPolicy::Throw).await.unwrap();
        ensure_scope(bucket.as_ref(), "u1", ErrorPolicy::Throw).await.unwrap();
        assert!(cluster.scope_exists("zotero", "u1").await);
    }

    #[tokio::test]
    async fn test_ensure_scope_failure_follows_policy() {
        let cluster = MemoryCluster::new();
        let bucket = bucket(&cluster).await;

        cluster.fail_next(Operation::CreateScope, DriverErrorKind::Other).await;
        assert!(ensure_scope(bucket.as_ref(), "u1", ErrorPolicy::Throw).await.is_err());

        cluster.fail_next(Operation::CreateScope, DriverErrorKind::Other).await;
        assert!(ensure_scope(bucket.as_ref(), "u1", ErrorPolicy::Log).await.is_ok());
        assert!(!cluster.scope_exists("zotero", "u1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_collection_polls_until_visible() {
        let cluster = MemoryCluster::with_options(MemoryOptions {
            collection_delay: Duration::from_millis(350),
            index_delay: Some(Duration::ZERO),
        });
        let bucket = bucket(&cluster).await;
        ensure_scope(bucket.as_ref(), "g3", ErrorPolicy::Throw).await.unwrap();
        ensure_collection(bucket.as_ref(), "g3", "items", ErrorPolicy::Throw)
            .await
            .unwrap();

        let start = Instant::now();
        let handle = wait_for_collection(bucket.as_ref(), "g3", "items", POLL)
            .await
            .unwrap();

        assert_eq!(handle.keyspace().collection, "items");
        assert!(start.elapsed() >= Duration::from_millis(350));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_missing_collection_times_out() {
        let cluster = MemoryCluster::new();
        let bucket = bucket(&cluster).await;

        let err = wait_for_collection(bucket.as_ref(), "nope", "items", POLL)
            .await
            .err()
            .unwrap();
        match err {
            StoreError::Timeout { target, elapsed } => {
                assert_eq!(target, "collection zotero.nope.items");
                assert!(elapsed >= POLL.timeout);
                assert!(elapsed < POLL.timeout + POLL.interval);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_index_waits_for_online() {
        let cluster = MemoryCluster::with_options(MemoryOptions {
            collection_delay: Duration::ZERO,
            index_delay: Some(Duration::from_millis(400)),
        });
        let bucket = bucket(&cluster).await;
        ensure_scope(bucket.as_ref(), "u1", ErrorPolicy::Throw).await.unwrap();
        ensure_collection(bucket.as_ref(), "u1", "meta", ErrorPolicy::Throw)
            .await
            .unwrap();
        let meta = wait_for_collection(bucket.as_ref(), "u1", "meta", POLL)
            .await
            .unwrap();

        ensure_primary_index(meta.as_ref(), ErrorPolicy::Throw, POLL)
            .await
            .unwrap();
        assert!(meta.primary_index_state().await.unwrap().is_online());

        // Second run finds the index already there.
        ensure_primary_index(meta.as_ref(), ErrorPolicy::Throw, POLL)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_index_never_online_times_out() {
        let cluster = MemoryCluster::with_options(MemoryOptions {
            collection_delay: Duration::ZERO,
            index_delay: None,
        });
        let bucket = bucket(&cluster).await;
        ensure_scope(bucket.as_ref(), "u1", ErrorPolicy::Throw).await.unwrap();
        ensure_collection(bucket.as_ref(), "u1", "items", ErrorPolicy::Throw)
            .await
            .unwrap();
        let items = wait_for_collection(bucket.as_ref(), "u1", "items", POLL)
            .await
            .unwrap();

        let err = ensure_primary_index(items.as_ref(), ErrorPolicy::Log, POLL)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_non_transient_error_ends_wait() {
        let cluster = MemoryCluster::new();
        let bucket = bucket(&cluster).await;
        cluster.fail_next(Operation::OpenCollection, DriverErrorKind::Other).await;

        let err = wait_for_collection(bucket.as_ref(), "u1", "items", POLL)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Driver(_)));
    }
}
