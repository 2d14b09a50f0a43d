//! SQLite Storage Driver
//!
//! Maps the bucket / scope / collection hierarchy onto four tables in a single
//! SQLite file:
//! - `scopes` and `collections` record the schema objects
//! - `primary_indexes` records which collections carry a primary index
//! - `documents` holds the JSON documents, keyed by collection and document key
//!
//! Schema objects are usable as soon as they are created and indexes come online
//! immediately. Blocking work runs on `spawn_blocking` against an r2d2 pool.

use super::{
    Bucket, Cluster, Collection, ConnectionTarget, Connector, DriverError, DriverErrorKind,
    DriverResult, IndexState, Keyspace,
};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

const ADDRESS_PREFIX: &str = "sqlite://";

fn storage_err(context: &str, e: rusqlite::Error) -> DriverError {
    DriverError::other(format!("{}: {}", context, e))
}

/// Opens a pooled SQLite database named by the connection address
///
/// The address is either `sqlite://<path>` or a bare path. Credentials are
/// ignored.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    pool_size: u32,
}

impl SqliteConnector {
    pub fn new() -> Self {
        Self { pool_size: 4 }
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    fn database_path(address: &str) -> PathBuf {
        PathBuf::from(address.strip_prefix(ADDRESS_PREFIX).unwrap_or(address))
    }
}

impl Default for SqliteConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self, target: &ConnectionTarget) -> DriverResult<Arc<dyn Cluster>> {
        let path = Self::database_path(&target.address);
        let pool_size = self.pool_size;

        let cluster = tokio::task::spawn_blocking(move || SqliteCluster::open(path, pool_size))
            .await
            .map_err(|e| DriverError::other(format!("Task join error: {}", e)))??;

        Ok(Arc::new(cluster))
    }
}

/// SQLite-backed cluster
#[derive(Clone)]
pub struct SqliteCluster {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteCluster {
    /// Open (or create) the database file and initialize the schema
    pub fn open(path: PathBuf, pool_size: u32) -> DriverResult<Self> {
        let manager = SqliteConnectionManager::file(&path)
            .with_init(|c| c.execute_batch("PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| {
                DriverError::connection(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let conn = pool.get().map_err(|e| {
            DriverError::connection(format!("Failed to get connection: {}", e))
        })?;
        Self::init_schema(&conn)?;

        tracing::debug!(path = %path.display(), "opened sqlite cluster");
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn init_schema(conn: &Connection) -> DriverResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scopes (
                bucket TEXT NOT NULL,
                scope TEXT NOT NULL,
                PRIMARY KEY (bucket, scope)
            );

            CREATE TABLE IF NOT EXISTS collections (
                bucket TEXT NOT NULL,
                scope TEXT NOT NULL,
                collection TEXT NOT NULL,
                PRIMARY KEY (bucket, scope, collection)
            );

            CREATE TABLE IF NOT EXISTS primary_indexes (
                bucket TEXT NOT NULL,
                scope TEXT NOT NULL,
                collection TEXT NOT NULL,
                PRIMARY KEY (bucket, scope, collection)
            );

            CREATE TABLE IF NOT EXISTS documents (
                bucket TEXT NOT NULL,
                scope TEXT NOT NULL,
                collection TEXT NOT NULL,
                doc_key TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (bucket, scope, collection, doc_key)
            );
            "#,
        )
        .map_err(|e| storage_err("Failed to initialize schema", e))
    }

    async fn run<T, F>(&self, f: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> DriverResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                DriverError::new(
                    DriverErrorKind::Unavailable,
                    format!("Failed to get connection: {}", e),
                )
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| DriverError::other(format!("Task join error: {}", e)))?
    }
}

fn collection_exists(conn: &Connection, ks: &Keyspace) -> DriverResult<bool> {
    conn.query_row(
        "SELECT 1 FROM collections WHERE bucket = ? AND scope = ? AND collection = ?",
        params![ks.bucket, ks.scope, ks.collection],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(|e| storage_err("Failed to look up collection", e))
}

fn require_collection(conn: &Connection, ks: &Keyspace) -> DriverResult<()> {
    if collection_exists(conn, ks)? {
        Ok(())
    } else {
        Err(DriverError::collection_not_found(format!("collection {} not found", ks)))
    }
}

#[async_trait]
impl Cluster for SqliteCluster {
    async fn bucket(&self, name: &str) -> DriverResult<Arc<dyn Bucket>> {
        Ok(Arc::new(SqliteBucket {
            name: name.to_string(),
            cluster: self.clone(),
        }))
    }
}

struct SqliteBucket {
    name: String,
    cluster: SqliteCluster,
}

#[async_trait]
impl Bucket for SqliteBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_scope(&self, scope: &str) -> DriverResult<()> {
        let bucket = self.name.clone();
        let scope = scope.to_string();

        self.cluster
            .run(move |conn| {
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO scopes (bucket, scope) VALUES (?, ?)",
                        params![bucket, scope],
                    )
                    .map_err(|e| storage_err("Failed to create scope", e))?;
                if inserted == 0 {
                    return Err(DriverError::already_exists(format!(
                        "scope {} already exists",
                        scope
                    )));
                }
                Ok(())
            })
            .await
    }

    async fn drop_scope(&self, scope: &str) -> DriverResult<()> {
        let bucket = self.name.clone();
        let scope = scope.to_string();

        self.cluster
            .run(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(|e| storage_err("Failed to begin transaction", e))?;

                for table in ["documents", "primary_indexes", "collections"] {
                    tx.execute(
                        &format!("DELETE FROM {} WHERE bucket = ? AND scope = ?", table),
                        params![bucket, scope],
                    )
                    .map_err(|e| storage_err("Failed to drop scope contents", e))?;
                }
                let dropped = tx
                    .execute(
                        "DELETE FROM scopes WHERE bucket = ? AND scope = ?",
                        params![bucket, scope],
                    )
                    .map_err(|e| storage_err("Failed to drop scope", e))?;

                tx.commit()
                    .map_err(|e| storage_err("Failed to commit transaction", e))?;

                if dropped == 0 {
                    return Err(DriverError::not_found(format!("scope {} not found", scope)));
                }
                Ok(())
            })
            .await
    }

    async fn create_collection(&self, scope: &str, collection: &str) -> DriverResult<()> {
        let ks = Keyspace::new(&self.name, scope, collection);

        self.cluster
            .run(move |conn| {
                let scope_exists = conn
                    .query_row(
                        "SELECT 1 FROM scopes WHERE bucket = ? AND scope = ?",
                        params![ks.bucket, ks.scope],
                        |_| Ok(()),
                    )
                    .optional()
                    .map_err(|e| storage_err("Failed to look up scope", e))?
                    .is_some();
                if !scope_exists {
                    return Err(DriverError::not_found(format!("scope {} not found", ks.scope)));
                }

                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO collections (bucket, scope, collection) VALUES (?, ?, ?)",
                        params![ks.bucket, ks.scope, ks.collection],
                    )
                    .map_err(|e| storage_err("Failed to create collection", e))?;
                if inserted == 0 {
                    return Err(DriverError::already_exists(format!(
                        "collection {} already exists",
                        ks
                    )));
                }
                Ok(())
            })
            .await
    }

    async fn collection(
        &self,
        scope: &str,
        collection: &str,
    ) -> DriverResult<Arc<dyn Collection>> {
        let ks = Keyspace::new(&self.name, scope, collection);
        let lookup = ks.clone();

        self.cluster
            .run(move |conn| require_collection(conn, &lookup))
            .await?;

        Ok(Arc::new(SqliteCollection {
            keyspace: ks,
            cluster: self.cluster.clone(),
        }))
    }
}

struct SqliteCollection {
    keyspace: Keyspace,
    cluster: SqliteCluster,
}

#[async_trait]
impl Collection for SqliteCollection {
    fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    async fn upsert(&self, key: &str, value: &Value) -> DriverResult<()> {
        let ks = self.keyspace.clone();
        let key = key.to_string();
        let body = serde_json::to_string(value)
            .map_err(|e| DriverError::other(format!("Failed to encode document: {}", e)))?;

        self.cluster
            .run(move |conn| {
                require_collection(conn, &ks)?;
                conn.execute(
                    r#"
                    INSERT INTO documents (bucket, scope, collection, doc_key, body)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(bucket, scope, collection, doc_key) DO UPDATE SET
                        body = excluded.body
                    "#,
                    params![ks.bucket, ks.scope, ks.collection, key, body],
                )
                .map_err(|e| storage_err("Failed to upsert document", e))?;
                Ok(())
            })
            .await
    }

    async fn get(&self, key: &str) -> DriverResult<Value> {
        let ks = self.keyspace.clone();
        let key = key.to_string();

        let body = self
            .cluster
            .run(move |conn| {
                require_collection(conn, &ks)?;
                conn.query_row(
                    "SELECT body FROM documents WHERE bucket = ? AND scope = ? AND collection = ? AND doc_key = ?",
                    params![ks.bucket, ks.scope, ks.collection, key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(|e| storage_err("Failed to read document", e))?
                .ok_or_else(|| DriverError::not_found(format!("document {} not found", key)))
            })
            .await?;

        serde_json::from_str(&body)
            .map_err(|e| DriverError::other(format!("Failed to decode document: {}", e)))
    }

    async fn remove(&self, key: &str) -> DriverResult<()> {
        let ks = self.keyspace.clone();
        let key = key.to_string();

        self.cluster
            .run(move |conn| {
                require_collection(conn, &ks)?;
                let removed = conn
                    .execute(
                        "DELETE FROM documents WHERE bucket = ? AND scope = ? AND collection = ? AND doc_key = ?",
                        params![ks.bucket, ks.scope, ks.collection, key],
                    )
                    .map_err(|e| storage_err("Failed to remove document", e))?;
                if removed == 0 {
                    return Err(DriverError::not_found(format!("document {} not found", key)));
                }
                Ok(())
            })
            .await
    }

    async fn create_primary_index(&self) -> DriverResult<()> {
        let ks = self.keyspace.clone();

        self.cluster
            .run(move |conn| {
                require_collection(conn, &ks)?;
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO primary_indexes (bucket, scope, collection) VALUES (?, ?, ?)",
                        params![ks.bucket, ks.scope, ks.collection],
                    )
                    .map_err(|e| storage_err("Failed to create primary index", e))?;
                if inserted == 0 {
                    return Err(DriverError::already_exists(format!(
                        "primary index on {} already exists",
                        ks
                    )));
                }
                Ok(())
            })
            .await
    }

    async fn primary_index_state(&self) -> DriverResult<IndexState> {
        let ks = self.keyspace.clone();

        self.cluster
            .run(move |conn| {
                require_collection(conn, &ks)?;
                conn.query_row(
                    "SELECT 1 FROM primary_indexes WHERE bucket = ? AND scope = ? AND collection = ?",
                    params![ks.bucket, ks.scope, ks.collection],
                    |_| Ok(IndexState::Online),
                )
                .optional()
                .map_err(|e| storage_err("Failed to read index state", e))?
                .ok_or_else(|| DriverError::not_found(format!("no primary index on {}", ks)))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn target(path: &std::path::Path) -> ConnectionTarget {
        ConnectionTarget {
            address: format!("{}{}", ADDRESS_PREFIX, path.display()),
            username: String::new(),
            password: String::new(),
        }
    }

    #[test]
    fn test_database_path_accepts_prefix_and_bare_path() {
        assert_eq!(
            SqliteConnector::database_path("sqlite:///tmp/a.db"),
            PathBuf::from("/tmp/a.db")
        );
        assert_eq!(
            SqliteConnector::database_path("data/b.db"),
            PathBuf::from("data/b.db")
        );
    }

    #[tokio::test]
    async fn test_sqlite_documents_roundtrip() {
        let dir = tempdir().unwrap();
        let cluster = SqliteConnector::new()
            .connect(&target(&dir.path().join("store.db")))
            .await
            .unwrap();
        let bucket = cluster.bucket("zotero").await.unwrap();

        bucket.create_scope("u1").await.unwrap();
        assert!(bucket.create_scope("u1").await.unwrap_err().is_already_exists());
        assert!(bucket.collection("u1", "items").await.err().unwrap().is_collection_not_found());

        bucket.create_collection("u1", "items").await.unwrap();
        let items = bucket.collection("u1", "items").await.unwrap();

        items.upsert("A", &json!({"title": "one"})).await.unwrap();
        items.upsert("A", &json!({"title": "two"})).await.unwrap();
        assert_eq!(items.get("A").await.unwrap(), json!({"title": "two"}));

        items.remove("A").await.unwrap();
        assert!(items.remove("A").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sqlite_primary_index() {
        let dir = tempdir().unwrap();
        let cluster = SqliteConnector::new()
            .connect(&target(&dir.path().join("store.db")))
            .await
            .unwrap();
        let bucket = cluster.bucket("zotero").await.unwrap();
        bucket.create_scope("g5").await.unwrap();
        bucket.create_collection("g5", "meta").await.unwrap();
        let meta = bucket.collection("g5", "meta").await.unwrap();

        assert!(meta.primary_index_state().await.unwrap_err().is_not_found());
        meta.create_primary_index().await.unwrap();
        assert!(meta.create_primary_index().await.unwrap_err().is_already_exists());
        assert_eq!(meta.primary_index_state().await.unwrap(), IndexState::Online);
    }

    #[tokio::test]
    async fn test_sqlite_drop_scope() {
        let dir = tempdir().unwrap();
        let cluster = SqliteConnector::new()
            .connect(&target(&dir.path().join("store.db")))
            .await
            .unwrap();
        let bucket = cluster.bucket("zotero").await.unwrap();
        bucket.create_scope("g5").await.unwrap();
        bucket.create_collection("g5", "items").await.unwrap();
        let items = bucket.collection("g5", "items").await.unwrap();
        items.upsert("K", &json!(1)).await.unwrap();

        bucket.drop_scope("g5").await.unwrap();
        assert!(bucket.drop_scope("g5").await.unwrap_err().is_not_found());
        assert!(items.get("K").await.unwrap_err().is_collection_not_found());
        assert!(items.remove("K").await.unwrap_err().is_collection_not_found());
        assert!(items.upsert("K", &json!(2)).await.unwrap_err().is_collection_not_found());
    }
}
