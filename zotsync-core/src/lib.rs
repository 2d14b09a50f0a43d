//! Storage adapter that mirrors a library synchronization feed into a
//! bucket / scope / collection document database.
//!
//! The synchronization engine drives the adapter through [`Store`] and
//! [`Library`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use zotsync_core::{driver::SqliteConnector, Store, StoreConfig};
//!
//! # async fn sync() -> zotsync_core::StoreResult<()> {
//! let store = Store::new(StoreConfig::new("sqlite://mirror.db"), Arc::new(SqliteConnector::new()))?;
//! let mut library = store.get("users/12345").await?;
//! if library.version() < 42 {
//!     library.add(&json!({"key": "ABCD2345", "data": {"title": "Paper"}})).await?;
//!     library.remove(&["WXYZ6789"]).await?;
//!     library.save("", 42).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod library;
pub mod logging;
pub mod metrics;
pub mod naming;
pub mod policy;
pub mod provision;
pub mod store;

pub use config::{ConfigError, StoreConfig};
pub use connection::ConnectionManager;
pub use error::{StoreError, StoreResult};
pub use library::{Library, LibraryState, ObjectType};
pub use logging::{init_logging, LoggingConfig};
pub use naming::{DefaultNamer, LibraryKind, PartitionNamer};
pub use policy::ErrorPolicy;
pub use store::Store;
