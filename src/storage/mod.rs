//! Durable task storage.
//!
//! The storage system consists of:
//! - **TaskStore**: the record-store contract the orchestrator depends on
//! - **SqliteTaskStore**: the shipped implementation, backed by SQLite via sqlx
//! - **RetryPolicy**: bounded retry applied to store and lookup calls
//! - **InstanceLease**: keeps a second orchestrator off a store in use
//!
//! # Usage
//!
//! ```rust,ignore
//! use recon_forge::storage::{SqliteTaskStore, TaskFilter, TaskStore};
//!
//! let store = SqliteTaskStore::open("recon.db").await?;
//! let queued = store.list(&TaskFilter::queued()).await?;
//! ```

pub mod lease;
pub mod retry;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use lease::{InstanceLease, LeaseClaim, LeaseHolder, LeaseState};
pub use retry::RetryPolicy;
pub use sqlite::SqliteTaskStore;
pub use store::{StoreError, TaskFilter, TaskStore};
