//! Persistence for service records.
//!
//! The provisioner and the reconciler only see the [`ServiceStore`] trait. Two
//! implementations exist:
//!
//! - [`sqlite::SqliteServiceStore`]: durable storage in a SQLite file, schema
//!   managed by the embedded migrations under `migrations/`.
//! - [`in_memory::InMemoryServiceStore`]: a concurrent map, used by tests and by
//!   the `memory` database setting.
//!
//! Both give per-key atomic create, find and delete. A second `create` for a
//! `service_id` that is already stored fails with [`DbError::UniqueViolation`].
//!
//! # Migrations
//!
//! ```ignore
//! sharedfs::migrator().run(&pool).await?;
//! ```

pub mod errors;
pub mod in_memory;
pub mod models;
pub mod sqlite;

use async_trait::async_trait;

pub use errors::{DbError, Result};
pub use in_memory::InMemoryServiceStore;
pub use models::ServiceRecord;
pub use sqlite::SqliteServiceStore;

/// Keyed storage of [`ServiceRecord`]s.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Insert a new record. Fails if the `service_id` is already present.
    async fn create(&self, record: &ServiceRecord) -> Result<ServiceRecord>;

    async fn find_by_service_id(&self, service_id: &str) -> Result<Option<ServiceRecord>>;

    async fn exists_by_service_id(&self, service_id: &str) -> Result<bool>;

    /// Remove the record, returning whether one was present.
    async fn delete_by_service_id(&self, service_id: &str) -> Result<bool>;

    /// Every record, in insertion order.
    async fn all(&self) -> Result<Vec<ServiceRecord>>;
}
