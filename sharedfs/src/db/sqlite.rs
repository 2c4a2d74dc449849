//! SQLite implementation of [`ServiceStore`].

use super::{Result, ServiceRecord, ServiceStore};
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use tracing::instrument;

const COLUMNS: &str = "service_id, plan_id, quota, username, uid, gid";

/// Store backed by a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteServiceStore {
    pool: SqlitePool,
}

impl SqliteServiceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and bring its schema up to date.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        crate::migrator().run(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ServiceStore for SqliteServiceStore {
    #[instrument(skip(self, record), fields(service_id = %record.service_id), err)]
    async fn create(&self, record: &ServiceRecord) -> Result<ServiceRecord> {
        let query = format!("INSERT INTO services ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}");
        let created = sqlx::query_as::<_, ServiceRecord>(&query)
            .bind(&record.service_id)
            .bind(&record.plan_id)
            .bind(&record.quota)
            .bind(&record.username)
            .bind(&record.uid)
            .bind(&record.gid)
            .fetch_one(&self.pool)
            .await?;
        Ok(created)
    }

    #[instrument(skip(self), err)]
    async fn find_by_service_id(&self, service_id: &str) -> Result<Option<ServiceRecord>> {
        let query = format!("SELECT {COLUMNS} FROM services WHERE service_id = ?");
        let record = sqlx::query_as::<_, ServiceRecord>(&query)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    #[instrument(skip(self), err)]
    async fn exists_by_service_id(&self, service_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM services WHERE service_id = ?)")
            .bind(service_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    #[instrument(skip(self), err)]
    async fn delete_by_service_id(&self, service_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM services WHERE service_id = ?")
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn all(&self) -> Result<Vec<ServiceRecord>> {
        let query = format!("SELECT {COLUMNS} FROM services ORDER BY id");
        let records = sqlx::query_as::<_, ServiceRecord>(&query).fetch_all(&self.pool).await?;
        Ok(records)
    }
}
