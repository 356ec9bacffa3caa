//! Database access layer for the callback ledger.
//!
//! All ledger reads and writes go through a [`CallbackLogRepository`]. The
//! PostgreSQL implementation is used in production; the in-memory one backs
//! tests and database-less runs.

use std::sync::Arc;

use sqlx::PgPool;

pub mod callback_logs;

pub use callback_logs::{CallbackLogRepository, InMemoryRepository, Repository};

use crate::error::Result;

/// Idempotent bootstrap DDL for the ledger table.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS callback_logs (
    id            UUID PRIMARY KEY,
    user_id       UUID NOT NULL,
    txn_id        UUID NOT NULL UNIQUE,
    merchant_id   UUID NOT NULL,
    callback_url  TEXT NOT NULL,
    status        SMALLINT NOT NULL CHECK (status BETWEEN 0 AND 4),
    request_body  TEXT NOT NULL,
    response_body TEXT,
    retry_count   INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_callback_logs_merchant_created
    ON callback_logs (merchant_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_callback_logs_status_updated
    ON callback_logs (status, updated_at);
";

/// Shared handle to the PostgreSQL-backed ledger.
#[derive(Clone)]
pub struct Storage {
    /// Callback ledger repository.
    pub callback_logs: Arc<Repository>,
}

impl Storage {
    /// Creates a storage instance over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { callback_logs: Arc::new(Repository::new(Arc::new(pool))) }
    }

    /// Creates the ledger table and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&*self.callback_logs.pool()).await?;
        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.callback_logs.pool()).await?;
        Ok(())
    }
}
