//! Repository for callback ledger operations.
//!
//! Persists one `CallbackLog` row per transaction and enforces at the storage
//! boundary that terminal rows are never rewritten and that status codes read
//! back from the database are in range.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::{
    error::{CoreError, Result},
    models::{
        CallbackLog, CallbackLogId, CallbackStatus, MerchantId, Page, Pagination, TransactionId,
        UserId,
    },
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Ledger operations required by the delivery use case and read API.
pub trait CallbackLogRepository: Send + Sync + 'static {
    /// Inserts a new row.
    ///
    /// Fails with `CoreError::ConstraintViolation` if a row for the same
    /// transaction already exists.
    fn create(&self, log: &CallbackLog) -> BoxFuture<'_, CallbackLogId>;

    /// Fetches a row by primary key.
    fn get_by_id(&self, id: CallbackLogId) -> BoxFuture<'_, Option<CallbackLog>>;

    /// Persists the mutable columns of an existing row.
    ///
    /// Fails with `CoreError::NotFound` for an unknown id and with
    /// `CoreError::InvalidTransition` if the stored row is already terminal.
    fn update(&self, log: &CallbackLog) -> BoxFuture<'_, ()>;

    /// Fetches the row for a transaction.
    fn get_by_transaction_id(&self, txn_id: TransactionId)
        -> BoxFuture<'_, Option<CallbackLog>>;

    /// Lists rows with the given raw status code.
    ///
    /// Fails with `CoreError::InvalidStatus` if `status` is not a valid code.
    fn get_by_status(&self, status: i16) -> BoxFuture<'_, Vec<CallbackLog>>;

    /// Lists a merchant's rows, newest first.
    fn get_by_merchant_id(
        &self,
        merchant_id: MerchantId,
        pagination: Pagination,
    ) -> BoxFuture<'_, Page<CallbackLog>>;

    /// Lists all rows, newest first.
    fn get_all(&self, pagination: Pagination) -> BoxFuture<'_, Page<CallbackLog>>;
}

/// Raw database row; `status` is decoded through `CallbackStatus::try_from`.
#[derive(Debug, sqlx::FromRow)]
struct CallbackLogRow {
    id: CallbackLogId,
    user_id: UserId,
    txn_id: TransactionId,
    merchant_id: MerchantId,
    callback_url: String,
    status: i16,
    request_body: String,
    response_body: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CallbackLogRow> for CallbackLog {
    type Error = CoreError;

    fn try_from(row: CallbackLogRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            txn_id: row.txn_id,
            merchant_id: row.merchant_id,
            callback_url: row.callback_url,
            status: CallbackStatus::try_from(row.status)?,
            request_body: row.request_body,
            response_body: row.response_body,
            retry_count: row.retry_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_rows(rows: Vec<CallbackLogRow>) -> Result<Vec<CallbackLog>> {
    rows.into_iter().map(CallbackLog::try_from).collect()
}

fn total_from(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

const SELECT_COLUMNS: &str = r"
    SELECT id, user_id, txn_id, merchant_id, callback_url, status,
           request_body, response_body, retry_count, created_at, updated_at
    FROM callback_logs
";

/// PostgreSQL-backed ledger repository.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a row.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` on a duplicate transaction id.
    pub async fn insert(&self, log: &CallbackLog) -> Result<CallbackLogId> {
        let id: uuid::Uuid = sqlx::query_scalar(
            r"
            INSERT INTO callback_logs (
                id, user_id, txn_id, merchant_id, callback_url, status,
                request_body, response_body, retry_count, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            ",
        )
        .bind(log.id)
        .bind(log.user_id)
        .bind(log.txn_id)
        .bind(log.merchant_id)
        .bind(&log.callback_url)
        .bind(log.status.code())
        .bind(&log.request_body)
        .bind(&log.response_body)
        .bind(log.retry_count)
        .bind(log.created_at)
        .bind(log.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(CallbackLogId(id))
    }

    /// Finds a row by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored status is out of range.
    pub async fn find_by_id(&self, id: CallbackLogId) -> Result<Option<CallbackLog>> {
        let row = sqlx::query_as::<_, CallbackLogRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        row.map(CallbackLog::try_from).transpose()
    }

    /// Finds the row for a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored status is out of range.
    pub async fn find_by_transaction_id(
        &self,
        txn_id: TransactionId,
    ) -> Result<Option<CallbackLog>> {
        let row =
            sqlx::query_as::<_, CallbackLogRow>(&format!("{SELECT_COLUMNS} WHERE txn_id = $1"))
                .bind(txn_id)
                .fetch_optional(&*self.pool)
                .await?;

        row.map(CallbackLog::try_from).transpose()
    }

    /// Writes status, response body, retry count and `updated_at`.
    ///
    /// Terminal rows are excluded by the `WHERE` clause; a miss is then
    /// classified as unknown id or illegal transition.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` or `CoreError::InvalidTransition`.
    pub async fn save(&self, log: &CallbackLog) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE callback_logs
            SET status = $2,
                response_body = $3,
                retry_count = $4,
                updated_at = $5
            WHERE id = $1
              AND status NOT IN ($6, $7)
            ",
        )
        .bind(log.id)
        .bind(log.status.code())
        .bind(&log.response_body)
        .bind(log.retry_count)
        .bind(log.updated_at)
        .bind(CallbackStatus::Success.code())
        .bind(CallbackStatus::Expired.code())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.find_by_id(log.id).await? {
            None => Err(CoreError::NotFound(format!("callback log {}", log.id))),
            Some(stored) => {
                Err(CoreError::InvalidTransition { from: stored.status, to: log.status })
            },
        }
    }

    /// Lists rows with a given status, oldest update first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_status(&self, status: CallbackStatus) -> Result<Vec<CallbackLog>> {
        let rows = sqlx::query_as::<_, CallbackLogRow>(&format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY updated_at ASC"
        ))
        .bind(status.code())
        .fetch_all(&*self.pool)
        .await?;

        decode_rows(rows)
    }

    /// Lists a merchant's rows, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_merchant(
        &self,
        merchant_id: MerchantId,
        pagination: Pagination,
    ) -> Result<Page<CallbackLog>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM callback_logs WHERE merchant_id = $1")
                .bind(merchant_id)
                .fetch_one(&*self.pool)
                .await?;

        let rows = sqlx::query_as::<_, CallbackLogRow>(&format!(
            "{SELECT_COLUMNS} WHERE merchant_id = $1 ORDER BY created_at DESC, id LIMIT $2 OFFSET $3"
        ))
        .bind(merchant_id)
        .bind(pagination.limit())
        .bind(pagination.offset())
        .fetch_all(&*self.pool)
        .await?;

        Ok(Page {
            items: decode_rows(rows)?,
            total: total_from(total),
            page: pagination.page,
            page_size: pagination.page_size,
        })
    }

    /// Lists all rows, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_all(&self, pagination: Pagination) -> Result<Page<CallbackLog>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM callback_logs")
            .fetch_one(&*self.pool)
            .await?;

        let rows = sqlx::query_as::<_, CallbackLogRow>(&format!(
            "{SELECT_COLUMNS} ORDER BY created_at DESC, id LIMIT $1 OFFSET $2"
        ))
        .bind(pagination.limit())
        .bind(pagination.offset())
        .fetch_all(&*self.pool)
        .await?;

        Ok(Page {
            items: decode_rows(rows)?,
            total: total_from(total),
            page: pagination.page,
            page_size: pagination.page_size,
        })
    }
}

impl CallbackLogRepository for Repository {
    fn create(&self, log: &CallbackLog) -> BoxFuture<'_, CallbackLogId> {
        let log = log.clone();
        Box::pin(async move { self.insert(&log).await })
    }

    fn get_by_id(&self, id: CallbackLogId) -> BoxFuture<'_, Option<CallbackLog>> {
        Box::pin(self.find_by_id(id))
    }

    fn update(&self, log: &CallbackLog) -> BoxFuture<'_, ()> {
        let log = log.clone();
        Box::pin(async move { self.save(&log).await })
    }

    fn get_by_transaction_id(
        &self,
        txn_id: TransactionId,
    ) -> BoxFuture<'_, Option<CallbackLog>> {
        Box::pin(self.find_by_transaction_id(txn_id))
    }

    fn get_by_status(&self, status: i16) -> BoxFuture<'_, Vec<CallbackLog>> {
        Box::pin(async move {
            let status = CallbackStatus::try_from(status)?;
            self.find_by_status(status).await
        })
    }

    fn get_by_merchant_id(
        &self,
        merchant_id: MerchantId,
        pagination: Pagination,
    ) -> BoxFuture<'_, Page<CallbackLog>> {
        Box::pin(self.find_by_merchant(merchant_id, pagination))
    }

    fn get_all(&self, pagination: Pagination) -> BoxFuture<'_, Page<CallbackLog>> {
        Box::pin(self.find_all(pagination))
    }
}

/// In-memory ledger repository for tests and database-less runs.
///
/// Applies the same uniqueness and terminal-row rules as the PostgreSQL
/// repository.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    logs: Arc<RwLock<HashMap<CallbackLogId, CallbackLog>>>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.logs.read().await.len()
    }

    /// Whether the repository holds no rows.
    pub async fn is_empty(&self) -> bool {
        self.logs.read().await.is_empty()
    }

    /// Inserts or replaces a row without any checks. Test setup only.
    pub async fn seed(&self, log: CallbackLog) {
        self.logs.write().await.insert(log.id, log);
    }

    async fn page_where<F>(&self, pagination: Pagination, filter: F) -> Page<CallbackLog>
    where
        F: Fn(&CallbackLog) -> bool,
    {
        let logs = self.logs.read().await;
        let mut matching: Vec<CallbackLog> = logs.values().filter(|l| filter(l)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let offset = usize::try_from(pagination.offset()).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(pagination.page_size as usize)
            .collect();

        Page { items, total, page: pagination.page, page_size: pagination.page_size }
    }
}

impl CallbackLogRepository for InMemoryRepository {
    fn create(&self, log: &CallbackLog) -> BoxFuture<'_, CallbackLogId> {
        let log = log.clone();
        Box::pin(async move {
            let mut logs = self.logs.write().await;
            if logs.values().any(|existing| existing.txn_id == log.txn_id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "callback log for transaction {} already exists",
                    log.txn_id
                )));
            }
            if logs.contains_key(&log.id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "callback log {} already exists",
                    log.id
                )));
            }
            let id = log.id;
            logs.insert(id, log);
            Ok(id)
        })
    }

    fn get_by_id(&self, id: CallbackLogId) -> BoxFuture<'_, Option<CallbackLog>> {
        Box::pin(async move { Ok(self.logs.read().await.get(&id).cloned()) })
    }

    fn update(&self, log: &CallbackLog) -> BoxFuture<'_, ()> {
        let log = log.clone();
        Box::pin(async move {
            let mut logs = self.logs.write().await;
            let stored = logs
                .get_mut(&log.id)
                .ok_or_else(|| CoreError::NotFound(format!("callback log {}", log.id)))?;

            if stored.status.is_terminal() {
                return Err(CoreError::InvalidTransition { from: stored.status, to: log.status });
            }

            stored.status = log.status;
            stored.response_body = log.response_body;
            stored.retry_count = log.retry_count;
            stored.updated_at = log.updated_at;
            Ok(())
        })
    }

    fn get_by_transaction_id(
        &self,
        txn_id: TransactionId,
    ) -> BoxFuture<'_, Option<CallbackLog>> {
        Box::pin(async move {
            Ok(self.logs.read().await.values().find(|l| l.txn_id == txn_id).cloned())
        })
    }

    fn get_by_status(&self, status: i16) -> BoxFuture<'_, Vec<CallbackLog>> {
        Box::pin(async move {
            let status = CallbackStatus::try_from(status)?;
            let mut matching: Vec<CallbackLog> = self
                .logs
                .read()
                .await
                .values()
                .filter(|l| l.status == status)
                .cloned()
                .collect();
            matching.sort_by_key(|l| l.updated_at);
            Ok(matching)
        })
    }

    fn get_by_merchant_id(
        &self,
        merchant_id: MerchantId,
        pagination: Pagination,
    ) -> BoxFuture<'_, Page<CallbackLog>> {
        Box::pin(async move {
            Ok(self.page_where(pagination, |l| l.merchant_id == merchant_id).await)
        })
    }

    fn get_all(&self, pagination: Pagination) -> BoxFuture<'_, Page<CallbackLog>> {
        Box::pin(async move { Ok(self.page_where(pagination, |_| true).await) })
    }
}
