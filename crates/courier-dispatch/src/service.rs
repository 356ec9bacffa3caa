//! Webhook delivery use case.
//!
//! Turns a dispatch payload into a durable ledger row, performs the outbound
//! callback, and drives the row through the status state machine until it is
//! `Success` or `Expired`. Failed attempts are re-driven in-process after the
//! policy's retry interval.
//!
//! Every row is claimed in-process while an attempt is running or a retry is
//! scheduled. A claim is released only after the row's new status has been
//! persisted, so a redelivered event or a sweep never attempts a row that
//! this process is already working on.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use courier_core::{
    models::{
        CallbackLog, CallbackLogId, CallbackStatus, DispatchEvent, MerchantId, Page, Pagination,
        TransactionId, WebhookPayload,
    },
    CallbackLogRepository, Clock, CoreError,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    error::{DeliveryError, DispatchError},
    retry::{RetryDecision, RetryPolicy},
};

/// Result type for the delivery use case.
pub type Result<T> = std::result::Result<T, DispatchError>;

struct Inner {
    repository: Arc<dyn CallbackLogRepository>,
    client: DeliveryClient,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    retries: TaskTracker,
    claims: Mutex<HashMap<CallbackLogId, Claim>>,
    cancellation_token: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// A retry task is waiting out its delay.
    Scheduled,
    /// An attempt is reading or writing the row.
    InFlight,
}

/// Releases an in-process claim on drop unless it was handed to a retry task.
struct ClaimGuard {
    service: WebhookService,
    id: CallbackLogId,
    handed_off: bool,
}

impl ClaimGuard {
    /// Marks the claim as owned by a scheduled retry.
    fn into_scheduled(mut self) {
        self.service.claims().insert(self.id, Claim::Scheduled);
        self.handed_off = true;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.handed_off {
            self.service.claims().remove(&self.id);
        }
    }
}

/// Delivers payment-status webhooks and records every attempt in the ledger.
///
/// Cheap to clone; clones share the ledger, HTTP client and retry tasks.
#[derive(Clone)]
pub struct WebhookService {
    inner: Arc<Inner>,
}

impl WebhookService {
    /// Creates a service whose HTTP client uses the policy's request timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(
        repository: Arc<dyn CallbackLogRepository>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, DeliveryError> {
        let client = DeliveryClient::new(ClientConfig {
            timeout: policy.request_timeout,
            ..ClientConfig::default()
        })?;
        Ok(Self::with_client(repository, client, policy, clock))
    }

    /// Creates a service with an explicit HTTP client.
    pub fn with_client(
        repository: Arc<dyn CallbackLogRepository>,
        client: DeliveryClient,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                client,
                policy,
                clock,
                retries: TaskTracker::new(),
                claims: Mutex::new(HashMap::new()),
                cancellation_token: CancellationToken::new(),
            }),
        }
    }

    /// Retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Decodes a broker event and delivers it.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Validation` if the payload is not a valid
    /// webhook body, otherwise as [`handle_webhook_dispatch`](Self::handle_webhook_dispatch).
    pub async fn handle_dispatch_event(&self, event: &DispatchEvent) -> Result<CallbackLog> {
        let payload: WebhookPayload = serde_json::from_slice(&event.payload)
            .map_err(|e| DispatchError::Validation(format!("undecodable payload: {e}")))?;
        self.handle_webhook_dispatch(&payload).await
    }

    /// Creates or resumes the ledger row for `payload.transactionId` and makes
    /// a delivery attempt.
    ///
    /// Delivery failures are recorded on the row, not returned. Terminal rows
    /// are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Validation` before any row is created if the
    /// payload is invalid, and `DispatchError::Ledger` if persistence fails.
    pub async fn handle_webhook_dispatch(&self, payload: &WebhookPayload) -> Result<CallbackLog> {
        let validated = payload.validate().map_err(|e| DispatchError::Validation(e.to_string()))?;

        let log = match self.inner.repository.get_by_transaction_id(validated.txn_id).await? {
            Some(existing) => existing,
            None => {
                let request_body = serde_json::to_string(payload)
                    .map_err(|e| DispatchError::Validation(format!("unserializable payload: {e}")))?;
                let log = CallbackLog::new(
                    validated.user_id,
                    validated.txn_id,
                    validated.merchant_id,
                    validated.callback_url,
                    request_body,
                    self.inner.clock.now_utc(),
                );
                self.create_or_load(log).await?
            },
        };

        match log.status {
            CallbackStatus::Success | CallbackStatus::Expired => {
                debug!(
                    callback_log_id = %log.id,
                    txn_id = %log.txn_id,
                    status = %log.status,
                    "callback already terminal; ignoring dispatch"
                );
                Ok(log)
            },
            CallbackStatus::Initiated => {
                debug!(callback_log_id = %log.id, "attempt already in flight; ignoring dispatch");
                Ok(log)
            },
            CallbackStatus::Pending | CallbackStatus::Failed => {
                let Some(claim) = self.try_claim(log.id) else {
                    debug!(
                        callback_log_id = %log.id,
                        status = %log.status,
                        "callback already claimed by this process; ignoring dispatch"
                    );
                    return Ok(log);
                };
                let id = log.id;
                self.attempt_claimed(claim, &[CallbackStatus::Pending, CallbackStatus::Failed])
                    .await?
                    .ok_or_else(|| DispatchError::NotFound(format!("callback log {id}")))
            },
        }
    }

    /// Re-attempts delivery of a `Failed` row.
    ///
    /// Rows in any other status, and unknown ids, are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Ledger` if persistence fails.
    pub async fn retry_delivery(&self, id: CallbackLogId) -> Result<Option<CallbackLog>> {
        let Some(claim) = self.try_claim(id) else {
            debug!(callback_log_id = %id, "callback already claimed; skipping retry");
            return Ok(self.inner.repository.get_by_id(id).await?);
        };
        self.attempt_claimed(claim, &[CallbackStatus::Failed]).await
    }

    /// Counts an `Initiated` row whose attempt never completed as a failed
    /// attempt and schedules the follow-up. Other rows are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Ledger` if persistence fails.
    pub async fn recover_interrupted(&self, id: CallbackLogId) -> Result<Option<CallbackLog>> {
        let Some(claim) = self.try_claim(id) else {
            debug!(callback_log_id = %id, "attempt still running in this process; not recovering");
            return Ok(self.inner.repository.get_by_id(id).await?);
        };
        let Some(mut log) = self.inner.repository.get_by_id(id).await? else {
            return Ok(None);
        };
        if log.status != CallbackStatus::Initiated {
            return Ok(Some(log));
        }

        let status = log
            .record_failure(
                Some("attempt interrupted before completion".to_string()),
                self.inner.policy.max_retries,
                self.inner.clock.now_utc(),
            )
            .map_err(DispatchError::Ledger)?;
        self.inner.repository.update(&log).await?;

        let retry_count = u32::try_from(log.retry_count).unwrap_or(u32::MAX);
        if status == CallbackStatus::Failed {
            warn!(callback_log_id = %id, retry_count, "recovered interrupted attempt; retry scheduled");
            self.schedule_retry(claim, self.inner.policy.interval_for(retry_count));
        } else {
            error!(callback_log_id = %id, retry_count, "interrupted attempt exhausted retries; callback expired");
        }

        Ok(Some(log))
    }

    /// Whether an in-process retry is pending for `id`.
    pub fn is_retry_scheduled(&self, id: CallbackLogId) -> bool {
        self.claims().get(&id) == Some(&Claim::Scheduled)
    }

    /// Whether this process is attempting `id` or has a retry pending for it.
    pub fn is_claimed(&self, id: CallbackLogId) -> bool {
        self.claims().contains_key(&id)
    }

    /// Number of retry tasks currently tracked.
    pub fn pending_retries(&self) -> usize {
        self.inner.retries.len()
    }

    /// Waits until every scheduled retry, including retries they schedule,
    /// has finished.
    pub async fn wait_for_pending_retries(&self) {
        self.inner.retries.close();
        self.inner.retries.wait().await;
        self.inner.retries.reopen();
    }

    /// Cancels pending retries and waits up to `timeout` for running
    /// attempts to finish. Rows stay `Failed` and can be re-driven later.
    pub async fn shutdown(&self, timeout: Duration) {
        info!(pending_retries = self.pending_retries(), "shutting down webhook service");
        self.inner.cancellation_token.cancel();
        self.inner.retries.close();

        if tokio::time::timeout(timeout, self.inner.retries.wait()).await.is_err() {
            warn!(timeout_seconds = timeout.as_secs(), "retry tasks still running after timeout");
        }
    }

    /// Fetches a ledger row.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotFound` if no row has this id.
    pub async fn get_callback_log_by_id(&self, id: CallbackLogId) -> Result<CallbackLog> {
        self.inner
            .repository
            .get_by_id(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("callback log {id}")))
    }

    /// Lists a merchant's ledger rows, newest first.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Ledger` if the query fails.
    pub async fn get_callback_logs_by_merchant_id(
        &self,
        merchant_id: MerchantId,
        pagination: Pagination,
    ) -> Result<Page<CallbackLog>> {
        Ok(self.inner.repository.get_by_merchant_id(merchant_id, pagination).await?)
    }

    /// Lists all ledger rows, newest first.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Ledger` if the query fails.
    pub async fn get_all_callback_logs(&self, pagination: Pagination) -> Result<Page<CallbackLog>> {
        Ok(self.inner.repository.get_all(pagination).await?)
    }

    /// Lists ledger rows with the given raw status code.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Validation` for an out-of-range code.
    pub async fn get_callback_logs_by_status(&self, status: i16) -> Result<Vec<CallbackLog>> {
        Ok(self.inner.repository.get_by_status(status).await?)
    }

    /// Fetches the ledger row for a transaction, if any.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Ledger` if the query fails.
    pub async fn get_callback_log_by_transaction_id(
        &self,
        txn_id: TransactionId,
    ) -> Result<Option<CallbackLog>> {
        Ok(self.inner.repository.get_by_transaction_id(txn_id).await?)
    }

    async fn create_or_load(&self, log: CallbackLog) -> Result<CallbackLog> {
        match self.inner.repository.create(&log).await {
            Ok(_) => {
                debug!(callback_log_id = %log.id, txn_id = %log.txn_id, "callback log created");
                Ok(log)
            },
            // Lost a race with a concurrent dispatch for the same transaction.
            Err(CoreError::ConstraintViolation(_)) => self
                .inner
                .repository
                .get_by_transaction_id(log.txn_id)
                .await?
                .ok_or_else(|| DispatchError::NotFound(format!("transaction {}", log.txn_id))),
            Err(e) => Err(e.into()),
        }
    }

    fn try_claim(&self, id: CallbackLogId) -> Option<ClaimGuard> {
        let mut claims = self.claims();
        if claims.contains_key(&id) {
            return None;
        }
        claims.insert(id, Claim::InFlight);
        Some(ClaimGuard { service: self.clone(), id, handed_off: false })
    }

    /// Converts a scheduled claim into an in-flight one when its delay ends.
    fn take_scheduled(&self, id: CallbackLogId) -> ClaimGuard {
        self.claims().insert(id, Claim::InFlight);
        ClaimGuard { service: self.clone(), id, handed_off: false }
    }

    /// Re-reads the claimed row and attempts it if its status is in `allowed`.
    async fn attempt_claimed(
        &self,
        claim: ClaimGuard,
        allowed: &[CallbackStatus],
    ) -> Result<Option<CallbackLog>> {
        let Some(log) = self.inner.repository.get_by_id(claim.id).await? else {
            warn!(callback_log_id = %claim.id, "attempt for unknown callback log; skipping");
            return Ok(None);
        };

        if !allowed.contains(&log.status) {
            debug!(callback_log_id = %log.id, status = %log.status, "callback status changed; skipping attempt");
            return Ok(Some(log));
        }

        self.attempt(log, claim).await.map(Some)
    }

    async fn attempt(&self, mut log: CallbackLog, claim: ClaimGuard) -> Result<CallbackLog> {
        log.transition_to(CallbackStatus::Initiated, self.inner.clock.now_utc())
            .map_err(DispatchError::Ledger)?;
        self.inner.repository.update(&log).await?;

        let attempt_number = u32::try_from(log.retry_count).unwrap_or(0) + 1;
        let request = DeliveryRequest {
            callback_log_id: log.id,
            txn_id: log.txn_id,
            url: log.callback_url.clone(),
            body: Bytes::from(log.request_body.clone()),
            attempt_number,
        };

        let failure = match self.inner.client.deliver(request).await {
            Ok(response) if response.is_success() => {
                log.record_success(response.body, self.inner.clock.now_utc())
                    .map_err(DispatchError::Ledger)?;
                self.inner.repository.update(&log).await?;
                info!(
                    callback_log_id = %log.id,
                    txn_id = %log.txn_id,
                    attempt = attempt_number,
                    status_code = response.status_code,
                    "callback delivered"
                );
                return Ok(log);
            },
            Ok(response) => DeliveryError::from_status(response.status_code, response.body),
            Err(e) => e,
        };

        let retries_used = u32::try_from(log.retry_count).unwrap_or(u32::MAX);
        let status = log
            .record_failure(
                failure.response_body().map(str::to_string),
                self.inner.policy.max_retries,
                self.inner.clock.now_utc(),
            )
            .map_err(DispatchError::Ledger)?;
        self.inner.repository.update(&log).await?;

        let retry_count = u32::try_from(log.retry_count).unwrap_or(u32::MAX);
        match (status, self.inner.policy.decide(retries_used)) {
            (CallbackStatus::Failed, RetryDecision::Retry { delay }) => {
                warn!(
                    callback_log_id = %log.id,
                    txn_id = %log.txn_id,
                    attempt = attempt_number,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "callback attempt failed; retry scheduled"
                );
                self.schedule_retry(claim, delay);
            },
            (_, decision) => {
                let reason = match decision {
                    RetryDecision::GiveUp { reason } => reason,
                    RetryDecision::Retry { .. } => "retry budget exhausted".to_string(),
                };
                error!(
                    callback_log_id = %log.id,
                    txn_id = %log.txn_id,
                    attempt = attempt_number,
                    retry_count,
                    error = %failure,
                    reason = %reason,
                    "callback expired"
                );
            },
        }

        Ok(log)
    }

    fn schedule_retry(&self, claim: ClaimGuard, delay: Duration) {
        let id = claim.id;
        if self.inner.cancellation_token.is_cancelled() {
            debug!(callback_log_id = %id, "shutting down; not scheduling retry");
            return;
        }

        claim.into_scheduled();
        let service = self.clone();

        self.inner.retries.spawn(async move {
            let token = service.inner.cancellation_token.clone();
            tokio::select! {
                () = token.cancelled() => {
                    debug!(callback_log_id = %id, "retry cancelled");
                    service.claims().remove(&id);
                },
                () = service.inner.clock.sleep(delay) => {
                    let claim = service.take_scheduled(id);
                    if let Err(e) = service.attempt_claimed(claim, &[CallbackStatus::Failed]).await {
                        error!(callback_log_id = %id, error = %e, "retry attempt failed");
                    }
                },
            }
        });
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, HashMap<CallbackLogId, Claim>> {
        self.inner.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
