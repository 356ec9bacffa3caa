//! Integration tests for the webhook delivery use case.
//!
//! Merchant endpoints are `wiremock` servers; retry waits run on a
//! `TestClock` so multi-second schedules finish immediately.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use courier_core::{
    models::{
        CallbackLog, CallbackLogId, CallbackStatus, MerchantId, Page, Pagination, TransactionId,
        UserId,
    },
    CallbackLogRepository, Clock, InMemoryRepository, RealClock, TestClock, WebhookPayload,
};
use courier_dispatch::{DispatchError, RetryPolicy, RetrySweeper, WebhookService};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct Harness {
    clock: Arc<TestClock>,
    repository: Arc<InMemoryRepository>,
    service: WebhookService,
}

impl Harness {
    fn new() -> Self {
        Self::with_policy(RetryPolicy {
            max_retries: 3,
            retry_intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(8),
            ],
            request_timeout: Duration::from_secs(5),
        })
    }

    fn with_policy(policy: RetryPolicy) -> Self {
        let clock = Arc::new(TestClock::new());
        let repository = Arc::new(InMemoryRepository::new());
        let service =
            WebhookService::new(repository.clone(), policy, clock.clone()).expect("client builds");
        Self { clock, repository, service }
    }
}

fn payload(callback_url: String) -> WebhookPayload {
    WebhookPayload {
        event_type: "payment.status_changed".to_string(),
        transaction_id: Uuid::new_v4().to_string(),
        status: "SUCCESS".to_string(),
        message: "payment settled".to_string(),
        provider_tx_id: Some("MP-991".to_string()),
        provider_data: Some(serde_json::json!({"channel": "wallet"})),
        timestamp: Utc::now(),
        callback_url,
        merchant_id: Uuid::new_v4().to_string(),
        user_id: Uuid::new_v4().to_string(),
        is_hosted_checkout: false,
    }
}

type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = courier_core::Result<T>> + Send + 'a>>;

/// In-memory ledger that can hold the next `get_by_id` until released.
struct GatedRepository {
    inner: InMemoryRepository,
    armed: AtomicBool,
    reached: Notify,
    gate: Notify,
}

impl GatedRepository {
    fn new() -> Self {
        Self {
            inner: InMemoryRepository::new(),
            armed: AtomicBool::new(false),
            reached: Notify::new(),
            gate: Notify::new(),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.gate.notify_one();
    }
}

impl CallbackLogRepository for GatedRepository {
    fn create(&self, log: &CallbackLog) -> RepoFuture<'_, CallbackLogId> {
        self.inner.create(log)
    }

    fn get_by_id(&self, id: CallbackLogId) -> RepoFuture<'_, Option<CallbackLog>> {
        Box::pin(async move {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.gate.notified().await;
            }
            self.inner.get_by_id(id).await
        })
    }

    fn update(&self, log: &CallbackLog) -> RepoFuture<'_, ()> {
        self.inner.update(log)
    }

    fn get_by_transaction_id(
        &self,
        txn_id: TransactionId,
    ) -> RepoFuture<'_, Option<CallbackLog>> {
        self.inner.get_by_transaction_id(txn_id)
    }

    fn get_by_status(&self, status: i16) -> RepoFuture<'_, Vec<CallbackLog>> {
        self.inner.get_by_status(status)
    }

    fn get_by_merchant_id(
        &self,
        merchant_id: MerchantId,
        pagination: Pagination,
    ) -> RepoFuture<'_, Page<CallbackLog>> {
        self.inner.get_by_merchant_id(merchant_id, pagination)
    }

    fn get_all(&self, pagination: Pagination) -> RepoFuture<'_, Page<CallbackLog>> {
        self.inner.get_all(pagination)
    }
}

async fn merchant_responding(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/callback"))
        .respond_with(ResponseTemplate::new(status).set_body_string(format!("status {status}")))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn persistent_server_errors_expire_after_max_retries() -> anyhow::Result<()> {
    let harness = Harness::new();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(4)
        .mount(&server)
        .await;

    let body = payload(format!("{}/callback", server.uri()));
    let first = harness.service.handle_webhook_dispatch(&body).await?;
    assert_eq!(first.status, CallbackStatus::Failed);
    assert_eq!(first.retry_count, 1);
    assert!(harness.service.is_retry_scheduled(first.id));

    harness.service.wait_for_pending_retries().await;

    let log = harness
        .service
        .get_callback_log_by_transaction_id(first.txn_id)
        .await?
        .expect("ledger row exists");
    assert_eq!(log.status, CallbackStatus::Expired);
    assert_eq!(log.retry_count, 3);
    assert_eq!(log.response_body.as_deref(), Some("boom"));

    // One first attempt plus three retries, separated by waits of 1s, 5s and 8s.
    assert_eq!(harness.clock.elapsed(), Duration::from_secs(14));
    assert_eq!(harness.clock.elapsed(), harness.service.policy().total_backoff());
    assert_eq!(harness.service.pending_retries(), 0);

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn accepted_callback_succeeds_first_time() -> anyhow::Result<()> {
    let harness = Harness::new();
    let server = merchant_responding(200).await;

    let body = payload(format!("{}/callback", server.uri()));
    let log = harness.service.handle_webhook_dispatch(&body).await?;

    assert_eq!(log.status, CallbackStatus::Success);
    assert_eq!(log.retry_count, 0);
    assert_eq!(log.response_body.as_deref(), Some("status 200"));
    assert_eq!(harness.service.pending_retries(), 0);

    let stored = harness.service.get_callback_log_by_id(log.id).await?;
    assert_eq!(stored, log);

    let sent: serde_json::Value = serde_json::from_str(&stored.request_body)?;
    assert_eq!(sent["transactionId"], body.transaction_id);
    assert_eq!(sent["status"], "SUCCESS");
    Ok(())
}

#[tokio::test]
async fn unknown_status_rejected_before_ledger_row() -> anyhow::Result<()> {
    let harness = Harness::new();
    let server = merchant_responding(200).await;

    let mut body = payload(format!("{}/callback", server.uri()));
    body.status = "bogus".to_string();

    let err = harness.service.handle_webhook_dispatch(&body).await.unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));

    let txn_id: TransactionId = body.transaction_id.parse()?;
    assert!(harness.service.get_callback_log_by_transaction_id(txn_id).await?.is_none());
    assert!(harness.repository.is_empty().await);

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
    Ok(())
}

#[tokio::test]
async fn terminal_rows_ignore_redelivered_events() -> anyhow::Result<()> {
    let harness = Harness::new();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let body = payload(format!("{}/callback", server.uri()));
    let first = harness.service.handle_webhook_dispatch(&body).await?;
    let second = harness.service.handle_webhook_dispatch(&body).await?;

    assert_eq!(first.id, second.id);
    assert_eq!(second.status, CallbackStatus::Success);
    assert_eq!(harness.repository.len().await, 1);

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn recovery_after_transient_failure() -> anyhow::Result<()> {
    let harness = Harness::new();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let body = payload(format!("{}/callback", server.uri()));
    let first = harness.service.handle_webhook_dispatch(&body).await?;
    assert_eq!(first.status, CallbackStatus::Failed);

    harness.service.wait_for_pending_retries().await;

    let log = harness.service.get_callback_log_by_id(first.id).await?;
    assert_eq!(log.status, CallbackStatus::Success);
    assert_eq!(log.retry_count, 1);
    assert_eq!(harness.clock.elapsed(), Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn unreachable_merchant_counts_as_failed_attempt() -> anyhow::Result<()> {
    let harness = Harness::with_policy(RetryPolicy {
        max_retries: 1,
        ..RetryPolicy::default()
    });

    let body = payload("http://127.0.0.1:1/callback".to_string());
    let first = harness.service.handle_webhook_dispatch(&body).await?;
    assert_eq!(first.status, CallbackStatus::Failed);
    assert_eq!(first.retry_count, 1);

    harness.service.wait_for_pending_retries().await;

    let log = harness.service.get_callback_log_by_id(first.id).await?;
    assert_eq!(log.status, CallbackStatus::Expired);
    assert_eq!(log.retry_count, 1);
    assert_eq!(harness.clock.elapsed(), Duration::from_secs(1));
    assert_eq!(harness.service.pending_retries(), 0);
    Ok(())
}

#[tokio::test]
async fn due_retry_is_not_attempted_twice() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let repository = Arc::new(GatedRepository::new());
    let clock = Arc::new(RealClock::new());
    let service = WebhookService::new(
        repository.clone(),
        RetryPolicy {
            retry_intervals: vec![Duration::from_millis(200)],
            request_timeout: Duration::from_secs(5),
            ..RetryPolicy::default()
        },
        clock.clone(),
    )?;

    let body = payload(format!("{}/callback", server.uri()));
    let first = service.handle_webhook_dispatch(&body).await?;
    assert_eq!(first.status, CallbackStatus::Failed);

    // Hold the retry task after its delay, before the row moves to Initiated.
    repository.arm();
    tokio::time::timeout(Duration::from_secs(5), repository.reached.notified()).await?;
    assert!(service.is_claimed(first.id));
    assert!(!service.is_retry_scheduled(first.id));

    let redelivered = service.handle_webhook_dispatch(&body).await?;
    assert_eq!(redelivered.status, CallbackStatus::Failed);

    let sweeper =
        RetrySweeper::new(service.clone(), clock, Duration::from_secs(30), CancellationToken::new());
    let report = sweeper.sweep_once().await?;
    assert_eq!(report.retried, 0);
    assert_eq!(report.skipped, 1);

    repository.release();
    service.wait_for_pending_retries().await;

    let log = service.get_callback_log_by_id(first.id).await?;
    assert_eq!(log.status, CallbackStatus::Success);
    assert_eq!(log.retry_count, 1);
    assert!(!service.is_claimed(first.id));

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 2);
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_scheduled_retries() -> anyhow::Result<()> {
    let harness = Harness::new();
    let server = merchant_responding(500).await;

    // Real waits so the retry is still pending when shutdown starts.
    let service = WebhookService::new(
        harness.repository.clone(),
        RetryPolicy { retry_intervals: vec![Duration::from_secs(60)], ..RetryPolicy::default() },
        Arc::new(RealClock::new()),
    )?;

    let body = payload(format!("{}/callback", server.uri()));
    let log = service.handle_webhook_dispatch(&body).await?;
    assert_eq!(service.pending_retries(), 1);

    service.shutdown(Duration::from_secs(1)).await;
    assert_eq!(service.pending_retries(), 0);
    assert!(!service.is_retry_scheduled(log.id));

    let stored = service.get_callback_log_by_id(log.id).await?;
    assert_eq!(stored.status, CallbackStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    Ok(())
}

#[tokio::test]
async fn read_operations_paginate_and_filter() -> anyhow::Result<()> {
    let harness = Harness::new();
    let server = merchant_responding(200).await;

    let merchant = Uuid::new_v4().to_string();
    for _ in 0..3 {
        let mut body = payload(format!("{}/callback", server.uri()));
        body.merchant_id = merchant.clone();
        harness.service.handle_webhook_dispatch(&body).await?;
        harness.clock.advance(Duration::from_secs(1));
    }
    harness
        .service
        .handle_webhook_dispatch(&payload(format!("{}/callback", server.uri())))
        .await?;

    let merchant_id: MerchantId = merchant.parse()?;
    let page = harness
        .service
        .get_callback_logs_by_merchant_id(merchant_id, Pagination::new(1, 2)?)
        .await?;
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total_pages(), 2);

    let all = harness.service.get_all_callback_logs(Pagination::default()).await?;
    assert_eq!(all.total, 4);

    let successes =
        harness.service.get_callback_logs_by_status(CallbackStatus::Success.code()).await?;
    assert_eq!(successes.len(), 4);

    assert!(matches!(
        harness.service.get_callback_logs_by_status(42).await,
        Err(DispatchError::Validation(_))
    ));
    assert!(matches!(
        harness.service.get_callback_log_by_id(CallbackLogId::new()).await,
        Err(DispatchError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn sweeper_redrives_orphaned_rows() -> anyhow::Result<()> {
    let harness = Harness::new();
    let server = merchant_responding(200).await;
    let url = format!("{}/callback", server.uri());
    let created = harness.clock.now_utc();

    // A Failed row whose in-process retry was lost, e.g. across a restart.
    let mut failed = CallbackLog::new(
        UserId::new(),
        TransactionId::new(),
        MerchantId::new(),
        url.clone(),
        "{}",
        created,
    );
    failed.transition_to(CallbackStatus::Initiated, created)?;
    failed.record_failure(Some("bad gateway".into()), 3, created)?;
    harness.repository.seed(failed.clone()).await;

    // An attempt that never finished.
    let mut stuck =
        CallbackLog::new(UserId::new(), TransactionId::new(), MerchantId::new(), url, "{}", created);
    stuck.transition_to(CallbackStatus::Initiated, created)?;
    harness.repository.seed(stuck.clone()).await;

    let sweeper = RetrySweeper::new(
        harness.service.clone(),
        harness.clock.clone(),
        Duration::from_secs(30),
        CancellationToken::new(),
    );

    let report = sweeper.sweep_once().await?;
    assert_eq!(report.retried, 0);
    assert_eq!(report.recovered, 0);
    assert_eq!(report.skipped, 2);

    harness.clock.advance(Duration::from_secs(11));
    let report = sweeper.sweep_once().await?;
    assert_eq!(report.retried, 1);
    assert_eq!(report.recovered, 1);

    let failed = harness.repository.get_by_id(failed.id).await?.expect("row exists");
    assert_eq!(failed.status, CallbackStatus::Success);
    assert_eq!(failed.retry_count, 1);

    harness.service.wait_for_pending_retries().await;
    let stuck = harness.repository.get_by_id(stuck.id).await?.expect("row exists");
    assert_eq!(stuck.status, CallbackStatus::Success);
    assert_eq!(stuck.retry_count, 1);
    Ok(())
}
