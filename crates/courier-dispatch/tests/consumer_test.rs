//! Integration tests for the dispatch consumer's per-key lanes.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use courier_core::{
    models::{CallbackLog, CallbackStatus, TransactionId},
    CallbackLogRepository, InMemoryRepository, RealClock, WebhookPayload,
};
use courier_dispatch::{
    broker::{topics, InMemoryBroker},
    Broker, BrokerError, ConsumerStats, DispatchConsumer, RetryPolicy, WebhookService,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct Pipeline {
    broker: Arc<InMemoryBroker>,
    repository: Arc<InMemoryRepository>,
    token: CancellationToken,
    consumer: JoinHandle<Result<ConsumerStats, BrokerError>>,
}

impl Pipeline {
    fn start(broker: Arc<InMemoryBroker>) -> anyhow::Result<Self> {
        let clock = Arc::new(RealClock::new());
        let repository = Arc::new(InMemoryRepository::new());
        let service =
            WebhookService::new(repository.clone(), RetryPolicy::default(), clock.clone())?;
        let token = CancellationToken::new();

        let consumer = DispatchConsumer::new(
            broker.clone(),
            service,
            clock,
            topics::WEBHOOK_DISPATCH,
            "courier-lanes",
            token.clone(),
        );
        let consumer = tokio::spawn(async move { consumer.run().await });
        Ok(Self { broker, repository, token, consumer })
    }

    async fn row(&self, txn_id: TransactionId) -> anyhow::Result<Option<CallbackLog>> {
        Ok(self.repository.get_by_transaction_id(txn_id).await?)
    }

    async fn wait_for_success(&self, txn_id: TransactionId) -> anyhow::Result<CallbackLog> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(log) = self.row(txn_id).await? {
                if log.status == CallbackStatus::Success {
                    return Ok(log);
                }
            }
            anyhow::ensure!(tokio::time::Instant::now() < deadline, "{txn_id} never delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn payload(merchant_id: &str, callback_url: String) -> WebhookPayload {
    WebhookPayload {
        event_type: "payment.status_changed".to_string(),
        transaction_id: Uuid::new_v4().to_string(),
        status: "SUCCESS".to_string(),
        message: String::new(),
        provider_tx_id: None,
        provider_data: None,
        timestamp: Utc::now(),
        callback_url,
        merchant_id: merchant_id.to_string(),
        user_id: Uuid::new_v4().to_string(),
        is_hosted_checkout: false,
    }
}

async fn merchant_with_delay(delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(delay))
        .mount(&server)
        .await;
    server
}

async fn publish(broker: &InMemoryBroker, body: &WebhookPayload) -> anyhow::Result<TransactionId> {
    broker
        .publish(topics::WEBHOOK_DISPATCH, &body.merchant_id, serde_json::to_vec(body)?.into())
        .await?;
    Ok(body.transaction_id.parse()?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_merchant_does_not_hold_up_others() -> anyhow::Result<()> {
    let slow = merchant_with_delay(Duration::from_secs(3)).await;
    let fast = merchant_with_delay(Duration::ZERO).await;
    let broker = Arc::new(InMemoryBroker::new());

    let slow_merchant = Uuid::new_v4().to_string();
    let fast_merchant = Uuid::new_v4().to_string();
    let slow_txn =
        publish(&broker, &payload(&slow_merchant, format!("{}/callback", slow.uri()))).await?;
    let fast_txn =
        publish(&broker, &payload(&fast_merchant, format!("{}/callback", fast.uri()))).await?;

    let started = tokio::time::Instant::now();
    let pipeline = Pipeline::start(broker)?;

    pipeline.wait_for_success(fast_txn).await?;
    assert!(started.elapsed() < Duration::from_millis(1500));

    let slow_status = pipeline.row(slow_txn).await?.map(|log| log.status);
    assert_ne!(slow_status, Some(CallbackStatus::Success));

    pipeline.wait_for_success(slow_txn).await?;

    pipeline.token.cancel();
    let stats = pipeline.consumer.await??;
    assert_eq!(stats.handled, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_merchant_events_are_handled_in_order() -> anyhow::Result<()> {
    let server = merchant_with_delay(Duration::from_millis(200)).await;
    let broker = Arc::new(InMemoryBroker::new());
    let merchant = Uuid::new_v4().to_string();

    let mut txns = Vec::new();
    for _ in 0..3 {
        let body = payload(&merchant, format!("{}/callback", server.uri()));
        txns.push(publish(&broker, &body).await?);
    }

    let pipeline = Pipeline::start(broker)?;
    let mut rows = Vec::new();
    for txn in &txns {
        rows.push(pipeline.wait_for_success(*txn).await?);
    }

    // Each event's row is created only after the previous one was delivered.
    for pair in rows.windows(2) {
        assert!(pair[1].created_at >= pair[0].updated_at);
    }

    pipeline.token.cancel();
    let stats = pipeline.consumer.await??;
    assert_eq!(stats.handled, 3);
    assert_eq!(pipeline.broker.records(topics::WEBHOOK_DISPATCH).await.len(), 3);
    Ok(())
}
