//! Message broker contract and in-process implementation.
//!
//! The producer publishes keyed records through a [`Broker`]; the dispatch
//! consumer reads them back through a [`Subscription`]. Records with the same
//! key land on the same partition, so per-key order on the wire matches
//! publish order.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use crate::error::BrokerError;

#[cfg(feature = "kafka")]
pub mod kafka;

/// Well-known topic names.
pub mod topics {
    /// Payment-status webhooks awaiting delivery to merchants.
    pub const WEBHOOK_DISPATCH: &str = "webhook_dispatch";
    /// Raw payment status changes from processors.
    pub const PAYMENT_STATUS: &str = "payment_status";
    /// Outbound webhook send requests.
    pub const WEBHOOK_SEND: &str = "webhook_send";
}

type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// One keyed record on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    /// Topic the record was published to.
    pub topic: String,
    /// Partition key.
    pub key: String,
    /// Record value.
    pub value: Bytes,
}

/// Publish/subscribe operations the pipeline needs from a broker.
pub trait Broker: Send + Sync + 'static {
    /// Writes one keyed record. Completes once the broker acknowledges it.
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str, value: Bytes) -> BrokerFuture<'a, ()>;

    /// Joins `group_id` on `topic` and returns a record stream.
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
    ) -> BrokerFuture<'a, Box<dyn Subscription>>;
}

/// Stream of records from a subscribed topic.
pub trait Subscription: Send {
    /// Waits for the next record; `None` once the broker is closed.
    fn next_record(&mut self) -> BrokerFuture<'_, Option<BrokerRecord>>;
}

#[derive(Debug, Default)]
struct InMemoryState {
    log: HashMap<String, Vec<BrokerRecord>>,
    groups: HashMap<String, HashMap<String, mpsc::UnboundedSender<BrokerRecord>>>,
    fail_publishes: bool,
    closed: bool,
}

/// In-process broker that retains every record per topic.
///
/// Each consumer group on a topic receives every record once, starting from
/// the earliest retained record; subscribing the same group again replaces the
/// previous member. Used by tests and by the binary when no broker addresses
/// are configured.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records published to `topic`, in publish order.
    pub async fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        self.state.read().await.log.get(topic).cloned().unwrap_or_default()
    }

    /// Values published to `topic` under `key`, in publish order.
    pub async fn values_for_key(&self, topic: &str, key: &str) -> Vec<Bytes> {
        self.state
            .read()
            .await
            .log
            .get(topic)
            .map(|records| {
                records.iter().filter(|r| r.key == key).map(|r| r.value.clone()).collect()
            })
            .unwrap_or_default()
    }

    /// Makes every subsequent publish fail until reset.
    pub async fn set_fail_publishes(&self, fail: bool) {
        self.state.write().await.fail_publishes = fail;
    }

    /// Rejects further publishes and ends all subscriptions.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        state.closed = true;
        state.groups.clear();
    }
}

impl Broker for InMemoryBroker {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str, value: Bytes) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.fail_publishes {
                return Err(BrokerError::publish(topic, "injected publish failure"));
            }

            let record = BrokerRecord { topic: topic.to_string(), key: key.to_string(), value };

            if let Some(groups) = state.groups.get_mut(topic) {
                groups.retain(|_, sender| sender.send(record.clone()).is_ok());
            }
            state.log.entry(topic.to_string()).or_default().push(record);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
    ) -> BrokerFuture<'a, Box<dyn Subscription>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(BrokerError::subscribe(topic, "broker closed"));
            }

            let (sender, receiver) = mpsc::unbounded_channel();
            for record in state.log.get(topic).into_iter().flatten() {
                let _ = sender.send(record.clone());
            }
            state.groups.entry(topic.to_string()).or_default().insert(group_id.to_string(), sender);

            Ok(Box::new(InMemorySubscription { receiver }) as Box<dyn Subscription>)
        })
    }
}

struct InMemorySubscription {
    receiver: mpsc::UnboundedReceiver<BrokerRecord>,
}

impl Subscription for InMemorySubscription {
    fn next_record(&mut self) -> BrokerFuture<'_, Option<BrokerRecord>> {
        Box::pin(async move { Ok(self.receiver.recv().await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_retained_in_publish_order() {
        let broker = InMemoryBroker::new();

        for i in 0..3 {
            broker
                .publish(topics::WEBHOOK_DISPATCH, "merchant-a", Bytes::from(format!("m{i}")))
                .await
                .unwrap();
        }
        broker.publish(topics::WEBHOOK_DISPATCH, "merchant-b", Bytes::from("x")).await.unwrap();

        let values = broker.values_for_key(topics::WEBHOOK_DISPATCH, "merchant-a").await;
        assert_eq!(values, vec![Bytes::from("m0"), Bytes::from("m1"), Bytes::from("m2")]);
        assert_eq!(broker.records(topics::WEBHOOK_DISPATCH).await.len(), 4);
        assert!(broker.records(topics::PAYMENT_STATUS).await.is_empty());
    }

    #[tokio::test]
    async fn each_group_receives_every_record() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe(topics::WEBHOOK_DISPATCH, "group-a").await.unwrap();
        let mut b = broker.subscribe(topics::WEBHOOK_DISPATCH, "group-b").await.unwrap();

        broker.publish(topics::WEBHOOK_DISPATCH, "k", Bytes::from("v")).await.unwrap();

        assert_eq!(a.next_record().await.unwrap().unwrap().value, Bytes::from("v"));
        assert_eq!(b.next_record().await.unwrap().unwrap().key, "k");
    }

    #[tokio::test]
    async fn injected_failure_and_close() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe(topics::WEBHOOK_SEND, "g").await.unwrap();

        broker.set_fail_publishes(true).await;
        assert!(matches!(
            broker.publish(topics::WEBHOOK_SEND, "k", Bytes::new()).await,
            Err(BrokerError::Publish { .. })
        ));

        broker.close().await;
        assert!(matches!(
            broker.publish(topics::WEBHOOK_SEND, "k", Bytes::new()).await,
            Err(BrokerError::Closed)
        ));
        assert!(sub.next_record().await.unwrap().is_none());
    }
}
