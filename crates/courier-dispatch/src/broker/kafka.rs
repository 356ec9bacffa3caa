//! Kafka broker backed by `rdkafka`.

use std::time::Duration;

use bytes::Bytes;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    producer::{FutureProducer, FutureRecord},
    ClientConfig, Message,
};
use tracing::debug;

use super::{Broker, BrokerFuture, BrokerRecord, Subscription};
use crate::error::BrokerError;

/// Kafka connection settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma separated `host:port` list.
    pub bootstrap_servers: String,
    /// How long a publish may wait for acknowledgement.
    pub delivery_timeout: Duration,
}

/// Broker that publishes with a shared `FutureProducer` and consumes with a
/// `StreamConsumer` per subscription.
pub struct KafkaBroker {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaBroker {
    /// Connects an idempotent producer.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Publish` if the producer cannot be created.
    pub fn new(config: KafkaConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .create()
            .map_err(|e| BrokerError::publish("*", format!("failed to create producer: {e}")))?;

        Ok(Self { producer, config })
    }
}

impl Broker for KafkaBroker {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str, value: Bytes) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let record = FutureRecord::to(topic).key(key).payload(value.as_ref());

            self.producer
                .send(record, self.config.delivery_timeout)
                .await
                .map_err(|(err, _)| BrokerError::publish(topic, err.to_string()))?;

            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
    ) -> BrokerFuture<'a, Box<dyn Subscription>> {
        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.config.bootstrap_servers)
                .set("group.id", group_id)
                .set("enable.auto.commit", "true")
                .set("auto.offset.reset", "earliest")
                .create()
                .map_err(|e| BrokerError::subscribe(topic, e.to_string()))?;

            consumer.subscribe(&[topic]).map_err(|e| BrokerError::subscribe(topic, e.to_string()))?;
            debug!(topic, group_id, "subscribed to kafka topic");

            Ok(Box::new(KafkaSubscription { consumer }) as Box<dyn Subscription>)
        })
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
}

impl Subscription for KafkaSubscription {
    fn next_record(&mut self) -> BrokerFuture<'_, Option<BrokerRecord>> {
        Box::pin(async move {
            let message = self
                .consumer
                .recv()
                .await
                .map_err(|e| BrokerError::subscribe("*", e.to_string()))?;

            let key = message.key().map(|k| String::from_utf8_lossy(k).into_owned()).unwrap_or_default();
            let value = message.payload().map(Bytes::copy_from_slice).unwrap_or_default();

            Ok(Some(BrokerRecord { topic: message.topic().to_string(), key, value }))
        })
    }
}
