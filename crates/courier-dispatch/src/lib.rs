//! Partitioned event production and webhook delivery.
//!
//! # Architecture
//!
//! Events flow through two halves joined by a broker topic:
//!
//! 1. **Produce** - [`GroupedProducer`] queues each event under its partition
//!    key and a worker pool publishes them, one message per key at a time.
//! 2. **Consume** - [`DispatchConsumer`] reads the topic and hands each
//!    payload to [`WebhookService`], one lane per key so keys never wait on
//!    each other.
//! 3. **Deliver** - the service records a ledger row, posts the callback and
//!    moves the row through `Pending -> Initiated -> Success | Failed ->
//!    Expired`, scheduling retries from the [`RetryPolicy`].
//! 4. **Re-drive** - [`RetrySweeper`] picks up rows whose in-process retry was
//!    lost.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{InMemoryRepository, RealClock};
//! use courier_dispatch::{
//!     broker::InMemoryBroker, GroupedProducer, ProducerConfig, RetryPolicy, WebhookService,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let producer = GroupedProducer::new(Arc::new(InMemoryBroker::new()), ProducerConfig::default());
//! producer.start().await;
//! producer.produce("merchant-42", r#"{"status":"SUCCESS"}"#).await?;
//!
//! let service = WebhookService::new(
//!     Arc::new(InMemoryRepository::new()),
//!     RetryPolicy::default(),
//!     Arc::new(RealClock::new()),
//! )?;
//! # let _ = service;
//! producer.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod broker;
pub mod client;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod retry;
pub mod service;
pub mod sweeper;

pub use backoff::ExponentialBackoff;
pub use broker::{Broker, BrokerRecord, InMemoryBroker, Subscription};
pub use client::{ClientConfig, DeliveryClient};
pub use consumer::{ConsumerStats, DispatchConsumer};
pub use error::{BrokerError, DeliveryError, DispatchError, ProducerError, Result};
pub use producer::{GroupedProducer, ProducerConfig, ProducerStats};
pub use retry::RetryPolicy;
pub use service::WebhookService;
pub use sweeper::RetrySweeper;
