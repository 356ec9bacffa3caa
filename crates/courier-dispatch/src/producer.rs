//! Grouped event producer with per-key ordering.
//!
//! Callers hand `(key, payload)` pairs to [`GroupedProducer::produce`], which
//! only ever touches an in-memory queue. Every partition key gets its own
//! bounded FIFO queue, created on first use and kept for the life of the
//! producer. A fixed pool of workers repeatedly scans the queues and publishes
//! at most one message per key per scan to the broker, using the key as the
//! partition key.
//!
//! # Ordering
//!
//! Each queue's receiver sits behind a lock that a worker holds from dequeue
//! until the broker acknowledges the publish. Other workers skip a key whose
//! lock is taken, so messages for one key are published strictly in enqueue
//! order no matter how many workers run. Nothing is promised across keys.
//!
//! # Backpressure
//!
//! A full queue is retried with [`ExponentialBackoff`]; once the attempts run
//! out the message is dropped and logged. `produce` never waits on broker I/O.
//!
//! # Shutdown
//!
//! [`GroupedProducer::stop`] rejects new messages and lets the workers drain
//! every queue, then publishes whatever is left key by key. Only messages
//! still queued when `shutdown_timeout` runs out are counted as dropped.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use courier_core::{models::DispatchEvent, Clock, RealClock};
use serde::Serialize;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex, RwLock,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{backoff::ExponentialBackoff, broker::Broker, error::ProducerError};

/// Default per-key queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default number of publishing workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Topic every message is published to.
    pub topic: String,
    /// Number of publishing workers.
    pub worker_count: usize,
    /// Capacity of each per-key queue.
    pub queue_capacity: usize,
    /// Pause after a scan that found nothing to publish.
    pub poll_interval: Duration,
    /// Retry schedule for enqueueing into a full queue.
    pub backoff: ExponentialBackoff,
    /// Upper bound on draining queued messages during `stop`.
    pub shutdown_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: crate::broker::topics::WEBHOOK_DISPATCH.to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: Duration::from_millis(100),
            backoff: ExponentialBackoff::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Producer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Messages accepted into a queue.
    pub enqueued: u64,
    /// Messages acknowledged by the broker.
    pub published: u64,
    /// Publishes the broker rejected. These are not retried.
    pub publish_failures: u64,
    /// Messages discarded after backpressure retries ran out or at shutdown.
    pub dropped: u64,
    /// Backoff waits taken because a queue was full.
    pub backpressure_retries: u64,
    /// Keys with a queue.
    pub active_keys: usize,
    /// Running workers.
    pub active_workers: usize,
}

struct KeyQueue {
    sender: mpsc::Sender<DispatchEvent>,
    receiver: Mutex<mpsc::Receiver<DispatchEvent>>,
}

impl KeyQueue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self { sender, receiver: Mutex::new(receiver) }
    }
}

struct Shared {
    broker: Arc<dyn Broker>,
    config: ProducerConfig,
    clock: Arc<dyn Clock>,
    queues: RwLock<HashMap<String, Arc<KeyQueue>>>,
    stats: RwLock<ProducerStats>,
    shutting_down: AtomicBool,
}

impl Shared {
    /// Publishes one message and counts the outcome. Returns whether the
    /// broker acknowledged it.
    async fn publish(&self, event: DispatchEvent) -> bool {
        let topic = &self.config.topic;
        match self.broker.publish(topic, &event.partition_key, event.payload).await {
            Ok(()) => {
                self.stats.write().await.published += 1;
                true
            },
            Err(e) => {
                self.stats.write().await.publish_failures += 1;
                error!(key = %event.partition_key, error = %e, "failed to publish message");
                false
            },
        }
    }
}

/// Partitioned producer that preserves per-key order over a worker pool.
pub struct GroupedProducer {
    shared: Arc<Shared>,
    cancellation_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl GroupedProducer {
    /// Creates a stopped producer using the system clock.
    pub fn new(broker: Arc<dyn Broker>, config: ProducerConfig) -> Self {
        Self::with_clock(broker, config, Arc::new(RealClock::new()))
    }

    /// Creates a stopped producer with an explicit clock.
    pub fn with_clock(
        broker: Arc<dyn Broker>,
        config: ProducerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                config,
                clock,
                queues: RwLock::new(HashMap::new()),
                stats: RwLock::new(ProducerStats::default()),
                shutting_down: AtomicBool::new(false),
            }),
            cancellation_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker pool. Calling it again while running is a no-op.
    pub async fn start(&self) {
        let mut handles = self.worker_handles.lock().await;
        if !handles.is_empty() || self.is_shutting_down() {
            warn!("producer already started or stopping; ignoring start");
            return;
        }

        let worker_count = self.shared.config.worker_count.max(1);
        info!(worker_count, topic = %self.shared.config.topic, "starting grouped producer");

        for worker_id in 0..worker_count {
            let worker = ProducerWorker {
                id: worker_id,
                shared: self.shared.clone(),
                cancellation_token: self.cancellation_token.clone(),
            };
            handles.push(tokio::spawn(async move {
                debug!(worker_id, "producer worker starting");
                worker.run().await;
                debug!(worker_id, "producer worker stopped");
            }));
        }

        self.shared.stats.write().await.active_workers = worker_count;
    }

    /// Queues `payload` for publication under `key`.
    ///
    /// Returns once the message is queued or dropped; a drop is logged and
    /// counted but is not an error.
    ///
    /// # Errors
    ///
    /// Returns `ProducerError::ShuttingDown` once `stop` has begun.
    pub async fn produce(&self, key: &str, payload: impl Into<Bytes>) -> Result<(), ProducerError> {
        if self.is_shutting_down() {
            return Err(ProducerError::ShuttingDown);
        }

        let queue = self.queue_for(key).await;
        let mut event = DispatchEvent::new(key, payload, self.shared.clock.now_utc());
        let mut backoff = self.shared.config.backoff.start();

        loop {
            match queue.sender.try_send(event) {
                Ok(()) => {
                    self.shared.stats.write().await.enqueued += 1;
                    debug!(key, "message enqueued");
                    return Ok(());
                },
                Err(TrySendError::Closed(_)) => return Err(ProducerError::ShuttingDown),
                Err(TrySendError::Full(returned)) => {
                    let Some(delay) = backoff.next_delay() else {
                        self.shared.stats.write().await.dropped += 1;
                        error!(
                            key,
                            attempts = backoff.attempts(),
                            "queue full after backoff; dropping message"
                        );
                        return Ok(());
                    };

                    self.shared.stats.write().await.backpressure_retries += 1;
                    warn!(
                        key,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "queue full; backing off"
                    );
                    self.shared.clock.sleep(delay).await;

                    if self.is_shutting_down() {
                        return Err(ProducerError::ShuttingDown);
                    }
                    event = returned;
                },
            }
        }
    }

    /// Serializes `value` as JSON and queues it under `key`.
    ///
    /// A value that fails to serialize is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `ProducerError::ShuttingDown` once `stop` has begun.
    pub async fn produce_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), ProducerError> {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.produce(key, bytes).await,
            Err(e) => {
                error!(key, error = %e, "failed to serialize message value; skipping");
                Ok(())
            },
        }
    }

    /// Stops accepting messages and drains every queue.
    ///
    /// Further `produce` calls fail with `ShuttingDown`. Workers keep
    /// publishing until the queues are empty; anything they leave behind is
    /// published here in per-key order. Messages still queued when
    /// `shutdown_timeout` runs out are discarded and counted as dropped.
    pub async fn stop(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let shutdown_timeout = self.shared.config.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + shutdown_timeout;
        info!(
            timeout_ms = shutdown_timeout.as_millis() as u64,
            "stopping grouped producer; draining queues"
        );

        let handles = std::mem::take(&mut *self.worker_handles.lock().await);
        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let join_all = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "producer worker panicked");
                }
            }
        };

        let workers_drained = tokio::time::timeout_at(deadline, join_all).await.is_ok();
        if !workers_drained {
            error!(
                timeout_ms = shutdown_timeout.as_millis() as u64,
                "producer workers did not drain in time; aborting"
            );
            for handle in abort_handles {
                handle.abort();
            }
        }
        self.cancellation_token.cancel();

        let queues: Vec<(String, Arc<KeyQueue>)> = self
            .shared
            .queues
            .read()
            .await
            .iter()
            .map(|(k, q)| (k.clone(), q.clone()))
            .collect();

        let mut flushed = 0u64;
        let mut discarded = 0u64;
        for (key, queue) in queues {
            let mut receiver = queue.receiver.lock().await;
            receiver.close();
            let mut pending = 0u64;
            while let Ok(event) = receiver.try_recv() {
                if workers_drained && tokio::time::Instant::now() < deadline {
                    let publish = self.shared.publish(event);
                    if tokio::time::timeout_at(deadline, publish).await.is_ok() {
                        flushed += 1;
                        continue;
                    }
                }
                pending += 1;
            }
            if pending > 0 {
                warn!(key = %key, pending, "discarding unpublished messages at shutdown");
            }
            discarded += pending;
        }

        let mut stats = self.shared.stats.write().await;
        stats.dropped += discarded;
        stats.active_workers = 0;
        drop(stats);

        info!(flushed, discarded, "grouped producer stopped");
    }

    /// Whether `stop` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Snapshot of the producer counters.
    pub async fn stats(&self) -> ProducerStats {
        self.shared.stats.read().await.clone()
    }

    async fn queue_for(&self, key: &str) -> Arc<KeyQueue> {
        if let Some(queue) = self.shared.queues.read().await.get(key) {
            return queue.clone();
        }

        let mut queues = self.shared.queues.write().await;
        let queue = queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyQueue::new(self.shared.config.queue_capacity)))
            .clone();
        let active_keys = queues.len();
        drop(queues);

        self.shared.stats.write().await.active_keys = active_keys;
        queue
    }
}

struct ProducerWorker {
    id: usize,
    shared: Arc<Shared>,
    cancellation_token: CancellationToken,
}

impl ProducerWorker {
    async fn run(self) {
        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let taken = self.scan_once().await;

            if taken == 0 {
                // Queues are empty; during shutdown that means drained.
                if self.shared.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    () = self.cancellation_token.cancelled() => break,
                    () = self.shared.clock.sleep(self.shared.config.poll_interval) => {},
                }
            }
        }
    }

    /// Publishes at most one message per key. Returns how many were taken.
    async fn scan_once(&self) -> usize {
        let queues: Vec<Arc<KeyQueue>> =
            self.shared.queues.read().await.values().cloned().collect();

        let mut taken = 0;
        for queue in queues {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            // Held until the publish completes so no other worker can
            // overtake this message with a later one for the same key.
            let Ok(mut receiver) = queue.receiver.try_lock() else {
                continue;
            };
            let Ok(event) = receiver.try_recv() else {
                continue;
            };
            taken += 1;

            let key = event.partition_key.clone();
            if self.shared.publish(event).await {
                debug!(worker_id = self.id, key = %key, "message published");
            }
            drop(receiver);
        }
        taken
    }
}
