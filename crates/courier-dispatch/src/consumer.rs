//! Broker consumer feeding the delivery use case.
//!
//! Each partition key gets a lane: a task that handles that key's records one
//! at a time in arrival order, so a merchant sees first attempts in the order
//! their events were produced. Lanes for different keys run concurrently and
//! a slow merchant never holds up another. Idle lanes are reaped as records
//! arrive.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use courier_core::{models::DispatchEvent, Clock};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broker::{Broker, BrokerRecord},
    error::{BrokerError, DispatchError},
    service::WebhookService,
};

/// Pause before reading again after a broker error.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Records routed between sweeps for idle lanes.
const REAP_INTERVAL: usize = 256;

/// Counters for one consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Records handed to the delivery use case.
    pub handled: u64,
    /// Records rejected as invalid.
    pub rejected: u64,
    /// Records whose processing failed in the ledger.
    pub failed: u64,
}

/// Subscribes to the dispatch topic and delivers every record.
pub struct DispatchConsumer {
    broker: Arc<dyn Broker>,
    service: WebhookService,
    clock: Arc<dyn Clock>,
    topic: String,
    group_id: String,
    cancellation_token: CancellationToken,
}

impl DispatchConsumer {
    /// Creates a consumer for `topic` in consumer group `group_id`.
    pub fn new(
        broker: Arc<dyn Broker>,
        service: WebhookService,
        clock: Arc<dyn Clock>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            broker,
            service,
            clock,
            topic: topic.into(),
            group_id: group_id.into(),
            cancellation_token,
        }
    }

    /// Consumes until cancelled or the broker closes, then waits for every
    /// lane to finish the records it was handed.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Subscribe` if the initial subscription fails.
    pub async fn run(&self) -> Result<ConsumerStats, BrokerError> {
        let mut subscription = self.broker.subscribe(&self.topic, &self.group_id).await?;
        let handler = RecordHandler {
            service: self.service.clone(),
            clock: self.clock.clone(),
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
        };
        let mut lanes = Lanes::default();
        info!(topic = %self.topic, group_id = %self.group_id, "dispatch consumer started");

        loop {
            let next = tokio::select! {
                () = self.cancellation_token.cancelled() => break,
                next = subscription.next_record() => next,
            };

            match next {
                Ok(Some(record)) => lanes.route(record, &handler),
                Ok(None) => {
                    info!(topic = %self.topic, "broker closed subscription");
                    break;
                },
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "failed to read from broker");
                    tokio::select! {
                        () = self.cancellation_token.cancelled() => break,
                        () = self.clock.sleep(READ_RETRY_DELAY) => {},
                    }
                },
            }
        }

        lanes.close().await;

        let stats = handler.snapshot();
        info!(
            handled = stats.handled,
            rejected = stats.rejected,
            failed = stats.failed,
            "dispatch consumer stopped"
        );
        Ok(stats)
    }
}

/// Hands records to the delivery use case and counts the outcomes.
#[derive(Clone)]
struct RecordHandler {
    service: WebhookService,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl RecordHandler {
    async fn handle(&self, record: BrokerRecord) {
        let event = DispatchEvent::new(record.key, record.value, self.clock.now_utc());

        match self.service.handle_dispatch_event(&event).await {
            Ok(log) => {
                self.stats().handled += 1;
                debug!(
                    key = %event.partition_key,
                    callback_log_id = %log.id,
                    status = %log.status,
                    "dispatch handled"
                );
            },
            Err(DispatchError::Validation(reason)) => {
                self.stats().rejected += 1;
                warn!(key = %event.partition_key, reason = %reason, "rejecting invalid dispatch");
            },
            Err(e) => {
                self.stats().failed += 1;
                error!(key = %event.partition_key, error = %e, "dispatch processing failed");
            },
        }
    }

    fn snapshot(&self) -> ConsumerStats {
        *self.stats()
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, ConsumerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Lane {
    sender: mpsc::UnboundedSender<BrokerRecord>,
    /// Records routed to the lane and not yet handled.
    pending: Arc<AtomicUsize>,
}

/// Per-key lanes. The consumer loop is the only sender, so a lane with
/// nothing pending can be dropped without reordering that key.
#[derive(Default)]
struct Lanes {
    lanes: HashMap<String, Lane>,
    tasks: JoinSet<()>,
    routed_since_reap: usize,
}

impl Lanes {
    fn route(&mut self, record: BrokerRecord, handler: &RecordHandler) {
        let key = record.key.clone();
        let lane = match self.lanes.remove(&key) {
            Some(lane) => lane,
            None => self.spawn_lane(&key, handler),
        };

        lane.pending.fetch_add(1, Ordering::AcqRel);
        let lane = match lane.sender.send(record) {
            Ok(()) => lane,
            Err(mpsc::error::SendError(record)) => {
                // The lane task died mid-record; give the key a fresh one.
                warn!(key = %key, "dispatch lane stopped unexpectedly; replacing it");
                let replacement = self.spawn_lane(&key, handler);
                replacement.pending.fetch_add(1, Ordering::AcqRel);
                if replacement.sender.send(record).is_err() {
                    error!(key = %key, "replacement dispatch lane unavailable; record lost");
                }
                replacement
            },
        };
        self.lanes.insert(key, lane);

        self.routed_since_reap += 1;
        if self.routed_since_reap >= REAP_INTERVAL {
            self.routed_since_reap = 0;
            self.reap();
        }
    }

    fn spawn_lane(&mut self, key: &str, handler: &RecordHandler) -> Lane {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BrokerRecord>();
        let pending = Arc::new(AtomicUsize::new(0));
        let handler = handler.clone();
        let lane_pending = pending.clone();

        debug!(key, "opening dispatch lane");
        self.tasks.spawn(async move {
            while let Some(record) = receiver.recv().await {
                handler.handle(record).await;
                lane_pending.fetch_sub(1, Ordering::AcqRel);
            }
        });

        Lane { sender, pending }
    }

    /// Drops idle lanes and collects finished lane tasks.
    fn reap(&mut self) {
        let before = self.lanes.len();
        self.lanes.retain(|_, lane| lane.pending.load(Ordering::Acquire) > 0);
        debug!(reaped = before - self.lanes.len(), open = self.lanes.len(), "reaped idle lanes");

        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "dispatch lane panicked");
            }
        }
    }

    /// Closes every lane and waits for queued records to be handled.
    async fn close(mut self) {
        self.lanes.clear();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "dispatch lane panicked");
            }
        }
    }
}
