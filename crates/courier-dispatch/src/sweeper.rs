//! Periodic re-drive of ledger rows that lost their in-process retry.
//!
//! Retries are scheduled in memory, so a restart forgets them. The sweeper
//! picks up `Failed` rows whose retry time has passed and `Initiated` rows
//! whose attempt outlived the request timeout, and hands them back to the
//! delivery use case.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{models::CallbackStatus, CallbackLog, Clock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{error::DispatchError, service::WebhookService};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Failed rows re-attempted.
    pub retried: usize,
    /// Stale in-flight rows recovered.
    pub recovered: usize,
    /// Rows skipped because they are not due or claimed by this process.
    pub skipped: usize,
}

/// Background task that re-drives overdue ledger rows.
pub struct RetrySweeper {
    service: WebhookService,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl RetrySweeper {
    /// Creates a sweeper that runs every `interval`.
    pub fn new(
        service: WebhookService,
        clock: Arc<dyn Clock>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { service, clock, interval, cancellation_token }
    }

    /// Sweeps until cancelled.
    pub async fn run(&self) {
        info!(interval_seconds = self.interval.as_secs(), "retry sweeper starting");

        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }

            match self.sweep_once().await {
                Ok(report) if report.retried + report.recovered > 0 => {
                    info!(
                        retried = report.retried,
                        recovered = report.recovered,
                        skipped = report.skipped,
                        "retry sweep completed"
                    );
                },
                Ok(report) => debug!(skipped = report.skipped, "retry sweep found nothing due"),
                Err(e) => error!(error = %e, "retry sweep failed"),
            }
        }

        info!("retry sweeper stopped");
    }

    /// Runs a single sweep.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Ledger` if the ledger cannot be listed.
    /// Failures on individual rows are logged and skipped.
    pub async fn sweep_once(&self) -> Result<SweepReport, DispatchError> {
        let now = self.clock.now_utc();
        let mut report = SweepReport::default();

        let failed =
            self.service.get_callback_logs_by_status(CallbackStatus::Failed.code()).await?;
        for log in failed {
            if self.cancellation_token.is_cancelled() {
                return Ok(report);
            }
            if self.service.is_claimed(log.id) || !self.retry_due(&log, now) {
                report.skipped += 1;
                continue;
            }

            match self.service.retry_delivery(log.id).await {
                Ok(_) => report.retried += 1,
                Err(e) => warn!(callback_log_id = %log.id, error = %e, "sweeper retry failed"),
            }
        }

        let initiated =
            self.service.get_callback_logs_by_status(CallbackStatus::Initiated.code()).await?;
        for log in initiated {
            if self.cancellation_token.is_cancelled() {
                return Ok(report);
            }
            if self.service.is_claimed(log.id) || !self.attempt_stale(&log, now) {
                report.skipped += 1;
                continue;
            }

            match self.service.recover_interrupted(log.id).await {
                Ok(_) => report.recovered += 1,
                Err(e) => {
                    warn!(callback_log_id = %log.id, error = %e, "sweeper recovery failed");
                },
            }
        }

        Ok(report)
    }

    fn retry_due(&self, log: &CallbackLog, now: DateTime<Utc>) -> bool {
        let retry_count = u32::try_from(log.retry_count).unwrap_or(u32::MAX);
        let wait = self.service.policy().interval_for(retry_count);
        elapsed_at_least(log.updated_at, now, wait)
    }

    fn attempt_stale(&self, log: &CallbackLog, now: DateTime<Utc>) -> bool {
        let grace = self.service.policy().request_timeout.saturating_mul(2);
        elapsed_at_least(log.updated_at, now, grace)
    }
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, wait: Duration) -> bool {
    match chrono::Duration::from_std(wait) {
        Ok(wait) => now.signed_duration_since(since) >= wait,
        Err(_) => false,
    }
}
