//! Background jobs on fixed intervals.
//!
//! Each job runs in its own task with a `tokio` interval; a slow run delays that job's next
//! tick instead of overlapping with it. Batch job bodies run under
//! [`run_with_retry`](crate::core::retry::run_with_retry). All tasks stop when the shutdown
//! signal is sent.

use crate::{
    config::Settings,
    core::{
        aggregation::{self, AggregationReport},
        clock::BusinessClock,
        delivery,
        no_show::{self, NoShowOutcome},
        notify::{self, DispatchReport, NotificationPublisher},
        retry::{self, RetryPolicy, run_with_retry},
        user,
    },
    errors::Result,
};
use sea_orm::DatabaseConnection;
use std::{fmt::Debug, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info};

pub const NO_SHOW_JOB: &str = "no_show";
pub const PAYMENT_EXPIRY_JOB: &str = "payment_expiry";
pub const AGGREGATION_JOB: &str = "daily_aggregation";
pub const WARN_RESET_JOB: &str = "monthly_warn_reset";
pub const OUTBOX_JOB: &str = "outbox_dispatch";

/// Notifications published per outbox tick.
const OUTBOX_BATCH: u64 = 100;

/// Everything a job needs, shared by all job tasks.
pub struct JobContext {
    pub db: DatabaseConnection,
    pub clock: BusinessClock,
    pub settings: Arc<Settings>,
    pub publisher: Arc<dyn NotificationPublisher>,
    pub retry: RetryPolicy,
}

impl JobContext {
    #[must_use]
    pub fn new(
        db: DatabaseConnection,
        clock: BusinessClock,
        settings: Arc<Settings>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&settings.retry);
        Self {
            db,
            clock,
            settings,
            publisher,
            retry,
        }
    }
}

pub async fn no_show_tick(ctx: &JobContext) -> Result<NoShowOutcome> {
    run_with_retry(
        NO_SHOW_JOB,
        &ctx.retry,
        retry::is_retryable,
        || no_show::run_no_show_batch(&ctx.db, &ctx.clock, &ctx.settings),
        retry::log_recovery,
    )
    .await
}

pub async fn payment_expiry_tick(ctx: &JobContext) -> Result<u64> {
    run_with_retry(
        PAYMENT_EXPIRY_JOB,
        &ctx.retry,
        retry::is_retryable,
        || delivery::expire_pending_payments(&ctx.db, &ctx.clock, &ctx.settings),
        retry::log_recovery,
    )
    .await
}

pub async fn aggregation_tick(ctx: &JobContext) -> Result<AggregationReport> {
    run_with_retry(
        AGGREGATION_JOB,
        &ctx.retry,
        retry::is_retryable,
        || aggregation::run_daily_aggregation(&ctx.db, &ctx.clock, &ctx.settings),
        retry::log_recovery,
    )
    .await
}

pub async fn warn_reset_tick(ctx: &JobContext) -> Result<Option<u64>> {
    run_with_retry(
        WARN_RESET_JOB,
        &ctx.retry,
        retry::is_retryable,
        || user::reset_monthly_warn_counts(&ctx.db, &ctx.clock),
        retry::log_recovery,
    )
    .await
}

/// Publishes pending notifications. Not retried here; failed rows stay pending for the next tick.
pub async fn outbox_tick(ctx: &JobContext) -> Result<DispatchReport> {
    notify::dispatch_pending(
        &ctx.db,
        ctx.publisher.as_ref(),
        ctx.clock.now_local(),
        OUTBOX_BATCH,
    )
    .await
}

fn log_tick<T: Debug>(job: &'static str, outcome: Result<T>) {
    match outcome {
        Ok(report) => debug!(job, ?report, "job tick finished"),
        // Batch jobs already reported through the recovery hook.
        Err(err) => error!(job, error = %err, "job tick failed"),
    }
}

fn spawn_periodic<F, Fut>(
    job: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(job, period_secs = period.as_secs(), "job scheduled");
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(job, "job stopped");
    })
}

fn every(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/// Handles to the running job tasks.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts every job. Each runs once immediately, then on its interval.
    #[must_use]
    pub fn spawn(ctx: Arc<JobContext>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let intervals = &ctx.settings.scheduler;
        let mut handles = Vec::new();

        let job_ctx = Arc::clone(&ctx);
        handles.push(spawn_periodic(
            NO_SHOW_JOB,
            every(intervals.no_show_interval_secs),
            rx.clone(),
            move || {
                let ctx = Arc::clone(&job_ctx);
                async move { log_tick(NO_SHOW_JOB, no_show_tick(&ctx).await) }
            },
        ));

        let job_ctx = Arc::clone(&ctx);
        handles.push(spawn_periodic(
            PAYMENT_EXPIRY_JOB,
            every(intervals.payment_expiry_interval_secs),
            rx.clone(),
            move || {
                let ctx = Arc::clone(&job_ctx);
                async move { log_tick(PAYMENT_EXPIRY_JOB, payment_expiry_tick(&ctx).await) }
            },
        ));

        let job_ctx = Arc::clone(&ctx);
        handles.push(spawn_periodic(
            AGGREGATION_JOB,
            every(intervals.aggregation_interval_secs),
            rx.clone(),
            move || {
                let ctx = Arc::clone(&job_ctx);
                async move {
                    log_tick(WARN_RESET_JOB, warn_reset_tick(&ctx).await);
                    log_tick(AGGREGATION_JOB, aggregation_tick(&ctx).await);
                }
            },
        ));

        let job_ctx = Arc::clone(&ctx);
        handles.push(spawn_periodic(OUTBOX_JOB, every(intervals.outbox_interval_secs), rx, move || {
            let ctx = Arc::clone(&job_ctx);
            async move { log_tick(OUTBOX_JOB, outbox_tick(&ctx).await) }
        }));

        Self { shutdown, handles }
    }

    /// Signals every job to stop and waits for the current runs to finish.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("all jobs had already stopped");
        }
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "job task panicked");
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::{notify::LoggingPublisher, reservation};
    use crate::entities::{OutboxEvent, ReservationStatus, outbox_event};
    use crate::test_utils::*;
    use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};

    fn context(db: &DatabaseConnection, clock: &BusinessClock) -> JobContext {
        let mut ctx = JobContext::new(
            db.clone(),
            clock.clone(),
            Arc::new(Settings::default()),
            Arc::new(LoggingPublisher),
        );
        ctx.retry.base_delay = Duration::from_millis(1);
        ctx
    }

    #[tokio::test]
    async fn test_ticks_run_jobs() -> Result<()> {
        let db = setup_test_db().await?;
        let (fixed, clock) = test_clock("2024-05-01 10:00");
        create_test_user(&db, "a").await?;
        let product = create_test_product(&db, date("2024-05-01"), 1000, 5).await?;
        let r = reserve_units(&db, &clock, "a", product.id, 1).await?;
        let ctx = context(&db, &clock);

        assert!(matches!(no_show_tick(&ctx).await?, NoShowOutcome::NotYet { .. }));
        assert_eq!(outbox_tick(&ctx).await?.published, 1);

        set_local(&fixed, "2024-05-01 20:10");
        assert!(matches!(no_show_tick(&ctx).await?, NoShowOutcome::Applied(_)));
        assert_eq!(
            reservation::get_reservation(&db, r.id).await?.status,
            ReservationStatus::NoShow
        );
        assert_eq!(payment_expiry_tick(&ctx).await?, 0);
        assert_eq!(warn_reset_tick(&ctx).await?, Some(1));
        assert_eq!(warn_reset_tick(&ctx).await?, None);
        assert_eq!(aggregation_tick(&ctx).await?.claimed, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_runs_once_then_stops() -> Result<()> {
        let db = setup_test_db().await?;
        let (fixed, clock) = test_clock("2024-05-01 10:00");
        create_test_user(&db, "a").await?;
        let product = create_test_product(&db, date("2024-05-01"), 1000, 5).await?;
        let r = reserve_units(&db, &clock, "a", product.id, 1).await?;
        set_local(&fixed, "2024-05-01 20:10");

        let scheduler = Scheduler::spawn(Arc::new(context(&db, &clock)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;

        assert_eq!(
            reservation::get_reservation(&db, r.id).await?.status,
            ReservationStatus::NoShow
        );
        let pending = OutboxEvent::find()
            .filter(outbox_event::Column::PublishedAt.is_null())
            .count(&db)
            .await?;
        assert!(pending <= 1, "created notice should be published, got {pending} pending");
        Ok(())
    }
}
