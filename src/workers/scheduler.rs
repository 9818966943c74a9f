//! Cron schedule for reconciliation sweeps
//!
//! Two jobs: a frequent short-window sweep for recently created orders and a
//! daily full-day sweep that also reports its summary. Each job only triggers;
//! the sweep itself runs detached inside the reconciler.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use super::reconciliation::{ReconcileRequest, ReconciliationError, Reconciler, TriggerSource};

fn scheduler_error(err: impl std::fmt::Debug) -> ReconciliationError {
    ReconciliationError::Scheduler(format!("{:?}", err))
}

fn trigger_job(
    schedule: &str,
    reconciler: Arc<Reconciler>,
    request: ReconcileRequest,
) -> Result<Job, ReconciliationError> {
    Job::new_async(schedule, move |_uuid, _lock| {
        let reconciler = reconciler.clone();
        let request = request.clone();
        Box::pin(async move {
            if let Err(e) = reconciler.trigger(request, TriggerSource::Scheduled) {
                error!(error = %e, "Scheduled reconciliation trigger failed");
            }
        })
    })
    .map_err(scheduler_error)
}

/// Registers and starts the reconciliation jobs
pub async fn start_scheduler(reconciler: Arc<Reconciler>) -> Result<JobScheduler, ReconciliationError> {
    let config = reconciler.config().clone();
    let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;

    let minute_job = trigger_job(
        &config.minute_schedule,
        reconciler.clone(),
        ReconcileRequest::last_minutes(config.minute_window_start, config.minute_window_end, false),
    )?;
    scheduler.add(minute_job).await.map_err(scheduler_error)?;

    let daily_job = trigger_job(
        &config.daily_schedule,
        reconciler,
        ReconcileRequest::last_day(true),
    )?;
    scheduler.add(daily_job).await.map_err(scheduler_error)?;

    scheduler.start().await.map_err(scheduler_error)?;

    info!(
        minute_schedule = %config.minute_schedule,
        daily_schedule = %config.daily_schedule,
        "Reconciliation scheduler started"
    );
    Ok(scheduler)
}

/// Runs the schedule until shutdown is signalled
pub async fn run(
    reconciler: Arc<Reconciler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ReconciliationError> {
    if !reconciler.config().enabled {
        info!("Reconciliation scheduler disabled");
        return Ok(());
    }

    let mut scheduler = start_scheduler(reconciler).await?;

    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }

    info!("Shutdown signal received, stopping reconciliation scheduler");
    scheduler.shutdown().await.map_err(scheduler_error)?;
    Ok(())
}
