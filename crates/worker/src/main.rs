//! Subsync Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription reconciliation against the gateway (every `RECONCILE_INTERVAL_SECS`)
//! - Sync invariant checks (hourly)
//! - Sync status heartbeat (every 5 minutes)

use subsync_billing::{PassReport, SyncService, SyncStores};
use subsync_shared::{create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Log the result of one reconciliation pass
fn log_pass_report(report: &PassReport) {
    match report {
        PassReport::Skipped { job_key } => {
            info!(job_key = %job_key, "Reconciliation skipped - lease held by another instance")
        }
        PassReport::Completed(summary) => {
            info!(
                job_key = %summary.job_key,
                outcome = %summary.outcome,
                selected = summary.records_selected,
                examined = summary.records_examined,
                repaired = summary.records_repaired,
                failed = summary.records_failed,
                cancelled = summary.cancelled,
                duration_ms = summary.duration_ms,
                "Reconciliation cycle complete"
            );
            if summary.records_failed > 0 {
                warn!(
                    failed = summary.records_failed,
                    "Some subscribers could not be reconciled - they are retried next pass"
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Subsync Worker");

    // The worker only makes sense against shared durable stores
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;

    let sync = SyncService::from_env(SyncStores::postgres(pool))?;
    let reconciler = sync.reconciler.clone();
    info!(
        job_key = %reconciler.config().job_key,
        holder = %reconciler.holder(),
        interval_secs = reconciler.config().interval.as_secs(),
        "Sync engine initialized"
    );

    let shutdown = CancellationToken::new();
    let passes = TaskTracker::new();

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Reconciliation pass
    // Overlapping runs across instances are excluded by the run lease
    let pass_reconciler = reconciler.clone();
    let pass_shutdown = shutdown.clone();
    let pass_tracker = passes.clone();
    scheduler
        .add(Job::new_repeated_async(
            reconciler.config().interval,
            move |_uuid, _l| {
                let reconciler = pass_reconciler.clone();
                let shutdown = pass_shutdown.clone();
                let tracker = pass_tracker.clone();
                Box::pin(async move {
                    if shutdown.is_cancelled() || tracker.is_closed() {
                        return;
                    }
                    info!("Running scheduled subscription reconciliation");
                    let pass = tracker.spawn(async move {
                        match reconciler.run_pass(&shutdown).await {
                            Ok(report) => log_pass_report(&report),
                            Err(e) => error!(error = %e, "Reconciliation pass failed"),
                        }
                    });
                    if let Err(e) = pass.await {
                        error!(error = %e, "Reconciliation pass task failed");
                    }
                })
            },
        )?)
        .await?;
    info!("Scheduled: Subscription reconciliation (every {:?})", reconciler.config().interval);

    // Job 2: Invariant checks (hourly)
    let invariants = sync.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let invariants = invariants.clone();
            Box::pin(async move {
                info!("Running sync invariant checks");
                match invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks = summary.checks_run, "Sync invariants hold")
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                subject = %violation.subject,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Sync invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Sync invariant checks (hourly)");

    // Job 3: Heartbeat with status counts (every 5 minutes)
    let reader = sync.reader.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let reader = reader.clone();
            Box::pin(async move {
                match reader.status_summary().await {
                    Ok(summary) => info!(
                        total = summary.total,
                        with_errors = summary.with_errors,
                        by_status = ?summary.by_status,
                        "Worker heartbeat"
                    ),
                    Err(e) => error!(error = %e, "Worker heartbeat could not read sync state"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Worker heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Subsync Worker started successfully with {} scheduled jobs", 3);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal - running until killed");
        std::future::pending::<()>().await;
    }

    info!("Shutting down worker");
    shutdown.cancel();
    scheduler.shutdown().await?;

    // An in-flight pass records its cancelled run and releases the lease
    passes.close();
    info!(pending = passes.len(), "Waiting for in-flight reconciliation");
    passes.wait().await;
    info!("Worker stopped");
    Ok(())
}
