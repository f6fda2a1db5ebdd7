#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Nexo Background Worker
//!
//! Handles scheduled jobs:
//! - Stale pending order reconciliation against Stripe (every 10 minutes)
//! - Entitlement invariant checks (daily at 3:30 AM UTC)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use nexo_billing::{BillingService, InvariantChecker};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
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

    info!("Starting Nexo Worker");

    let pool = create_db_pool().await?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    // Without Stripe only the database-side jobs run
    let billing = match BillingService::from_env(pool.clone(), http) {
        Ok(b) => Some(Arc::new(b)),
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            None
        }
    };

    let scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    // Job 1: Re-reconcile pending orders whose webhook never arrived
    if let Some(billing) = &billing {
        let reconciler = billing.reconciler.clone();
        scheduler
            .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
                let reconciler = reconciler.clone();
                Box::pin(async move {
                    info!("Running stale order reconciliation");
                    jobs::sweep_stale_orders(&reconciler, OffsetDateTime::now_utc()).await;
                })
            })?)
            .await?;
        job_count += 1;
        info!("Scheduled: Stale order reconciliation (every 10 minutes)");
    }

    // Job 2: Entitlement invariant checks
    let checker = Arc::new(InvariantChecker::new(pool.clone()));
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running entitlement invariant checks");
                jobs::check_invariants(&checker).await;
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Entitlement invariant checks (daily at 3:30 AM UTC)");

    // Job 3: Heartbeat
    let minimal = billing.is_none();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            Box::pin(async move {
                if minimal {
                    info!("Worker heartbeat (minimal mode)");
                } else {
                    info!("Worker heartbeat - all systems operational");
                }
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Nexo Worker started with {} scheduled jobs", job_count);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
