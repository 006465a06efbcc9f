//! Cron scheduler for the periodic statistics jobs:
//! - Reconciling ledger balances against `balanceOf`
//! - Auditing the live ledger against a full recompute

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use crate::config::StatsSettings;
use crate::worker::Monitor;

use super::jobs;

pub struct CronScheduler {
    monitor: Arc<Monitor>,
    settings: StatsSettings,
}

impl CronScheduler {
    pub fn new(monitor: Arc<Monitor>, settings: StatsSettings) -> Self {
        Self { monitor, settings }
    }

    /// Starts the scheduler and runs until cancellation.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        let mut scheduler = JobScheduler::new().await?;

        self.register_reconcile_balances_job(&scheduler).await?;
        self.register_audit_ledger_job(&scheduler).await?;

        scheduler.start().await?;
        info!("Cron scheduler started with {} jobs", 2);

        cancellation_token.cancelled().await;
        info!("Cron scheduler shutting down...");

        scheduler.shutdown().await?;
        Ok(())
    }

    async fn register_reconcile_balances_job(&self, scheduler: &JobScheduler) -> Result<()> {
        let monitor = self.monitor.clone();
        let interval = self.settings.reconcile_interval_secs;

        let job = Job::new_repeated_async(Duration::from_secs(interval), move |_uuid, _lock| {
            let monitor = monitor.clone();
            Box::pin(async move {
                if let Err(e) = jobs::reconcile_balances::run(&monitor).await {
                    error!("Failed to reconcile balances: {:#}", e);
                }
            })
        })?;

        scheduler.add(job).await?;
        info!("Registered reconcile_balances job (every {}s)", interval);
        Ok(())
    }

    async fn register_audit_ledger_job(&self, scheduler: &JobScheduler) -> Result<()> {
        let monitor = self.monitor.clone();
        let interval = self.settings.audit_interval_secs;

        let job = Job::new_repeated_async(Duration::from_secs(interval), move |_uuid, _lock| {
            let monitor = monitor.clone();
            Box::pin(async move {
                if let Err(e) = jobs::audit_ledger::run(&monitor).await {
                    error!("Failed to audit ledger: {:#}", e);
                }
            })
        })?;

        scheduler.add(job).await?;
        info!("Registered audit_ledger job (every {}s)", interval);
        Ok(())
    }
}
