//! Job comparing the ledger with on-chain balances.
//!
//! Read-only: disagreements are reported as anomalies, the ledger keeps the
//! totals it computed from transfers.

use anyhow::Result;
use log::info;

use crate::worker::Monitor;

pub async fn run(monitor: &Monitor) -> Result<()> {
    info!("Starting reconcile_balances job...");
    let start = std::time::Instant::now();

    let report = monitor.reconcile_balances().await?;

    info!(
        "reconcile_balances job completed in {:?}: {} tokens checked, {} anomalies",
        start.elapsed(),
        report.balances.len(),
        report.anomalies
    );
    Ok(())
}
