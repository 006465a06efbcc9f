//! Job replaying every stored transaction into a fresh ledger and comparing
//! it with the live one. Mismatches are logged as anomalies.

use anyhow::Result;
use log::info;

use crate::worker::Monitor;

pub async fn run(monitor: &Monitor) -> Result<()> {
    info!("Starting audit_ledger job...");
    let start = std::time::Instant::now();

    let discrepancies = monitor.audit_ledger().await?;

    if discrepancies.is_empty() {
        info!("audit_ledger job completed in {:?}: ledger matches", start.elapsed());
    } else {
        info!(
            "audit_ledger job completed in {:?}: {} discrepancies",
            start.elapsed(),
            discrepancies.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use num_bigint::BigInt;

    use super::*;
    use crate::db::{LedgerStore, MemoryStore};
    use crate::pubsub::EventBus;
    use crate::test_utils::{sample_transaction, test_settings, MockChain, OTHER, WALLET};

    #[tokio::test]
    async fn test_audit_finds_unaccounted_transaction_without_fixing_it() {
        let chain = Arc::new(MockChain::new(100));
        let store = Arc::new(MemoryStore::new());
        let monitor = Monitor::new(&test_settings(), chain, store.clone(), EventBus::default())
            .await
            .unwrap();

        // Stored behind the aggregator's back
        store
            .insert_transaction(&sample_transaction(OTHER, WALLET, BigInt::from(3), 10, 0))
            .await
            .unwrap();

        run(&monitor).await.unwrap();
        assert!(!monitor.audit_ledger().await.unwrap().is_empty());
        assert_eq!(monitor.aggregator().snapshot().await.total_transactions, 0);
    }
}
