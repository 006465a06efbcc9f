use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use tokio::sync::RwLock;

use crate::db::{
    models::{Transaction, WalletLedger},
    LedgerStore,
};

/// Owner of the tracked wallet's [`WalletLedger`].
///
/// All mutations go through the write lock and are persisted before they
/// become visible, so readers only ever see a ledger that is also stored.
pub struct LedgerAggregator {
    store: Arc<dyn LedgerStore>,
    wallet: String,
    ledger: RwLock<WalletLedger>,
    needs_repair: AtomicBool,
}

impl LedgerAggregator {
    /// Loads the stored ledger, or starts an empty one.
    pub async fn load(store: Arc<dyn LedgerStore>, wallet: &str) -> anyhow::Result<Self> {
        let wallet = wallet.to_lowercase();
        let ledger = store
            .get_ledger(&wallet)
            .await
            .context("Failed to load wallet ledger")?
            .unwrap_or_else(|| WalletLedger::new(wallet.clone()));

        Ok(Self {
            store,
            wallet,
            ledger: RwLock::new(ledger),
            needs_repair: AtomicBool::new(false),
        })
    }

    /// Copy of the current ledger for readers.
    pub async fn snapshot(&self) -> WalletLedger {
        self.ledger.read().await.clone()
    }

    pub fn needs_repair(&self) -> bool {
        self.needs_repair.load(Ordering::SeqCst)
    }

    /// Applies newly stored transactions and persists the result.
    ///
    /// On a persistence failure the live ledger is left untouched and the
    /// aggregator is flagged for a rebuild from the stored transactions.
    pub async fn apply(&self, transactions: &[Transaction]) -> anyhow::Result<()> {
        if transactions.is_empty() {
            return Ok(());
        }

        let mut ledger = self.ledger.write().await;
        let mut next = ledger.clone();
        for tx in transactions {
            next.apply(tx);
        }

        let inconsistent = next.inconsistent_tokens();
        if !inconsistent.is_empty() {
            error!("ANOMALY: ledger balance invariant broken for {:?}", inconsistent);
        }

        if let Err(e) = self.store.set_ledger(&next).await {
            self.needs_repair.store(true, Ordering::SeqCst);
            return Err(e.context("Failed to persist wallet ledger"));
        }

        *ledger = next;
        Ok(())
    }

    /// Replays every stored transaction of the wallet into a fresh ledger.
    /// Does not touch the live ledger.
    pub async fn recompute(&self) -> anyhow::Result<WalletLedger> {
        let transactions = self
            .store
            .wallet_transactions(&self.wallet)
            .await
            .context("Failed to load transactions for recompute")?;

        Ok(WalletLedger::recompute(&self.wallet, &transactions))
    }

    /// Replaces the live ledger with a full recompute.
    pub async fn rebuild(&self) -> anyhow::Result<()> {
        let mut ledger = self.ledger.write().await;
        let rebuilt = self.recompute().await?;

        self.store
            .set_ledger(&rebuilt)
            .await
            .context("Failed to persist rebuilt ledger")?;

        info!(
            "Rebuilt ledger for {} from {} stored transactions",
            self.wallet, rebuilt.total_transactions
        );
        *ledger = rebuilt;
        self.needs_repair.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Rebuilds when a previous save failed or the ledger does not account
    /// for every stored transaction. Returns whether a rebuild ran.
    pub async fn repair_if_needed(&self) -> anyhow::Result<bool> {
        let stored = self
            .store
            .count_wallet_transactions(&self.wallet)
            .await
            .context("Failed to count stored transactions")?;
        let counted = self.ledger.read().await.total_transactions;

        if !self.needs_repair() && stored == counted {
            return Ok(false);
        }

        warn!(
            "Ledger for {} counts {} transactions but {} are stored. Rebuilding",
            self.wallet, counted, stored
        );
        self.rebuild().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigInt;

    use super::*;
    use crate::db::MemoryStore;
    use crate::test_utils::{sample_transaction, OTHER, WALLET};

    fn units(n: u64) -> BigInt {
        BigInt::from(n) * BigInt::from(10u64).pow(18)
    }

    async fn stored(store: &MemoryStore, txs: &[Transaction]) {
        for tx in txs {
            store.insert_transaction(tx).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_apply_persists_and_matches_recompute() {
        let store = Arc::new(MemoryStore::new());
        let txs = vec![
            sample_transaction(OTHER, WALLET, units(1000), 100, 0),
            sample_transaction(WALLET, OTHER, units(400), 105, 0),
        ];
        stored(&store, &txs).await;

        let aggregator = LedgerAggregator::load(store.clone(), WALLET).await.unwrap();
        aggregator.apply(&txs).await.unwrap();

        let live = aggregator.snapshot().await;
        assert_eq!(live.tokens["TKA"].current_balance, units(600));
        assert_eq!(store.get_ledger(WALLET).await.unwrap().unwrap(), live);

        let rebuilt = aggregator.recompute().await.unwrap();
        assert!(live.discrepancies(&rebuilt).is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_live_ledger_and_flags_repair() {
        let store = Arc::new(MemoryStore::new());
        let tx = sample_transaction(OTHER, WALLET, units(1), 10, 0);
        stored(&store, std::slice::from_ref(&tx)).await;

        let aggregator = LedgerAggregator::load(store.clone(), WALLET).await.unwrap();
        store.set_fail_writes(true);
        assert!(aggregator.apply(std::slice::from_ref(&tx)).await.is_err());

        assert!(aggregator.needs_repair());
        assert_eq!(aggregator.snapshot().await.total_transactions, 0);

        store.set_fail_writes(false);
        assert!(aggregator.repair_if_needed().await.unwrap());
        assert!(!aggregator.needs_repair());
        assert_eq!(aggregator.snapshot().await.total_transactions, 1);
    }

    #[tokio::test]
    async fn test_startup_repair_catches_unaccounted_transactions() {
        let store = Arc::new(MemoryStore::new());
        let txs = vec![
            sample_transaction(OTHER, WALLET, units(3), 1, 0),
            sample_transaction(OTHER, WALLET, units(4), 2, 0),
        ];
        stored(&store, &txs).await;

        // Crash after the first ledger save: the second transaction is stored
        // but not counted
        let mut partial = WalletLedger::new(WALLET.to_string());
        partial.apply(&txs[0]);
        store.set_ledger(&partial).await.unwrap();

        let aggregator = LedgerAggregator::load(store.clone(), WALLET).await.unwrap();
        assert!(aggregator.repair_if_needed().await.unwrap());
        assert_eq!(aggregator.snapshot().await.tokens["TKA"].total_received, units(7));

        assert!(!aggregator.repair_if_needed().await.unwrap());
    }

    #[tokio::test]
    async fn test_broken_invariant_is_reported_not_corrected() {
        let store = Arc::new(MemoryStore::new());
        let mut corrupted = WalletLedger::new(WALLET.to_string());
        corrupted.apply(&sample_transaction(OTHER, WALLET, units(5), 1, 0));
        corrupted.tokens.get_mut("TKA").unwrap().current_balance = units(9);
        store.set_ledger(&corrupted).await.unwrap();

        let aggregator = LedgerAggregator::load(store.clone(), WALLET).await.unwrap();
        aggregator
            .apply(&[sample_transaction(OTHER, WALLET, units(1), 2, 0)])
            .await
            .unwrap();

        // The anomaly is logged and the drift carried forward as is
        let live = aggregator.snapshot().await;
        assert_eq!(live.inconsistent_tokens(), vec!["TKA"]);
        assert_eq!(live.tokens["TKA"].current_balance, units(10));
        assert_eq!(live.tokens["TKA"].total_received, units(6));
        assert_eq!(store.get_ledger(WALLET).await.unwrap().unwrap(), live);
    }
}
