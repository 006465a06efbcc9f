use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::db::models::{
    Checkpoint, IngestionGap, Token, Transaction, TransactionKey, WalletLedger,
};
use crate::db::LedgerStore;

/// Attempts accumulate per start block; the end widens as the head moves.
type GapKey = (String, u64, u64);

#[derive(Default)]
struct Tables {
    tokens: FxHashMap<(u64, String), Token>,
    transactions: FxHashMap<TransactionKey, Transaction>,
    ledgers: FxHashMap<String, WalletLedger>,
    checkpoints: FxHashMap<(String, u64), Checkpoint>,
    gaps: FxHashMap<GapKey, IngestionGap>,
    #[cfg(test)]
    checkpoint_writes: Vec<u64>,
}

/// Process-local [`LedgerStore`]. Used when no database is configured and by
/// tests. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write return an error, simulating an unavailable database.
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every block number passed to `set_checkpoint`, in call order.
    #[cfg(test)]
    pub async fn checkpoint_writes(&self) -> Vec<u64> {
        self.tables.read().await.checkpoint_writes.clone()
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_token(&self, chain_id: u64, address: &str) -> anyhow::Result<Option<Token>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tokens
            .get(&(chain_id, address.to_lowercase()))
            .cloned())
    }

    async fn set_token(&self, token: &Token) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables
            .tokens
            .insert((token.chain_id, token.address.clone()), token.clone());
        Ok(())
    }

    async fn transaction_exists(&self, key: &TransactionKey) -> anyhow::Result<bool> {
        Ok(self.tables.read().await.transactions.contains_key(key))
    }

    async fn insert_transaction(&self, tx: &Transaction) -> anyhow::Result<bool> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let key = tx.key();
        if tables.transactions.contains_key(&key) {
            return Ok(false);
        }
        tables.transactions.insert(key, tx.clone());
        Ok(true)
    }

    async fn wallet_transactions(&self, wallet: &str) -> anyhow::Result<Vec<Transaction>> {
        let wallet = wallet.to_lowercase();
        let tables = self.tables.read().await;
        let mut txs: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|tx| tx.wallet_address == wallet)
            .cloned()
            .collect();
        txs.sort_by(|a, b| {
            (a.timestamp, a.block_number, a.transaction_index, a.log_index).cmp(&(
                b.timestamp,
                b.block_number,
                b.transaction_index,
                b.log_index,
            ))
        });
        Ok(txs)
    }

    async fn count_wallet_transactions(&self, wallet: &str) -> anyhow::Result<u64> {
        let wallet = wallet.to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .values()
            .filter(|tx| tx.wallet_address == wallet)
            .count() as u64)
    }

    async fn latest_transaction_block(&self, wallet: &str) -> anyhow::Result<Option<u64>> {
        let wallet = wallet.to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .values()
            .filter(|tx| tx.wallet_address == wallet)
            .map(|tx| tx.block_number)
            .max())
    }

    async fn get_ledger(&self, wallet: &str) -> anyhow::Result<Option<WalletLedger>> {
        let tables = self.tables.read().await;
        Ok(tables.ledgers.get(&wallet.to_lowercase()).cloned())
    }

    async fn set_ledger(&self, ledger: &WalletLedger) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables
            .ledgers
            .insert(ledger.wallet_address.clone(), ledger.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        wallet: &str,
        chain_id: u64,
    ) -> anyhow::Result<Option<Checkpoint>> {
        let tables = self.tables.read().await;
        Ok(tables
            .checkpoints
            .get(&(wallet.to_lowercase(), chain_id))
            .cloned())
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        #[cfg(test)]
        tables.checkpoint_writes.push(checkpoint.last_processed_block);
        let key = (checkpoint.wallet_address.clone(), checkpoint.chain_id);
        match tables.checkpoints.get_mut(&key) {
            Some(stored) => {
                stored.advance(checkpoint.last_processed_block);
            },
            None => {
                tables.checkpoints.insert(key, checkpoint.clone());
            },
        }
        Ok(())
    }

    async fn record_gap(&self, gap: &IngestionGap) -> anyhow::Result<IngestionGap> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let key = (gap.wallet_address.clone(), gap.chain_id, gap.from_block);

        let stored = tables
            .gaps
            .entry(key)
            .and_modify(|existing| {
                existing.attempts += 1;
                existing.to_block = existing.to_block.max(gap.to_block);
                existing.reason = gap.reason.clone();
                existing.last_attempt_at = gap.last_attempt_at;
                existing.resolved_at = None;
            })
            .or_insert_with(|| gap.clone());

        Ok(stored.clone())
    }

    async fn mark_gap_permanent(&self, gap: &IngestionGap) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let key = (gap.wallet_address.clone(), gap.chain_id, gap.from_block);
        if let Some(stored) = tables.gaps.get_mut(&key) {
            stored.permanent = true;
        }
        Ok(())
    }

    async fn resolve_gaps(
        &self,
        wallet: &str,
        chain_id: u64,
        through_block: u64,
    ) -> anyhow::Result<u64> {
        self.check_writable()?;
        let wallet = wallet.to_lowercase();
        let now = Utc::now();
        let mut tables = self.tables.write().await;

        let mut resolved = 0;
        for gap in tables.gaps.values_mut() {
            if gap.wallet_address == wallet
                && gap.chain_id == chain_id
                && gap.to_block <= through_block
                && gap.is_open()
                && !gap.permanent
            {
                gap.resolved_at = Some(now);
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    async fn open_gaps(&self, wallet: &str, chain_id: u64) -> anyhow::Result<Vec<IngestionGap>> {
        let wallet = wallet.to_lowercase();
        let tables = self.tables.read().await;
        let mut gaps: Vec<IngestionGap> = tables
            .gaps
            .values()
            .filter(|g| g.wallet_address == wallet && g.chain_id == chain_id && g.is_open())
            .cloned()
            .collect();
        gaps.sort_by_key(|g| g.from_block);
        Ok(gaps)
    }
}
