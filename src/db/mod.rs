use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use crate::config::Settings;

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresClient;

use models::{Checkpoint, IngestionGap, Token, Transaction, TransactionKey, WalletLedger};

/// Durable store behind the ingestion pipeline.
///
/// All addresses passed in and returned are lowercase hex. Implementations
/// must make `insert_transaction` idempotent on the natural key and
/// `set_checkpoint` monotonic.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ==================== TOKENS ====================

    async fn get_token(&self, chain_id: u64, address: &str) -> anyhow::Result<Option<Token>>;

    async fn set_token(&self, token: &Token) -> anyhow::Result<()>;

    // ==================== TRANSACTIONS ====================

    async fn transaction_exists(&self, key: &TransactionKey) -> anyhow::Result<bool>;

    /// Returns false when a transaction with the same natural key already exists.
    async fn insert_transaction(&self, tx: &Transaction) -> anyhow::Result<bool>;

    /// Every stored transaction of the wallet in ascending
    /// (timestamp, block, transaction index, log index) order.
    async fn wallet_transactions(&self, wallet: &str) -> anyhow::Result<Vec<Transaction>>;

    async fn count_wallet_transactions(&self, wallet: &str) -> anyhow::Result<u64>;

    async fn latest_transaction_block(&self, wallet: &str) -> anyhow::Result<Option<u64>>;

    // ==================== LEDGER ====================

    async fn get_ledger(&self, wallet: &str) -> anyhow::Result<Option<WalletLedger>>;

    async fn set_ledger(&self, ledger: &WalletLedger) -> anyhow::Result<()>;

    // ==================== CHECKPOINT ====================

    async fn get_checkpoint(&self, wallet: &str, chain_id: u64)
        -> anyhow::Result<Option<Checkpoint>>;

    /// Stores the checkpoint unless the stored one is already further ahead.
    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;

    // ==================== GAPS ====================

    /// Inserts the gap, or bumps `attempts` of the existing record for the
    /// same range (reopening it if it was resolved). Returns the stored gap.
    async fn record_gap(&self, gap: &IngestionGap) -> anyhow::Result<IngestionGap>;

    async fn mark_gap_permanent(&self, gap: &IngestionGap) -> anyhow::Result<()>;

    /// Resolves open, non-permanent gaps ending at or below `through_block`.
    /// Returns how many were resolved.
    async fn resolve_gaps(
        &self,
        wallet: &str,
        chain_id: u64,
        through_block: u64,
    ) -> anyhow::Result<u64>;

    async fn open_gaps(&self, wallet: &str, chain_id: u64) -> anyhow::Result<Vec<IngestionGap>>;
}

/// Opens the configured store: PostgreSQL when configured, memory otherwise.
pub async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &settings.postgres {
        Some(pg) => {
            let client = PostgresClient::new(pg.clone()).await?;
            client.migrate().await?;
            Ok(Arc::new(client))
        },
        None => {
            warn!("No PostgreSQL configured. Using the in-memory store, data is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        },
    }
}
