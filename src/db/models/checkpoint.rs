use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ingestion progress for one wallet on one chain (PostgreSQL).
///
/// Primary Key: (wallet_address, chain_id)
///
/// Every transfer in blocks `<= last_processed_block` has been materialized
/// and applied to the ledger. The value never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub wallet_address: String,
    pub chain_id: u64,
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(wallet_address: String, chain_id: u64, last_processed_block: u64) -> Self {
        Self {
            wallet_address: wallet_address.to_lowercase(),
            chain_id,
            last_processed_block,
            updated_at: Utc::now(),
        }
    }

    /// Moves the checkpoint forward to `block`. Returns false (and leaves the
    /// checkpoint untouched) when `block` is not past the current value.
    pub fn advance(&mut self, block: u64) -> bool {
        if block <= self.last_processed_block {
            return false;
        }
        self.last_processed_block = block;
        self.updated_at = Utc::now();
        true
    }
}
