use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::TokenMetadata;

/// Metadata of a monitored ERC-20 contract (PostgreSQL)
///
/// Primary Key: (chain_id, address)
/// Immutable after first fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub chain_id: u64,
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub created_at: DateTime<Utc>,
}

impl Token {
    pub fn new(chain_id: u64, address: String, symbol: String, name: String, decimals: u8) -> Self {
        Self {
            chain_id,
            // Always lowercase addresses for consistent comparisons
            address: address.to_lowercase(),
            symbol,
            name,
            decimals,
            created_at: Utc::now(),
        }
    }

    pub fn from_metadata(chain_id: u64, address: String, metadata: TokenMetadata) -> Self {
        Self::new(chain_id, address, metadata.symbol, metadata.name, metadata.decimals)
    }

    /// Key of this token's sub-ledger: the symbol, or the address for
    /// contracts that do not expose one.
    pub fn ledger_key(&self) -> String {
        if self.symbol.trim().is_empty() {
            self.address.clone()
        } else {
            self.symbol.clone()
        }
    }
}
