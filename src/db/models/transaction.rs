use std::fmt;
use std::str::FromStr;

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::utils::{u256_string, u256_to_bigint};

/// Direction of a transfer relative to the tracked wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Incoming,
    Outgoing,
    /// Self-transfers, and transfers where the wallet is neither side
    Internal,
}

impl TransactionType {
    /// Classifies a transfer. All addresses must already be normalized.
    pub fn classify(wallet: &str, from: &str, to: &str) -> Self {
        let is_sender = from == wallet;
        let is_recipient = to == wallet;

        match (is_sender, is_recipient) {
            (false, true) => TransactionType::Incoming,
            (true, false) => TransactionType::Outgoing,
            _ => TransactionType::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Incoming => "incoming",
            TransactionType::Outgoing => "outgoing",
            TransactionType::Internal => "internal",
        }
    }
}

impl FromStr for TransactionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(TransactionType::Incoming),
            "outgoing" => Ok(TransactionType::Outgoing),
            "internal" => Ok(TransactionType::Internal),
            other => Err(anyhow::anyhow!("Unknown transaction type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeType {
    LpFee,
    ProtocolFee,
    Other,
}

impl FeeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeType::LpFee => "LP_FEE",
            FeeType::ProtocolFee => "PROTOCOL_FEE",
            FeeType::Other => "OTHER",
        }
    }
}

impl FromStr for FeeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LP_FEE" => Ok(FeeType::LpFee),
            "PROTOCOL_FEE" => Ok(FeeType::ProtocolFee),
            "OTHER" => Ok(FeeType::Other),
            other => Err(anyhow::anyhow!("Unknown fee type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Success,
    Failed,
    Pending,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Pending => "pending",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(TransactionStatus::Success),
            "failed" => Ok(TransactionStatus::Failed),
            "pending" => Ok(TransactionStatus::Pending),
            other => Err(anyhow::anyhow!("Unknown transaction status: {}", other)),
        }
    }
}

/// Natural key of a stored transfer.
///
/// One transaction hash can carry several distinct transfers (multi-leg
/// swaps), so the hash alone is not unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey {
    pub hash: String,
    pub token_contract: String,
    pub from_address: String,
    pub to_address: String,
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}->{}",
            self.hash, self.token_contract, self.from_address, self.to_address
        )
    }
}

/// Materialized ERC-20 transfer involving the tracked wallet.
///
/// Primary Key: (hash, token_contract, from_address, to_address)
/// Immutable once written. All addresses and hashes are lowercase hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    // Identifiers
    pub hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
    pub timestamp: DateTime<Utc>,

    // Participants
    pub wallet_address: String,
    pub from_address: String,
    pub to_address: String,

    // Token
    pub token_contract: String,
    pub token_symbol: String,
    pub token_name: String,
    pub token_decimals: u8,

    // Amounts. `value` is authoritative, `value_formatted` is display only
    #[serde(with = "u256_string")]
    pub value: U256,
    pub value_formatted: f64,

    // Gas
    pub gas_used: u64,
    #[serde(with = "u256_string")]
    pub gas_price: U256,
    #[serde(with = "u256_string")]
    pub gas_fee: U256,

    // Classification
    pub transaction_type: TransactionType,
    pub is_fee_collection: bool,
    pub fee_type: Option<FeeType>,
    pub status: TransactionStatus,

    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn key(&self) -> TransactionKey {
        TransactionKey {
            hash: self.hash.clone(),
            token_contract: self.token_contract.clone(),
            from_address: self.from_address.clone(),
            to_address: self.to_address.clone(),
        }
    }

    pub fn raw_value(&self) -> BigInt {
        u256_to_bigint(self.value)
    }

    pub fn is_incoming_for(&self, wallet: &str) -> bool {
        self.to_address == wallet
    }

    pub fn is_outgoing_for(&self, wallet: &str) -> bool {
        self.from_address == wallet
    }
}
