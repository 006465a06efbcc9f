//! Port for the chain data source.
//!
//! The ingestion pipeline only talks to the chain through [`ChainSource`];
//! [`RpcChainSource`] is the JSON-RPC implementation.

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use thiserror::Error;

use crate::utils::RetryAction;

mod rpc;

pub use rpc::RpcChainSource;

pub type ChainResult<T> = Result<T, ChainError>;

/// Errors returned by a chain data source.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// The provider refused the block range (too many blocks or results).
    /// The message may carry a suggested replacement range.
    #[error("Block range rejected by provider: {0}")]
    RangeTooLarge(String),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The object is not (yet) available, e.g. a receipt still being indexed.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("RPC error {code:?}: {message}")]
    Rpc { code: Option<i64>, message: String },

    #[error("Decoding error: {0}")]
    Decode(String),
}

impl ChainError {
    /// Classifies the error for [`crate::utils::retry_with_backoff`].
    pub fn retry_action(&self) -> RetryAction {
        match self {
            ChainError::RangeTooLarge(_) => RetryAction::Narrow,
            ChainError::RateLimited(_)
            | ChainError::Timeout(_)
            | ChainError::Transport(_)
            | ChainError::NotFound(_) => RetryAction::Retry,
            // -32000 is the catch-all "server error" that overloaded nodes return
            ChainError::Rpc {
                code: Some(-32000),
                ..
            } => RetryAction::Retry,
            ChainError::Rpc { .. } | ChainError::Decode(_) => RetryAction::Fail,
        }
    }

    /// Free text of the error, where providers embed suggested ranges.
    pub fn message(&self) -> String {
        match self {
            ChainError::RangeTooLarge(m)
            | ChainError::RateLimited(m)
            | ChainError::Transport(m)
            | ChainError::NotFound(m)
            | ChainError::Decode(m) => m.clone(),
            ChainError::Rpc { message, .. } => message.clone(),
            ChainError::Timeout(d) => format!("timeout after {:?}", d),
        }
    }

    /// Builds an error from a JSON-RPC error payload.
    pub fn from_payload(code: i64, message: String) -> Self {
        let lower = message.to_lowercase();

        if is_rate_limit_message(&lower) || code == 429 {
            return ChainError::RateLimited(message);
        }
        if is_range_message(&lower) || code == -32005 {
            return ChainError::RangeTooLarge(message);
        }

        ChainError::Rpc {
            code: Some(code),
            message,
        }
    }
}

fn is_rate_limit_message(lower: &str) -> bool {
    lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("exceeded its compute units")
        || lower.contains("429")
}

fn is_range_message(lower: &str) -> bool {
    lower.contains("block range")
        || lower.contains("retry with the range")
        || lower.contains("range is too large")
        || lower.contains("range should work")
        || lower.contains("query returned more than")
        || lower.contains("response size exceeded")
        || lower.contains("limit exceeded")
        || lower.contains("too many blocks")
}

/// A log entry as returned by `eth_getLogs`, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionInfo {
    pub hash: B256,
    pub from: Address,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub transaction_index: Option<u64>,
    pub gas_price: Option<u128>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptInfo {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub transaction_index: Option<u64>,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    /// Unix seconds
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FeeData {
    pub gas_price: u128,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenMetadata {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

/// Read-only view of the chain used by the ingestion pipeline.
///
/// Implementations apply their own per-call timeout; retries are the
/// caller's business.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn latest_block_number(&self) -> ChainResult<u64>;

    /// `Transfer` logs emitted by `contract` in `[from_block, to_block]`.
    async fn get_transfer_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<RawLog>>;

    async fn get_transaction(&self, hash: B256) -> ChainResult<Option<TransactionInfo>>;

    async fn get_transaction_receipt(&self, hash: B256) -> ChainResult<Option<ReceiptInfo>>;

    async fn get_block(&self, number: u64) -> ChainResult<Option<BlockInfo>>;

    async fn get_fee_data(&self) -> ChainResult<FeeData>;

    async fn token_metadata(&self, contract: Address) -> ChainResult<TokenMetadata>;

    async fn balance_of(&self, contract: Address, owner: Address) -> ChainResult<U256>;
}
