use std::sync::Arc;

use alloy::primitives::{B256, U256};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use thiserror::Error;

use crate::{
    chain::{ChainError, ChainSource, ReceiptInfo, TransactionInfo},
    db::{
        models::{
            FeeType, Transaction, TransactionKey, TransactionStatus, TransactionType,
        },
        LedgerStore,
    },
    utils::{hex_encode, normalize_address, retry_with_backoff, u256_to_f64, RetryPolicy},
    worker::{fetcher::TransferEvent, token_fetcher::TokenFetcher},
};

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("token metadata unavailable: {0:#}")]
    Token(anyhow::Error),

    #[error("invalid block data: {0}")]
    InvalidBlock(String),

    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),
}

impl MaterializeError {
    /// Persistence failures abort the whole cycle; everything else only holds
    /// back the affected block.
    pub fn is_persistence(&self) -> bool {
        matches!(self, MaterializeError::Persistence(_))
    }
}

/// Natural key of a transfer event, normalized.
pub fn transaction_key(event: &TransferEvent) -> TransactionKey {
    TransactionKey {
        hash: hex_encode(event.transaction_hash.as_slice()),
        token_contract: normalize_address(&event.token),
        from_address: normalize_address(&event.from),
        to_address: normalize_address(&event.to),
    }
}

/// Turns transfer events into stored [`Transaction`]s.
pub struct TransactionMaterializer {
    chain: Arc<dyn ChainSource>,
    store: Arc<dyn LedgerStore>,
    tokens: TokenFetcher,
    wallet: String,
    policy: RetryPolicy,
    block_times: Cache<u64, DateTime<Utc>>,
}

impl TransactionMaterializer {
    pub fn new(
        chain: Arc<dyn ChainSource>,
        store: Arc<dyn LedgerStore>,
        tokens: TokenFetcher,
        wallet: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            chain,
            store,
            tokens,
            wallet: wallet.to_lowercase(),
            policy,
            block_times: Cache::builder().max_capacity(10_000).build(),
        }
    }

    /// Stores the transfer unless its natural key is already present.
    ///
    /// Returns the new transaction, or `None` when it was already stored.
    pub async fn materialize(
        &self,
        event: &TransferEvent,
    ) -> Result<Option<Transaction>, MaterializeError> {
        let key = transaction_key(event);
        if self
            .store
            .transaction_exists(&key)
            .await
            .map_err(MaterializeError::Persistence)?
        {
            return Ok(None);
        }

        let token = self
            .tokens
            .get(event.token)
            .await
            .map_err(MaterializeError::Token)?;

        let (tx, receipt) = tokio::join!(
            self.fetch_transaction(event.transaction_hash),
            self.fetch_receipt(event.transaction_hash)
        );
        let (tx, receipt) = (tx?, receipt?);
        let timestamp = self.block_time(event.block_number).await?;

        // Receipts report what was actually paid; legacy nodes may leave it at zero
        let gas_price = if receipt.effective_gas_price > 0 {
            receipt.effective_gas_price
        } else {
            tx.gas_price.unwrap_or_default()
        };
        let gas_price = U256::from(gas_price);
        let gas_fee = U256::from(receipt.gas_used) * gas_price;

        let transaction_type =
            TransactionType::classify(&self.wallet, &key.from_address, &key.to_address);
        let is_fee_collection = key.to_address == self.wallet;

        let block_hash = receipt
            .block_hash
            .or(tx.block_hash)
            .map(|h| hex_encode(h.as_slice()))
            .unwrap_or_default();

        let transaction = Transaction {
            hash: key.hash,
            block_number: event.block_number,
            block_hash,
            transaction_index: receipt
                .transaction_index
                .or(tx.transaction_index)
                .unwrap_or_default(),
            log_index: event.log_index,
            timestamp,
            wallet_address: self.wallet.clone(),
            from_address: key.from_address,
            to_address: key.to_address,
            token_contract: key.token_contract,
            token_symbol: token.symbol.clone(),
            token_name: token.name.clone(),
            token_decimals: token.decimals,
            value: event.value,
            value_formatted: u256_to_f64(event.value, token.decimals),
            gas_used: receipt.gas_used,
            gas_price,
            gas_fee,
            transaction_type,
            is_fee_collection,
            fee_type: is_fee_collection.then_some(FeeType::LpFee),
            status: if receipt.success {
                TransactionStatus::Success
            } else {
                TransactionStatus::Failed
            },
            created_at: Utc::now(),
        };

        let inserted = self
            .store
            .insert_transaction(&transaction)
            .await
            .map_err(MaterializeError::Persistence)?;

        Ok(inserted.then_some(transaction))
    }

    async fn fetch_transaction(&self, hash: B256) -> Result<TransactionInfo, ChainError> {
        let label = format!("eth_getTransactionByHash {}", hash);
        retry_with_backoff(
            &self.policy,
            &label,
            || async move {
                self.chain
                    .get_transaction(hash)
                    .await?
                    .ok_or_else(|| ChainError::NotFound(format!("transaction {}", hash)))
            },
            ChainError::retry_action,
        )
        .await
    }

    /// Receipts can lag the logs on load-balanced providers, so a missing
    /// receipt is retried like a transient error.
    async fn fetch_receipt(&self, hash: B256) -> Result<ReceiptInfo, ChainError> {
        let label = format!("eth_getTransactionReceipt {}", hash);
        retry_with_backoff(
            &self.policy,
            &label,
            || async move {
                self.chain
                    .get_transaction_receipt(hash)
                    .await?
                    .ok_or_else(|| ChainError::NotFound(format!("receipt {}", hash)))
            },
            ChainError::retry_action,
        )
        .await
    }

    async fn block_time(&self, number: u64) -> Result<DateTime<Utc>, MaterializeError> {
        if let Some(ts) = self.block_times.get(&number).await {
            return Ok(ts);
        }

        let label = format!("eth_getBlockByNumber {}", number);
        let block = retry_with_backoff(
            &self.policy,
            &label,
            || async move {
                self.chain
                    .get_block(number)
                    .await?
                    .ok_or_else(|| ChainError::NotFound(format!("block {}", number)))
            },
            ChainError::retry_action,
        )
        .await?;

        let ts = DateTime::from_timestamp(block.timestamp as i64, 0).ok_or_else(|| {
            MaterializeError::InvalidBlock(format!(
                "block {} has timestamp {}",
                number, block.timestamp
            ))
        })?;

        self.block_times.insert(number, ts).await;
        Ok(ts)
    }
}
