//! Fixtures shared by the unit tests: a scriptable in-process chain and
//! builders for logs, transactions and settings.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use num_bigint::BigInt;

use crate::abis::Transfer;
use crate::chain::{
    BlockInfo, ChainError, ChainResult, ChainSource, FeeData, RawLog, ReceiptInfo, TokenMetadata,
    TransactionInfo,
};
use crate::config::{ChainSettings, MonitorSettings, Settings, StatsSettings};
use crate::db::models::{FeeType, Transaction, TransactionStatus, TransactionType};
use crate::utils::{bigint_to_f64, hex_encode};

pub const WALLET: &str = "0x8ba1f109551bd432803012645ac136ddd64dba72";
pub const OTHER: &str = "0x1111111111111111111111111111111111111111";
pub const TOKEN_A: &str = "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913";
pub const TOKEN_B: &str = "0x4200000000000000000000000000000000000006";
pub const CHAIN_ID: u64 = 8453;

pub const GAS_USED: u64 = 50_000;
pub const GAS_PRICE: u128 = 2_000_000_000;
const BLOCK_TIME_SECS: i64 = 12;

pub fn addr(raw: &str) -> Address {
    Address::from_str(raw).unwrap()
}

pub fn tx_hash(block: u64, index: u64) -> B256 {
    B256::from(U256::from(block * 1_000 + index))
}

/// Block timestamps advance by 12s from 2024-01-01T00:00:00Z.
pub fn block_time(block: u64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        + Duration::seconds(block as i64 * BLOCK_TIME_SECS)
}

pub fn units(n: u64, decimals: u32) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(decimals))
}

/// An encoded `Transfer` log as `eth_getLogs` returns it.
pub fn transfer_log(
    token: &str,
    from: &str,
    to: &str,
    value: U256,
    block: u64,
    log_index: u64,
) -> RawLog {
    RawLog {
        address: addr(token),
        topics: vec![
            Transfer::SIGNATURE_HASH,
            addr(from).into_word(),
            addr(to).into_word(),
        ],
        data: Bytes::from(value.to_be_bytes::<32>().to_vec()),
        block_number: Some(block),
        transaction_hash: Some(tx_hash(block, log_index)),
        log_index: Some(log_index),
    }
}

/// A stored TKA (18 decimals) transfer at `block`, as the materializer builds it.
pub fn sample_transaction(
    from: &str,
    to: &str,
    value: BigInt,
    block: u64,
    log_index: u64,
) -> Transaction {
    let raw = U256::from_str_radix(&value.to_string(), 10).unwrap();
    let is_fee_collection = to == WALLET;
    let gas_price = U256::from(GAS_PRICE);

    Transaction {
        hash: hex_encode(tx_hash(block, log_index).as_slice()),
        block_number: block,
        block_hash: hex_encode(B256::from(U256::from(block)).as_slice()),
        transaction_index: 0,
        log_index,
        timestamp: block_time(block),
        wallet_address: WALLET.to_string(),
        from_address: from.to_string(),
        to_address: to.to_string(),
        token_contract: TOKEN_A.to_string(),
        token_symbol: "TKA".to_string(),
        token_name: "Token A".to_string(),
        token_decimals: 18,
        value: raw,
        value_formatted: bigint_to_f64(&value, 18),
        gas_used: GAS_USED,
        gas_price,
        gas_fee: gas_price * U256::from(GAS_USED),
        transaction_type: TransactionType::classify(WALLET, from, to),
        is_fee_collection,
        fee_type: is_fee_collection.then_some(FeeType::LpFee),
        status: TransactionStatus::Success,
        created_at: Utc::now(),
    }
}

pub fn test_settings() -> Settings {
    Settings {
        chain: ChainSettings {
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: CHAIN_ID,
            request_timeout_secs: 5,
            max_retries: 3,
            retry_base_delay_ms: 1,
        },
        monitor: MonitorSettings {
            wallet_address: WALLET.to_string(),
            tokens: vec![TOKEN_A.to_string()],
            poll_interval_secs: 1,
            max_blocks_per_poll: 100,
            lookback_blocks: 1_000,
            confirmations: 0,
            chunk_concurrency: 2,
            chunk_delay_ms: 0,
            max_chunk_size: None,
            max_narrowing_splits: 16,
            gap_skip_after_attempts: None,
        },
        stats: StatsSettings::default(),
        postgres: None,
        redpanda: None,
    }
}

/// Scriptable [`ChainSource`].
///
/// Serves the logs it was given, derives transactions and receipts from them
/// and can be told to fail specific calls.
pub struct MockChain {
    head: Mutex<u64>,
    logs: Mutex<Vec<RawLog>>,
    metadata: Mutex<HashMap<Address, TokenMetadata>>,
    balances: Mutex<HashMap<Address, U256>>,
    /// Log queries touching these ranges fail with the given error
    failing_ranges: Mutex<Vec<(u64, u64, ChainError)>>,
    /// Log queries wider than this are rejected with a suggested range
    range_limit: Mutex<Option<u64>>,
    /// Receipts that are reported missing this many more times
    receipt_misses: Mutex<HashMap<B256, usize>>,
    /// Log queries starting inside these ranges answer after the delay
    fetch_delays: Mutex<Vec<(u64, u64, std::time::Duration)>>,
    pub log_queries: Mutex<Vec<(Address, u64, u64)>>,
    pub receipt_calls: AtomicUsize,
    pub metadata_calls: AtomicUsize,
    pub balance_calls: AtomicUsize,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            addr(TOKEN_A),
            TokenMetadata {
                symbol: "TKA".to_string(),
                name: "Token A".to_string(),
                decimals: 18,
            },
        );
        metadata.insert(
            addr(TOKEN_B),
            TokenMetadata {
                symbol: "TKB".to_string(),
                name: "Token B".to_string(),
                decimals: 6,
            },
        );

        Self {
            head: Mutex::new(head),
            logs: Mutex::new(Vec::new()),
            metadata: Mutex::new(metadata),
            balances: Mutex::new(HashMap::new()),
            failing_ranges: Mutex::new(Vec::new()),
            range_limit: Mutex::new(None),
            receipt_misses: Mutex::new(HashMap::new()),
            fetch_delays: Mutex::new(Vec::new()),
            log_queries: Mutex::new(Vec::new()),
            receipt_calls: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
            balance_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    pub fn add_log(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn set_balance(&self, token: &str, balance: U256) {
        self.balances.lock().unwrap().insert(addr(token), balance);
    }

    pub fn fail_range(&self, from: u64, to: u64, error: ChainError) {
        self.failing_ranges.lock().unwrap().push((from, to, error));
    }

    pub fn clear_failures(&self) {
        self.failing_ranges.lock().unwrap().clear();
    }

    pub fn limit_range(&self, max_blocks: u64) {
        *self.range_limit.lock().unwrap() = Some(max_blocks);
    }

    pub fn miss_receipt(&self, hash: B256, times: usize) {
        self.receipt_misses.lock().unwrap().insert(hash, times);
    }

    pub fn delay_range(&self, from: u64, to: u64, delay: std::time::Duration) {
        self.fetch_delays.lock().unwrap().push((from, to, delay));
    }

    pub fn set_metadata(&self, token: &str, metadata: TokenMetadata) {
        self.metadata.lock().unwrap().insert(addr(token), metadata);
    }

    fn find_log(&self, hash: B256) -> Option<RawLog> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.transaction_hash == Some(hash))
            .cloned()
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn latest_block_number(&self) -> ChainResult<u64> {
        Ok(*self.head.lock().unwrap())
    }

    async fn get_transfer_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<RawLog>> {
        self.log_queries
            .lock()
            .unwrap()
            .push((contract, from_block, to_block));

        let delay = self
            .fetch_delays
            .lock()
            .unwrap()
            .iter()
            .find(|(start, end, _)| from_block >= *start && from_block <= *end)
            .map(|(_, _, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(limit) = *self.range_limit.lock().unwrap() {
            if to_block - from_block + 1 > limit {
                return Err(ChainError::RangeTooLarge(format!(
                    "query exceeds max block range {}, retry with the range {}-{}",
                    limit,
                    from_block,
                    from_block + limit - 1
                )));
            }
        }

        for (start, end, error) in self.failing_ranges.lock().unwrap().iter() {
            if from_block <= *end && to_block >= *start {
                return Err(error.clone());
            }
        }

        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| {
                let block = l.block_number.unwrap_or_default();
                l.address == contract && block >= from_block && block <= to_block
            })
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, hash: B256) -> ChainResult<Option<TransactionInfo>> {
        Ok(self.find_log(hash).map(|log| TransactionInfo {
            hash,
            from: Address::from_word(log.topics[1]),
            block_number: log.block_number,
            block_hash: log.block_number.map(|b| B256::from(U256::from(b))),
            transaction_index: Some(0),
            gas_price: Some(GAS_PRICE),
        }))
    }

    async fn get_transaction_receipt(&self, hash: B256) -> ChainResult<Option<ReceiptInfo>> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut misses = self.receipt_misses.lock().unwrap();
            if let Some(remaining) = misses.get_mut(&hash) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(None);
                }
            }
        }

        Ok(self.find_log(hash).map(|log| ReceiptInfo {
            transaction_hash: hash,
            block_number: log.block_number,
            block_hash: log.block_number.map(|b| B256::from(U256::from(b))),
            transaction_index: Some(0),
            gas_used: GAS_USED,
            effective_gas_price: GAS_PRICE,
            success: true,
        }))
    }

    async fn get_block(&self, number: u64) -> ChainResult<Option<BlockInfo>> {
        Ok(Some(BlockInfo {
            number,
            hash: B256::from(U256::from(number)),
            timestamp: block_time(number).timestamp() as u64,
        }))
    }

    async fn get_fee_data(&self) -> ChainResult<FeeData> {
        Ok(FeeData {
            gas_price: GAS_PRICE,
            max_fee_per_gas: Some(GAS_PRICE * 2),
            max_priority_fee_per_gas: Some(1_000_000),
        })
    }

    async fn token_metadata(&self, contract: Address) -> ChainResult<TokenMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.metadata
            .lock()
            .unwrap()
            .get(&contract)
            .cloned()
            .ok_or_else(|| ChainError::Decode(format!("decimals() reverted for {}", contract)))
    }

    async fn balance_of(&self, contract: Address, _owner: Address) -> ChainResult<U256> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&contract)
            .copied()
            .unwrap_or_default())
    }
}
