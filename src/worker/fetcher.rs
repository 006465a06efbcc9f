use std::collections::VecDeque;
use std::sync::Arc;

use alloy::{
    primitives::{Address, LogData, B256, U256},
    sol_types::SolEvent,
};
use log::{debug, warn};
use thiserror::Error;

use crate::{
    abis::Transfer,
    chain::{ChainError, ChainSource, RawLog},
    utils::{retry_with_backoff, RetryAction, RetryPolicy},
    worker::planner::{BlockRange, ChunkPlanner},
};

/// A decoded `Transfer` log involving the tracked wallet. Lives for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log is missing {0}")]
    MissingField(&'static str),

    #[error("log topic0 is not the Transfer signature")]
    WrongSignature,

    #[error("malformed Transfer payload: {0}")]
    Abi(String),
}

/// Decodes one raw log into a [`TransferEvent`].
pub fn decode_transfer(log: &RawLog) -> Result<TransferEvent, DecodeError> {
    if log.topics.first() != Some(&Transfer::SIGNATURE_HASH) {
        return Err(DecodeError::WrongSignature);
    }

    let block_number = log.block_number.ok_or(DecodeError::MissingField("block number"))?;
    let transaction_hash = log
        .transaction_hash
        .ok_or(DecodeError::MissingField("transaction hash"))?;
    let log_index = log.log_index.ok_or(DecodeError::MissingField("log index"))?;

    let log_data = LogData::new_unchecked(log.topics.clone(), log.data.clone());
    let event = Transfer::decode_log_data(&log_data).map_err(|e| DecodeError::Abi(e.to_string()))?;

    Ok(TransferEvent {
        token: log.address,
        from: event.from,
        to: event.to,
        value: event.value,
        block_number,
        transaction_hash,
        log_index,
    })
}

/// A sub-range whose logs could not be fetched for one token.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub token: Address,
    pub range: BlockRange,
    pub error: ChainError,
}

/// Everything fetched for one chunk, across all tracked tokens.
#[derive(Debug, Clone)]
pub struct ChunkFetch {
    pub range: BlockRange,
    /// Sorted by (block, log index)
    pub transfers: Vec<TransferEvent>,
    pub failures: Vec<FetchFailure>,
}

impl ChunkFetch {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Queries `Transfer` logs of the tracked tokens and keeps the wallet's.
pub struct TransferFetcher {
    chain: Arc<dyn ChainSource>,
    wallet: Address,
    tokens: Vec<Address>,
    planner: ChunkPlanner,
    policy: RetryPolicy,
    max_narrowing_splits: u32,
}

impl TransferFetcher {
    pub fn new(
        chain: Arc<dyn ChainSource>,
        wallet: Address,
        tokens: Vec<Address>,
        planner: ChunkPlanner,
        policy: RetryPolicy,
        max_narrowing_splits: u32,
    ) -> Self {
        Self {
            chain,
            wallet,
            tokens,
            planner,
            policy,
            max_narrowing_splits,
        }
    }

    /// Decodes logs and keeps transfers where the wallet is sender or recipient.
    /// Malformed logs are skipped.
    pub fn wallet_transfers(&self, logs: &[RawLog]) -> Vec<TransferEvent> {
        logs.iter()
            .filter_map(|log| match decode_transfer(log) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(
                        "Skipping malformed log from {} (tx {:?}, index {:?}): {}",
                        log.address, log.transaction_hash, log.log_index, e
                    );
                    None
                },
            })
            .filter(|event| event.from == self.wallet || event.to == self.wallet)
            .collect()
    }

    /// Fetches one token over `range`, narrowing rejected sub-ranges.
    ///
    /// Sub-ranges that still fail are returned as failures; the others'
    /// transfers are kept.
    pub async fn fetch_token(
        &self,
        token: Address,
        range: BlockRange,
    ) -> (Vec<TransferEvent>, Vec<FetchFailure>) {
        let mut transfers = Vec::new();
        let mut failures = Vec::new();
        let mut pending = VecDeque::from([range]);
        let mut splits = 0;

        while let Some(sub) = pending.pop_front() {
            let label = format!("eth_getLogs {} {}", token, sub);
            let result = retry_with_backoff(
                &self.policy,
                &label,
                || self.chain.get_transfer_logs(token, sub.start, sub.end),
                ChainError::retry_action,
            )
            .await;

            match result {
                Ok(logs) => transfers.extend(self.wallet_transfers(&logs)),
                Err(e) if e.retry_action() == RetryAction::Narrow && splits < self.max_narrowing_splits => {
                    match self.planner.narrow(sub, &e.message()) {
                        Some((head, tail)) => {
                            splits += 1;
                            debug!("Narrowing {} for {} into {} + {}", sub, token, head, tail);
                            pending.push_front(tail);
                            pending.push_front(head);
                        },
                        None => failures.push(FetchFailure {
                            token,
                            range: sub,
                            error: e,
                        }),
                    }
                },
                Err(e) => failures.push(FetchFailure {
                    token,
                    range: sub,
                    error: e,
                }),
            }
        }

        (transfers, failures)
    }

    /// Fetches every tracked token over the chunk concurrently.
    pub async fn fetch_chunk(&self, range: BlockRange) -> ChunkFetch {
        let results = futures::future::join_all(
            self.tokens.iter().map(|token| self.fetch_token(*token, range)),
        )
        .await;

        let mut transfers = Vec::new();
        let mut failures = Vec::new();
        for (t, f) in results {
            transfers.extend(t);
            failures.extend(f);
        }
        transfers.sort_by_key(|t| (t.block_number, t.log_index));
        failures.sort_by_key(|f| f.range.start);

        ChunkFetch {
            range,
            transfers,
            failures,
        }
    }
}
