use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use log::{debug, error, info, warn};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainError, ChainSource},
    config::{MonitorSettings, Settings},
    db::{
        models::{Checkpoint, IngestionGap, Token, Transaction},
        LedgerStore,
    },
    pubsub::{EventBus, LedgerEvent, TokenBalance},
    utils::{
        format_units, normalize_address, retry_with_backoff, u256_to_bigint, u256_to_f64,
        RetryPolicy,
    },
    worker::{
        aggregator::LedgerAggregator,
        fetcher::{ChunkFetch, TransferFetcher},
        materializer::TransactionMaterializer,
        planner::{BlockRange, ChunkPlanner},
        token_fetcher::TokenFetcher,
    },
};

/// Where the poller currently is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Fetching(BlockRangeState),
    Materializing(BlockRangeState),
    Aggregating(BlockRangeState),
    Advancing(u64),
}

/// Serializable copy of a [`BlockRange`] for state reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRangeState {
    pub start: u64,
    pub end: u64,
}

impl From<BlockRange> for BlockRangeState {
    fn from(range: BlockRange) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub state: PollerState,
    pub wallet_address: String,
    pub chain_id: u64,
    pub last_processed_block: Option<u64>,
    pub poll_interval_secs: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

/// What one call to [`Monitor::run_cycle`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle holds the checkpoint
    Skipped,
    UpToDate { checkpoint: u64 },
    Completed(CycleReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub from_block: u64,
    pub to_block: u64,
    pub transfers_found: usize,
    pub stored: usize,
    pub checkpoint: u64,
    /// Block the checkpoint is waiting on, if any
    pub held_at: Option<u64>,
    pub gaps: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub balances: Vec<TokenBalance>,
    pub anomalies: usize,
}

/// Ingestion service for one wallet: drives fetch, materialize, aggregate
/// and checkpoint advance, and reconciles against on-chain balances.
pub struct Monitor {
    settings: MonitorSettings,
    poll_interval: Duration,
    chain_id: u64,
    wallet: Address,
    wallet_key: String,
    tokens: Vec<Address>,
    chain: Arc<dyn ChainSource>,
    store: Arc<dyn LedgerStore>,
    planner: ChunkPlanner,
    fetcher: TransferFetcher,
    token_fetcher: TokenFetcher,
    materializer: TransactionMaterializer,
    aggregator: LedgerAggregator,
    bus: EventBus,
    policy: RetryPolicy,
    /// Held for the whole of a cycle; only one cycle touches the checkpoint
    cycle_lock: Mutex<()>,
    checkpoint: RwLock<Option<Checkpoint>>,
    state: watch::Sender<PollerState>,
    running: AtomicBool,
    last_cycle_at: RwLock<Option<DateTime<Utc>>>,
    last_reconciled_at: RwLock<Option<DateTime<Utc>>>,
}

impl Monitor {
    pub async fn new(
        settings: &Settings,
        chain: Arc<dyn ChainSource>,
        store: Arc<dyn LedgerStore>,
        bus: EventBus,
    ) -> anyhow::Result<Self> {
        let wallet = settings.wallet_address()?;
        let tokens = settings.token_addresses()?;
        let wallet_key = normalize_address(&wallet);
        let chain_id = settings.chain.chain_id;
        let policy = RetryPolicy::new(
            settings.chain.max_retries,
            Duration::from_millis(settings.chain.retry_base_delay_ms),
        );
        let planner = ChunkPlanner::new(settings.monitor.max_chunk_size);

        let fetcher = TransferFetcher::new(
            chain.clone(),
            wallet,
            tokens.clone(),
            planner,
            policy,
            settings.monitor.max_narrowing_splits,
        );
        let token_fetcher = TokenFetcher::new(chain.clone(), store.clone(), chain_id, policy);
        let materializer = TransactionMaterializer::new(
            chain.clone(),
            store.clone(),
            token_fetcher.clone(),
            wallet_key.clone(),
            policy,
        );
        let aggregator = LedgerAggregator::load(store.clone(), &wallet_key).await?;
        let (state, _) = watch::channel(PollerState::Idle);

        Ok(Self {
            settings: settings.monitor.clone(),
            poll_interval: settings.poll_interval(),
            chain_id,
            wallet,
            wallet_key,
            tokens,
            chain,
            store,
            planner,
            fetcher,
            token_fetcher,
            materializer,
            aggregator,
            bus,
            policy,
            cycle_lock: Mutex::new(()),
            checkpoint: RwLock::new(None),
            state,
            running: AtomicBool::new(false),
            last_cycle_at: RwLock::new(None),
            last_reconciled_at: RwLock::new(None),
        })
    }

    /// Startup work: ledger repair, token metadata and the initial checkpoint.
    pub async fn start(&self) -> anyhow::Result<()> {
        let _cycle = self.cycle_lock.lock().await;

        let tokens = self
            .token_fetcher
            .warm_up(&self.tokens)
            .await
            .context("Failed to resolve tracked token metadata")?;
        ensure_distinct_ledger_keys(&tokens)?;
        for token in &tokens {
            info!(
                "Tracking {} ({}) for wallet {}",
                token.symbol, token.address, self.wallet_key
            );
        }

        if self.aggregator.repair_if_needed().await? {
            self.bus.publish(LedgerEvent::LedgerUpdated {
                ledger: Box::new(self.aggregator.snapshot().await),
            });
        }

        let head = self.safe_head().await?;
        let checkpoint = self.load_checkpoint(head).await?;
        info!(
            "Monitor ready for {} on chain {} at block {} (head {})",
            self.wallet_key, self.chain_id, checkpoint.last_processed_block, head
        );
        Ok(())
    }

    /// Polls until cancelled. A failed cycle is logged and retried on the next tick.
    pub async fn run(&self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            if let Err(e) = self.run_cycle(&cancellation_token).await {
                error!("Ingestion cycle for {} failed: {:#}", self.wallet_key, e);
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {},
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Monitor for {} received cancellation signal", self.wallet_key);
        Ok(())
    }

    /// One ingestion cycle. Returns immediately if another cycle is running.
    ///
    /// Cancellation is honoured between chunks, never inside one.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> anyhow::Result<CycleOutcome> {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!("Cycle already running for {}, skipping", self.wallet_key);
            return Ok(CycleOutcome::Skipped);
        };

        let result = self.cycle(cancel).await;
        self.set_state(PollerState::Idle);
        *self.last_cycle_at.write().await = Some(Utc::now());
        result
    }

    async fn cycle(&self, cancel: &CancellationToken) -> anyhow::Result<CycleOutcome> {
        if self.aggregator.needs_repair() {
            self.aggregator.repair_if_needed().await?;
        }

        let head = self.safe_head().await?;
        let mut checkpoint = self.load_checkpoint(head).await?;
        let from_block = checkpoint.last_processed_block + 1;
        if from_block > head {
            return Ok(CycleOutcome::UpToDate {
                checkpoint: checkpoint.last_processed_block,
            });
        }

        let to_block = head.min(
            checkpoint
                .last_processed_block
                .saturating_add(self.settings.max_blocks_per_poll),
        );
        let range = BlockRange::new(from_block, to_block);
        let chunks = self.planner.plan(range);
        let mut report = CycleReport {
            from_block,
            to_block,
            ..Default::default()
        };

        self.set_state(PollerState::Fetching(range.into()));
        let chunk_delay = Duration::from_millis(self.settings.chunk_delay_ms);
        let mut fetches = stream::iter(chunks)
            .map(|chunk| async move {
                let fetch = self.fetcher.fetch_chunk(chunk).await;
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
                fetch
            })
            .buffered(self.settings.chunk_concurrency.max(1));

        while let Some(fetch) = fetches.next().await {
            let chunk = fetch.range;
            report.transfers_found += fetch.transfers.len();

            let mut held_at = self.record_gaps(&fetch, &mut report).await?;

            self.set_state(PollerState::Materializing(chunk.into()));
            let mut stored = Vec::new();
            for event in &fetch.transfers {
                if held_at.is_some_and(|held| event.block_number >= held) {
                    break;
                }
                match self.materializer.materialize(event).await {
                    Ok(Some(tx)) => stored.push(tx),
                    Ok(None) => {},
                    Err(e) if e.is_persistence() => {
                        self.apply_stored(&stored, chunk).await?;
                        return Err(anyhow::Error::new(e).context(format!(
                            "Failed to store transfer in block {}",
                            event.block_number
                        )));
                    },
                    Err(e) => {
                        error!(
                            "Dropping transfer {} (log {}) in block {} for this cycle: {}",
                            event.transaction_hash, event.log_index, event.block_number, e
                        );
                        held_at = Some(event.block_number);
                        break;
                    },
                }
            }
            report.stored += stored.len();

            self.apply_stored(&stored, chunk).await?;

            let target = match held_at {
                Some(held) => held - 1,
                None => chunk.end,
            };
            self.set_state(PollerState::Advancing(target));
            if checkpoint.advance(target) {
                self.store
                    .set_checkpoint(&checkpoint)
                    .await
                    .context("Failed to persist checkpoint")?;
                *self.checkpoint.write().await = Some(checkpoint.clone());

                match self
                    .store
                    .resolve_gaps(&self.wallet_key, self.chain_id, target)
                    .await
                {
                    Ok(0) => {},
                    Ok(n) => info!("Resolved {} ingestion gaps through block {}", n, target),
                    Err(e) => warn!("Failed to resolve ingestion gaps: {:#}", e),
                }
            }

            if held_at.is_some() {
                report.held_at = held_at;
                break;
            }
            if cancel.is_cancelled() {
                info!("Stopping cycle after chunk {} on cancellation", chunk);
                break;
            }
        }

        report.checkpoint = checkpoint.last_processed_block;
        info!(
            "Cycle [{}, {}] for {}: {} transfers found, {} stored, checkpoint {}{}",
            report.from_block,
            report.to_block,
            self.wallet_key,
            report.transfers_found,
            report.stored,
            report.checkpoint,
            report
                .held_at
                .map(|b| format!(" (held at block {})", b))
                .unwrap_or_default()
        );

        if report.stored > 0 {
            self.bus.publish(LedgerEvent::NewTransactions {
                wallet_address: self.wallet_key.clone(),
                count: report.stored,
                latest_block: report.checkpoint,
            });
        }

        Ok(CycleOutcome::Completed(report))
    }

    /// Persists one [`IngestionGap`] per failed start block and returns the
    /// first block the checkpoint must stay below, if any.
    async fn record_gaps(
        &self,
        fetch: &ChunkFetch,
        report: &mut CycleReport,
    ) -> anyhow::Result<Option<u64>> {
        let mut held_at: Option<u64> = None;

        // One attempt per start block per cycle, however many tokens failed there
        let mut failed: BTreeMap<u64, (u64, Vec<String>)> = BTreeMap::new();
        for failure in &fetch.failures {
            let (end, reasons) = failed
                .entry(failure.range.start)
                .or_insert((failure.range.end, Vec::new()));
            *end = (*end).max(failure.range.end);
            reasons.push(format!("{}: {}", normalize_address(&failure.token), failure.error));
        }

        for (from_block, (to_block, reasons)) in failed {
            let gap = IngestionGap::new(
                self.wallet_key.clone(),
                self.chain_id,
                from_block,
                to_block,
                reasons.join("; "),
            );
            let mut gap = self
                .store
                .record_gap(&gap)
                .await
                .context("Failed to persist ingestion gap")?;
            report.gaps += 1;

            let skip = self
                .settings
                .gap_skip_after_attempts
                .is_some_and(|limit| gap.attempts >= limit);

            if gap.permanent {
                debug!("Passing permanent gap [{}, {}]", gap.from_block, gap.to_block);
            } else if skip {
                self.store
                    .mark_gap_permanent(&gap)
                    .await
                    .context("Failed to mark ingestion gap permanent")?;
                gap.permanent = true;
                error!(
                    "Blocks [{}, {}] ({} blocks) skipped after {} failed attempts, transfers there are missing: {}",
                    gap.from_block,
                    gap.to_block,
                    gap.block_count(),
                    gap.attempts,
                    gap.reason
                );
            } else {
                error!(
                    "Ingestion gap [{}, {}] ({} blocks, attempt {}): {}",
                    gap.from_block,
                    gap.to_block,
                    gap.block_count(),
                    gap.attempts,
                    gap.reason
                );
                held_at = Some(held_at.map_or(gap.from_block, |b| b.min(gap.from_block)));
            }

            self.bus.publish(LedgerEvent::GapDetected { gap });
        }

        Ok(held_at)
    }

    async fn apply_stored(&self, stored: &[Transaction], chunk: BlockRange) -> anyhow::Result<()> {
        if stored.is_empty() {
            return Ok(());
        }

        self.set_state(PollerState::Aggregating(chunk.into()));
        self.aggregator.apply(stored).await?;

        for tx in stored {
            self.bus.publish(LedgerEvent::NewTransaction {
                transaction: Box::new(tx.clone()),
            });
        }
        self.bus.publish(LedgerEvent::LedgerUpdated {
            ledger: Box::new(self.aggregator.snapshot().await),
        });
        Ok(())
    }

    /// Head minus the confirmation lag.
    async fn safe_head(&self) -> anyhow::Result<u64> {
        let head = retry_with_backoff(
            &self.policy,
            "eth_blockNumber",
            || self.chain.latest_block_number(),
            ChainError::retry_action,
        )
        .await
        .context("Failed to fetch latest block")?;

        Ok(head.saturating_sub(self.settings.confirmations))
    }

    /// Cached checkpoint, else the stored one, else a seeded one: the block
    /// before the latest stored transaction, or `lookback_blocks` behind head.
    async fn load_checkpoint(&self, head: u64) -> anyhow::Result<Checkpoint> {
        if let Some(checkpoint) = self.checkpoint.read().await.clone() {
            return Ok(checkpoint);
        }

        let checkpoint = match self
            .store
            .get_checkpoint(&self.wallet_key, self.chain_id)
            .await
            .context("Failed to load checkpoint")?
        {
            Some(checkpoint) => checkpoint,
            None => {
                let seed = match self
                    .store
                    .latest_transaction_block(&self.wallet_key)
                    .await
                    .context("Failed to load latest stored transaction")?
                {
                    Some(block) => block.saturating_sub(1),
                    None => head.saturating_sub(self.settings.lookback_blocks),
                };
                info!("Seeding checkpoint for {} at block {}", self.wallet_key, seed);

                let checkpoint = Checkpoint::new(self.wallet_key.clone(), self.chain_id, seed);
                self.store
                    .set_checkpoint(&checkpoint)
                    .await
                    .context("Failed to persist seeded checkpoint")?;
                checkpoint
            },
        };

        *self.checkpoint.write().await = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Compares the ledger with on-chain balances. Never writes the ledger:
    /// mismatches are logged and published as anomalies.
    pub async fn reconcile_balances(&self) -> anyhow::Result<ReconcileReport> {
        let ledger = self.aggregator.snapshot().await;
        let fee_data = retry_with_backoff(
            &self.policy,
            "fee data",
            || self.chain.get_fee_data(),
            ChainError::retry_action,
        )
        .await
        .context("Failed to fetch fee data")?;

        let mut report = ReconcileReport::default();
        for address in &self.tokens {
            let token = self.token_fetcher.get(*address).await?;
            let label = format!("balanceOf {} {}", token.symbol, self.wallet_key);
            let chain_balance = retry_with_backoff(
                &self.policy,
                &label,
                || self.chain.balance_of(*address, self.wallet),
                ChainError::retry_action,
            )
            .await
            .with_context(|| format!("Failed to fetch {} balance", token.symbol))?;

            let ledger_balance = ledger
                .tokens
                .get(&token.ledger_key())
                .map(|t| t.current_balance.clone())
                .unwrap_or_default();
            let chain_value = u256_to_bigint(chain_balance);

            if chain_value != ledger_balance {
                error!(
                    "ANOMALY: {} balance of {} is {} on chain but {} in the ledger",
                    token.symbol,
                    self.wallet_key,
                    format_units(&chain_value, token.decimals),
                    format_units(&ledger_balance, token.decimals)
                );
                report.anomalies += 1;
                self.bus.publish(LedgerEvent::BalanceAnomaly {
                    wallet_address: self.wallet_key.clone(),
                    token_contract: token.address.clone(),
                    symbol: token.symbol.clone(),
                    difference: &chain_value - &ledger_balance,
                    ledger_balance,
                    chain_balance,
                });
            }

            report.balances.push(TokenBalance {
                token_contract: token.address.clone(),
                symbol: token.symbol.clone(),
                balance: chain_balance,
                balance_formatted: u256_to_f64(chain_balance, token.decimals),
            });
        }

        self.bus.publish(LedgerEvent::StatsRefreshed {
            wallet_address: self.wallet_key.clone(),
            fee_data,
            balances: report.balances.clone(),
        });
        *self.last_reconciled_at.write().await = Some(Utc::now());

        Ok(report)
    }

    /// Replays all stored transactions and compares the result with the live
    /// ledger. Returns the discrepancies, each already logged.
    pub async fn audit_ledger(&self) -> anyhow::Result<Vec<String>> {
        // Between storing a transaction and aggregating it the two differ
        let _cycle = self.cycle_lock.lock().await;

        let live = self.aggregator.snapshot().await;
        let recomputed = self.aggregator.recompute().await?;
        let discrepancies = live.discrepancies(&recomputed);

        for d in &discrepancies {
            error!("ANOMALY: ledger audit for {}: {}", self.wallet_key, d);
        }
        Ok(discrepancies)
    }

    /// One ingestion cycle followed by a balance reconciliation.
    pub async fn sync_now(&self) -> anyhow::Result<(CycleOutcome, ReconcileReport)> {
        let outcome = self.run_cycle(&CancellationToken::new()).await?;
        let reconcile = self.reconcile_balances().await?;
        Ok((outcome, reconcile))
    }

    pub async fn status(&self) -> MonitorStatus {
        MonitorStatus {
            running: self.running.load(Ordering::SeqCst),
            state: *self.state.borrow(),
            wallet_address: self.wallet_key.clone(),
            chain_id: self.chain_id,
            last_processed_block: self
                .checkpoint
                .read()
                .await
                .as_ref()
                .map(|c| c.last_processed_block),
            poll_interval_secs: self.settings.poll_interval_secs,
            last_cycle_at: *self.last_cycle_at.read().await,
            last_reconciled_at: *self.last_reconciled_at.read().await,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    pub fn aggregator(&self) -> &LedgerAggregator {
        &self.aggregator
    }

    fn set_state(&self, state: PollerState) {
        self.state.send_replace(state);
    }
}

/// Sub-ledgers are keyed by symbol, so two tracked contracts sharing one would
/// merge their totals.
fn ensure_distinct_ledger_keys(tokens: &[Token]) -> anyhow::Result<()> {
    let mut seen: FxHashMap<String, &str> = FxHashMap::default();
    for token in tokens {
        if let Some(other) = seen.insert(token.ledger_key(), &token.address) {
            bail!(
                "Tracked tokens {} and {} share the ledger key {}",
                other,
                token.address,
                token.ledger_key()
            );
        }
    }
    Ok(())
}
