use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use num_bigint::BigInt;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use super::transaction::Transaction;
use crate::utils::{bigint_string, bigint_to_f64};

/// Running totals for one token held by the tracked wallet.
///
/// The `BigInt` fields are authoritative. The `*_formatted` fields are display
/// mirrors, always recomputed from the integers and never accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLedger {
    pub token_contract: String,
    pub symbol: String,
    pub decimals: u8,

    #[serde(with = "bigint_string")]
    pub total_received: BigInt,
    #[serde(with = "bigint_string")]
    pub total_sent: BigInt,
    /// `total_received - total_sent`. May go negative when a transfer was
    /// missed; that is a data gap to surface, not a value to clamp.
    #[serde(with = "bigint_string")]
    pub current_balance: BigInt,
    #[serde(with = "bigint_string")]
    pub total_fees_collected: BigInt,

    pub transaction_count: u64,
    pub fee_collection_count: u64,

    pub total_received_formatted: f64,
    pub total_sent_formatted: f64,
    pub current_balance_formatted: f64,
    pub total_fees_collected_formatted: f64,
    /// Mean fee collection in display units, zero before the first one.
    #[serde(default)]
    pub average_fee_size: f64,

    pub first_activity_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl TokenLedger {
    pub fn new(token_contract: String, symbol: String, decimals: u8) -> Self {
        Self {
            token_contract,
            symbol,
            decimals,
            total_received: BigInt::zero(),
            total_sent: BigInt::zero(),
            current_balance: BigInt::zero(),
            total_fees_collected: BigInt::zero(),
            transaction_count: 0,
            fee_collection_count: 0,
            total_received_formatted: 0.0,
            total_sent_formatted: 0.0,
            current_balance_formatted: 0.0,
            total_fees_collected_formatted: 0.0,
            average_fee_size: 0.0,
            first_activity_at: None,
            last_activity_at: None,
        }
    }

    fn refresh_formatted(&mut self) {
        self.total_received_formatted = bigint_to_f64(&self.total_received, self.decimals);
        self.total_sent_formatted = bigint_to_f64(&self.total_sent, self.decimals);
        self.current_balance_formatted = bigint_to_f64(&self.current_balance, self.decimals);
        self.total_fees_collected_formatted =
            bigint_to_f64(&self.total_fees_collected, self.decimals);
        self.average_fee_size = if self.fee_collection_count == 0 {
            0.0
        } else {
            self.total_fees_collected_formatted / self.fee_collection_count as f64
        };
    }

    pub fn is_consistent(&self) -> bool {
        self.current_balance == &self.total_received - &self.total_sent
    }
}

/// Per-token counters inside one day bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyTokenStat {
    pub transfer_count: u64,
    pub fee_collection_count: u64,
    #[serde(with = "bigint_string")]
    pub fees_collected: BigInt,
    pub fees_collected_formatted: f64,
}

/// Activity of one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub tokens: BTreeMap<String, DailyTokenStat>,
}

impl DailyStat {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            tokens: BTreeMap::new(),
        }
    }

    pub fn transfer_count(&self) -> u64 {
        self.tokens.values().map(|t| t.transfer_count).sum()
    }
}

/// Aggregated history of the tracked wallet (PostgreSQL JSONB document).
///
/// Primary Key: wallet_address
/// Mutated exactly once per newly stored [`Transaction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletLedger {
    pub wallet_address: String,
    pub total_transactions: u64,
    pub total_fee_collections: u64,
    /// Sub-ledgers keyed by token symbol (contract address when the token has none)
    pub tokens: BTreeMap<String, TokenLedger>,
    pub daily_stats: BTreeMap<NaiveDate, DailyStat>,
    pub first_transaction_at: Option<DateTime<Utc>>,
    pub last_transaction_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_fee_collection_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_fee_collection_at: Option<DateTime<Utc>>,

    /// Sum of `gas_used` over every applied transfer
    #[serde(default)]
    pub total_gas_used: u64,
    #[serde(default)]
    pub average_transaction_gas: f64,
    /// Mean time between consecutive fee collections, in minutes
    #[serde(default)]
    pub average_collection_interval: f64,

    pub updated_at: DateTime<Utc>,
}

impl WalletLedger {
    pub fn new(wallet_address: String) -> Self {
        Self {
            wallet_address: wallet_address.to_lowercase(),
            total_transactions: 0,
            total_fee_collections: 0,
            tokens: BTreeMap::new(),
            daily_stats: BTreeMap::new(),
            first_transaction_at: None,
            last_transaction_at: None,
            first_fee_collection_at: None,
            last_fee_collection_at: None,
            total_gas_used: 0,
            average_transaction_gas: 0.0,
            average_collection_interval: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Sub-ledger key of a transaction's token.
    pub fn token_key(tx: &Transaction) -> String {
        if tx.token_symbol.trim().is_empty() {
            tx.token_contract.clone()
        } else {
            tx.token_symbol.clone()
        }
    }

    /// Folds one transaction into the ledger.
    ///
    /// Direction is taken from the addresses, not from the classification tag,
    /// so a self-transfer adds to both totals and leaves the balance unchanged.
    pub fn apply(&mut self, tx: &Transaction) {
        let wallet = self.wallet_address.clone();
        let value = tx.raw_value();
        let key = Self::token_key(tx);

        let token = self.tokens.entry(key.clone()).or_insert_with(|| {
            TokenLedger::new(tx.token_contract.clone(), tx.token_symbol.clone(), tx.token_decimals)
        });

        if tx.is_incoming_for(&wallet) {
            token.total_received += &value;
            token.current_balance += &value;
        }
        if tx.is_outgoing_for(&wallet) {
            token.total_sent += &value;
            token.current_balance -= &value;
        }
        if tx.is_fee_collection {
            token.fee_collection_count += 1;
            token.total_fees_collected += &value;
        }
        token.transaction_count += 1;
        token.first_activity_at = earliest(token.first_activity_at, tx.timestamp);
        token.last_activity_at = latest(token.last_activity_at, tx.timestamp);
        token.refresh_formatted();

        let decimals = token.decimals;
        let date = tx.timestamp.date_naive();
        let day = self
            .daily_stats
            .entry(date)
            .or_insert_with(|| DailyStat::new(date));
        let stat = day.tokens.entry(key).or_default();
        stat.transfer_count += 1;
        if tx.is_fee_collection {
            stat.fee_collection_count += 1;
            stat.fees_collected += &value;
            stat.fees_collected_formatted = bigint_to_f64(&stat.fees_collected, decimals);
        }

        self.total_transactions += 1;
        self.total_gas_used = self.total_gas_used.saturating_add(tx.gas_used);
        if tx.is_fee_collection {
            self.total_fee_collections += 1;
            self.first_fee_collection_at = earliest(self.first_fee_collection_at, tx.timestamp);
            self.last_fee_collection_at = latest(self.last_fee_collection_at, tx.timestamp);
        }
        self.first_transaction_at = earliest(self.first_transaction_at, tx.timestamp);
        self.last_transaction_at = latest(self.last_transaction_at, tx.timestamp);
        self.refresh_averages();
        self.updated_at = Utc::now();
    }

    /// Re-derives the wallet-wide averages from the running totals, so the
    /// result does not depend on application order.
    fn refresh_averages(&mut self) {
        self.average_transaction_gas = if self.total_transactions == 0 {
            0.0
        } else {
            self.total_gas_used as f64 / self.total_transactions as f64
        };

        // Consecutive gaps telescope, so their mean is the overall span over n - 1
        self.average_collection_interval =
            match (self.first_fee_collection_at, self.last_fee_collection_at) {
                (Some(first), Some(last)) if self.total_fee_collections > 1 => {
                    let span_secs = (last - first).num_seconds() as f64;
                    span_secs / 60.0 / (self.total_fee_collections - 1) as f64
                }
                _ => 0.0,
            };
    }

    /// Builds a fresh ledger from stored transactions, sorted by
    /// (timestamp, block, transaction index, log index) before replay.
    pub fn recompute(wallet_address: &str, transactions: &[Transaction]) -> Self {
        let mut ordered: Vec<&Transaction> = transactions.iter().collect();
        ordered.sort_by(|a, b| {
            (a.timestamp, a.block_number, a.transaction_index, a.log_index).cmp(&(
                b.timestamp,
                b.block_number,
                b.transaction_index,
                b.log_index,
            ))
        });

        let mut ledger = Self::new(wallet_address.to_string());
        for tx in ordered {
            ledger.apply(tx);
        }
        ledger
    }

    /// Sub-ledgers whose balance no longer equals received minus sent.
    pub fn inconsistent_tokens(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .filter(|(_, t)| !t.is_consistent())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Human-readable differences between two ledgers, ignoring the formatted
    /// display mirrors and `updated_at`. Empty when they agree.
    pub fn discrepancies(&self, other: &WalletLedger) -> Vec<String> {
        let mut out = Vec::new();

        if self.total_transactions != other.total_transactions {
            out.push(format!(
                "total_transactions {} != {}",
                self.total_transactions, other.total_transactions
            ));
        }
        if self.total_fee_collections != other.total_fee_collections {
            out.push(format!(
                "total_fee_collections {} != {}",
                self.total_fee_collections, other.total_fee_collections
            ));
        }
        if self.total_gas_used != other.total_gas_used
            || self.average_transaction_gas != other.average_transaction_gas
        {
            out.push(format!(
                "transaction gas ({}, {}) != ({}, {})",
                self.total_gas_used,
                self.average_transaction_gas,
                other.total_gas_used,
                other.average_transaction_gas
            ));
        }
        if self.average_collection_interval != other.average_collection_interval {
            out.push(format!(
                "average_collection_interval {} != {}",
                self.average_collection_interval, other.average_collection_interval
            ));
        }

        for (key, mine) in &self.tokens {
            let Some(theirs) = other.tokens.get(key) else {
                out.push(format!("token {} missing from other ledger", key));
                continue;
            };
            if mine.total_received != theirs.total_received {
                out.push(format!(
                    "{} total_received {} != {}",
                    key, mine.total_received, theirs.total_received
                ));
            }
            if mine.total_sent != theirs.total_sent {
                out.push(format!(
                    "{} total_sent {} != {}",
                    key, mine.total_sent, theirs.total_sent
                ));
            }
            if mine.current_balance != theirs.current_balance {
                out.push(format!(
                    "{} current_balance {} != {}",
                    key, mine.current_balance, theirs.current_balance
                ));
            }
            if mine.total_fees_collected != theirs.total_fees_collected {
                out.push(format!(
                    "{} total_fees_collected {} != {}",
                    key, mine.total_fees_collected, theirs.total_fees_collected
                ));
            }
            if mine.transaction_count != theirs.transaction_count
                || mine.fee_collection_count != theirs.fee_collection_count
            {
                out.push(format!(
                    "{} counts ({}, {}) != ({}, {})",
                    key,
                    mine.transaction_count,
                    mine.fee_collection_count,
                    theirs.transaction_count,
                    theirs.fee_collection_count
                ));
            }
            if mine.average_fee_size != theirs.average_fee_size {
                out.push(format!(
                    "{} average_fee_size {} != {}",
                    key, mine.average_fee_size, theirs.average_fee_size
                ));
            }
        }
        for key in other.tokens.keys() {
            if !self.tokens.contains_key(key) {
                out.push(format!("token {} missing from this ledger", key));
            }
        }

        let days = |l: &WalletLedger| -> Vec<(NaiveDate, String, u64, u64, BigInt)> {
            l.daily_stats
                .values()
                .flat_map(|d| {
                    d.tokens.iter().map(move |(k, s)| {
                        (
                            d.date,
                            k.clone(),
                            s.transfer_count,
                            s.fee_collection_count,
                            s.fees_collected.clone(),
                        )
                    })
                })
                .collect()
        };
        if days(self) != days(other) {
            out.push("daily_stats differ".to_string());
        }

        out
    }
}

fn earliest(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

fn latest(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(candidate, |c| c.max(candidate)))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use proptest::prelude::*;
    use proptest::test_runner::{Config as ProptestConfig, TestRunner};

    use super::*;
    use crate::test_utils::{sample_transaction, GAS_USED, OTHER, TOKEN_A, TOKEN_B, WALLET};

    // 12 second blocks
    const BLOCKS_PER_DAY: u64 = 7_200;

    fn units(n: u64) -> BigInt {
        BigInt::from(n) * BigInt::from(10u64).pow(18)
    }

    #[test]
    fn test_receive_then_send_scenario() {
        let incoming = sample_transaction(OTHER, WALLET, units(1000), 100, 0);
        let outgoing = sample_transaction(WALLET, OTHER, units(400), 105, 0);

        let mut ledger = WalletLedger::new(WALLET.to_string());
        ledger.apply(&incoming);
        ledger.apply(&outgoing);

        let token = &ledger.tokens["TKA"];
        assert_eq!(token.token_contract, TOKEN_A);
        assert_eq!(token.total_received, units(1000));
        assert_eq!(token.total_sent, units(400));
        assert_eq!(token.current_balance, units(600));
        assert_eq!(token.current_balance_formatted, 600.0);
        assert_eq!(token.transaction_count, 2);
        assert_eq!(token.fee_collection_count, 1);
        assert_eq!(token.total_fees_collected, units(1000));

        assert_eq!(ledger.total_transactions, 2);
        assert_eq!(ledger.daily_stats.len(), 1);
        let day = ledger.daily_stats.values().next().unwrap();
        assert_eq!(day.transfer_count(), 2);
        assert_eq!(day.tokens["TKA"].transfer_count, 2);
        assert!(ledger.inconsistent_tokens().is_empty());
    }

    #[test]
    fn test_average_metrics_for_receive_then_send() {
        let mut ledger = WalletLedger::new(WALLET.to_string());
        ledger.apply(&sample_transaction(OTHER, WALLET, units(1000), 100, 0));
        ledger.apply(&sample_transaction(WALLET, OTHER, units(400), 105, 0));

        assert_eq!(ledger.tokens["TKA"].average_fee_size, 1000.0);
        assert_eq!(ledger.total_gas_used, 2 * GAS_USED);
        assert_eq!(ledger.average_transaction_gas, GAS_USED as f64);
        // A single fee collection has no interval yet
        assert_eq!(ledger.average_collection_interval, 0.0);

        let rebuilt = WalletLedger::recompute(
            WALLET,
            &[
                sample_transaction(WALLET, OTHER, units(400), 105, 0),
                sample_transaction(OTHER, WALLET, units(1000), 100, 0),
            ],
        );
        assert!(ledger.discrepancies(&rebuilt).is_empty());
        assert_eq!(ledger.tokens, rebuilt.tokens);
    }

    #[test]
    fn test_average_collection_interval_between_two_fees() {
        // Blocks are 12 seconds apart, so 50 blocks is 10 minutes
        let first = sample_transaction(OTHER, WALLET, units(30), 100, 0);
        let second = sample_transaction(OTHER, WALLET, units(10), 150, 0);

        let mut ledger = WalletLedger::new(WALLET.to_string());
        ledger.apply(&second);
        ledger.apply(&first);

        assert_eq!(ledger.first_fee_collection_at, Some(first.timestamp));
        assert_eq!(ledger.last_fee_collection_at, Some(second.timestamp));
        assert_eq!(ledger.average_collection_interval, 10.0);
        assert_eq!(ledger.tokens["TKA"].average_fee_size, 20.0);

        let rebuilt = WalletLedger::recompute(WALLET, &[first, second]);
        assert_eq!(rebuilt.average_collection_interval, 10.0);
        assert!(ledger.discrepancies(&rebuilt).is_empty());
    }

    #[test]
    fn test_discrepancies_include_averages() {
        let mut a = WalletLedger::new(WALLET.to_string());
        a.apply(&sample_transaction(OTHER, WALLET, units(1), 1, 0));
        let mut b = a.clone();
        b.average_collection_interval = 5.0;
        b.tokens.get_mut("TKA").unwrap().average_fee_size = 2.0;

        let diffs = a.discrepancies(&b);
        assert!(diffs.iter().any(|d| d.starts_with("average_collection_interval")));
        assert!(diffs.iter().any(|d| d.contains("TKA average_fee_size")));
    }

    #[test]
    fn test_totals_are_exact_beyond_f64_precision() {
        // 2^64 + 1 and friends lose their low bits in f64
        let a = BigInt::from_str("18446744073709551617").unwrap();
        let b = BigInt::from_str("123456789012345678901234567").unwrap();
        let c = BigInt::from_str("3").unwrap();

        let txs = vec![
            sample_transaction(OTHER, WALLET, a.clone(), 1, 0),
            sample_transaction(OTHER, WALLET, b.clone(), 2, 0),
            sample_transaction(WALLET, OTHER, c.clone(), 3, 0),
        ];

        let mut ledger = WalletLedger::new(WALLET.to_string());
        for tx in &txs {
            ledger.apply(tx);
        }

        let token = &ledger.tokens["TKA"];
        assert_eq!(token.total_received, &a + &b);
        assert_eq!(token.total_sent, c.clone());
        assert_eq!(token.current_balance, &a + &b - &c);
        assert!(token.is_consistent());
    }

    #[test]
    fn test_recompute_matches_incremental_application() {
        let txs = vec![
            sample_transaction(OTHER, WALLET, units(5), 10, 0),
            sample_transaction(WALLET, OTHER, units(2), 11, 1),
            sample_transaction(WALLET, WALLET, units(7), 12, 0),
            sample_transaction(OTHER, WALLET, BigInt::from(1u8), 12, 3),
        ];

        let mut live = WalletLedger::new(WALLET.to_string());
        for tx in &txs {
            live.apply(tx);
        }

        // Replay input order must not matter
        let mut shuffled = txs.clone();
        shuffled.reverse();
        let rebuilt = WalletLedger::recompute(WALLET, &shuffled);

        assert!(live.discrepancies(&rebuilt).is_empty());
        assert_eq!(live.tokens, rebuilt.tokens);
        assert_eq!(live.daily_stats, rebuilt.daily_stats);
    }

    #[test]
    fn test_batched_application_matches_recompute_across_tokens_and_days() {
        let mut runner = TestRunner::new(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        });

        // (token, direction, raw value, day)
        let entry = (0usize..2, 0u8..3, any::<u128>(), 0u64..5);
        let strategy = (prop::collection::vec(entry, 1..40), 1usize..6);

        let result = runner.run(&strategy, |(entries, batches)| {
            let txs: Vec<Transaction> = entries
                .iter()
                .enumerate()
                .map(|(i, &(token, direction, value, day))| {
                    let (from, to) = match direction {
                        0 => (OTHER, WALLET),
                        1 => (WALLET, OTHER),
                        _ => (WALLET, WALLET),
                    };
                    let block = day * BLOCKS_PER_DAY + i as u64;
                    let mut tx = sample_transaction(from, to, BigInt::from(value), block, i as u64);
                    if token == 1 {
                        tx.token_contract = TOKEN_B.to_string();
                        tx.token_symbol = "TKB".to_string();
                        tx.token_name = "Token B".to_string();
                        tx.token_decimals = 6;
                    }
                    tx
                })
                .collect();

            let batch_len = txs.len().div_ceil(batches);
            let mut live = WalletLedger::new(WALLET.to_string());
            let mut applied = 0;
            for batch in txs.chunks(batch_len) {
                for tx in batch {
                    live.apply(tx);
                }
                applied += batch.len();

                let rebuilt = WalletLedger::recompute(WALLET, &txs[..applied]);
                let diffs = live.discrepancies(&rebuilt);
                prop_assert!(diffs.is_empty(), "after {} transfers: {:?}", applied, diffs);
                prop_assert_eq!(&live.tokens, &rebuilt.tokens);
                prop_assert_eq!(&live.daily_stats, &rebuilt.daily_stats);
            }

            for (symbol, contract) in [("TKA", TOKEN_A), ("TKB", TOKEN_B)] {
                let mut received = BigInt::zero();
                let mut sent = BigInt::zero();
                for tx in txs.iter().filter(|tx| tx.token_contract == contract) {
                    if tx.to_address == WALLET {
                        received += tx.raw_value();
                    }
                    if tx.from_address == WALLET {
                        sent += tx.raw_value();
                    }
                }
                match live.tokens.get(symbol) {
                    Some(token) => {
                        prop_assert_eq!(&token.total_received, &received);
                        prop_assert_eq!(&token.total_sent, &sent);
                        prop_assert_eq!(&token.current_balance, &(&received - &sent));
                    }
                    None => prop_assert!(received.is_zero() && sent.is_zero()),
                }
            }
            Ok(())
        });

        if let Err(err) = result {
            panic!("batched ledger application diverged: {err}");
        }
    }

    #[test]
    fn test_negative_balance_is_kept() {
        let mut ledger = WalletLedger::new(WALLET.to_string());
        ledger.apply(&sample_transaction(WALLET, OTHER, units(3), 50, 0));

        let token = &ledger.tokens["TKA"];
        assert_eq!(token.current_balance, -units(3));
        assert_eq!(token.current_balance_formatted, -3.0);
        assert!(token.is_consistent());
    }

    #[test]
    fn test_self_transfer_leaves_balance_unchanged() {
        let mut ledger = WalletLedger::new(WALLET.to_string());
        ledger.apply(&sample_transaction(WALLET, WALLET, units(9), 50, 0));

        let token = &ledger.tokens["TKA"];
        assert_eq!(token.total_received, units(9));
        assert_eq!(token.total_sent, units(9));
        assert!(token.current_balance.is_zero());
    }

    #[test]
    fn test_activity_timestamps_use_comparison() {
        let later = sample_transaction(OTHER, WALLET, units(1), 200, 0);
        let earlier = sample_transaction(OTHER, WALLET, units(1), 100, 0);

        let mut ledger = WalletLedger::new(WALLET.to_string());
        ledger.apply(&later);
        ledger.apply(&earlier);

        assert_eq!(ledger.first_transaction_at, Some(earlier.timestamp));
        assert_eq!(ledger.last_transaction_at, Some(later.timestamp));
    }

    #[test]
    fn test_discrepancies_report_differences() {
        let mut a = WalletLedger::new(WALLET.to_string());
        a.apply(&sample_transaction(OTHER, WALLET, units(1), 1, 0));
        let b = WalletLedger::new(WALLET.to_string());

        let diffs = a.discrepancies(&b);
        assert!(diffs.iter().any(|d| d.starts_with("total_transactions")));
        assert!(diffs.iter().any(|d| d.contains("TKA")));
    }

    #[test]
    fn test_ledger_survives_json_round_trip() {
        let mut ledger = WalletLedger::new(WALLET.to_string());
        ledger.apply(&sample_transaction(OTHER, WALLET, units(1000), 1, 0));

        let json = serde_json::to_string(&ledger).unwrap();
        assert!(json.contains("\"1000000000000000000000\""));
        let back: WalletLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ledger);
    }
}
