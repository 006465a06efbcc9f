use alloy::primitives::U256;
use log::debug;
use num_bigint::BigInt;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::chain::FeeData;
use crate::db::models::{IngestionGap, Transaction, WalletLedger};
use crate::utils::{bigint_string, u256_string};

/// Authoritative on-chain balance of one tracked token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenBalance {
    pub token_contract: String,
    pub symbol: String,
    #[serde(with = "u256_string")]
    pub balance: U256,
    pub balance_formatted: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    NewTransaction {
        transaction: Box<Transaction>,
    },
    /// Summary of one ingestion cycle that stored at least one transaction
    NewTransactions {
        wallet_address: String,
        count: usize,
        latest_block: u64,
    },
    LedgerUpdated {
        ledger: Box<WalletLedger>,
    },
    StatsRefreshed {
        wallet_address: String,
        fee_data: FeeData,
        balances: Vec<TokenBalance>,
    },
    BalanceAnomaly {
        wallet_address: String,
        token_contract: String,
        symbol: String,
        #[serde(with = "bigint_string")]
        ledger_balance: BigInt,
        #[serde(with = "u256_string")]
        chain_balance: U256,
        /// chain - ledger
        #[serde(with = "bigint_string")]
        difference: BigInt,
    },
    GapDetected {
        gap: IngestionGap,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::NewTransaction { .. } => "new_transaction",
            LedgerEvent::NewTransactions { .. } => "new_transactions",
            LedgerEvent::LedgerUpdated { .. } => "ledger_updated",
            LedgerEvent::StatsRefreshed { .. } => "stats_refreshed",
            LedgerEvent::BalanceAnomaly { .. } => "balance_anomaly",
            LedgerEvent::GapDetected { .. } => "gap_detected",
        }
    }

    pub fn wallet_address(&self) -> &str {
        match self {
            LedgerEvent::NewTransaction { transaction } => &transaction.wallet_address,
            LedgerEvent::LedgerUpdated { ledger } => &ledger.wallet_address,
            LedgerEvent::GapDetected { gap } => &gap.wallet_address,
            LedgerEvent::NewTransactions { wallet_address, .. }
            | LedgerEvent::StatsRefreshed { wallet_address, .. }
            | LedgerEvent::BalanceAnomaly { wallet_address, .. } => wallet_address,
        }
    }
}

/// In-process broadcast channel of [`LedgerEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fire-and-forget. Having no subscribers is not an error.
    pub fn publish(&self, event: LedgerEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            debug!("No subscribers for {} event", kind);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::WALLET;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(LedgerEvent::NewTransactions {
            wallet_address: WALLET.to_string(),
            count: 1,
            latest_block: 10,
        });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(LedgerEvent::NewTransactions {
            wallet_address: WALLET.to_string(),
            count: 2,
            latest_block: 105,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "new_transactions");
        assert_eq!(event.wallet_address(), WALLET);
    }

    #[test]
    fn test_event_json_is_tagged_and_exact() {
        let event = LedgerEvent::BalanceAnomaly {
            wallet_address: WALLET.to_string(),
            token_contract: "0xabc".to_string(),
            symbol: "TKA".to_string(),
            ledger_balance: BigInt::from(-5),
            chain_balance: U256::from(10u64).pow(U256::from(30)),
            difference: BigInt::from(10u64).pow(30) + 5,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "balance_anomaly");
        assert_eq!(json["ledger_balance"], "-5");
        assert_eq!(json["chain_balance"], "1000000000000000000000000000000");
    }
}
