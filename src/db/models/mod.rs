pub mod checkpoint;
pub mod gap;
pub mod ledger;
pub mod token;
pub mod transaction;

pub use checkpoint::Checkpoint;
pub use gap::IngestionGap;
pub use ledger::{DailyStat, DailyTokenStat, TokenLedger, WalletLedger};
pub use token::Token;
pub use transaction::{FeeType, Transaction, TransactionKey, TransactionStatus, TransactionType};
