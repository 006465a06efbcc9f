pub mod aggregator;
pub mod fetcher;
pub mod materializer;
pub mod monitor;
pub mod planner;
pub mod token_fetcher;

pub use aggregator::LedgerAggregator;
pub use fetcher::{decode_transfer, ChunkFetch, FetchFailure, TransferEvent, TransferFetcher};
pub use materializer::{MaterializeError, TransactionMaterializer};
pub use monitor::{CycleOutcome, CycleReport, Monitor, MonitorStatus, PollerState, ReconcileReport};
pub use planner::{parse_suggested_range, BlockRange, ChunkPlanner};
pub use token_fetcher::TokenFetcher;
