pub mod abis;
pub mod chain;
pub mod config;
pub mod cron;
pub mod db;
pub mod pubsub;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use config::Settings;
pub use cron::CronScheduler;
pub use db::{open_store, LedgerStore};
pub use pubsub::{EventBus, LedgerEvent, RedpandaPublisher};
pub use worker::Monitor;
