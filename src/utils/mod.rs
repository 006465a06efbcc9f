//! Utility functions for the feewatch monitor.
//!
//! - [`conversion`] - Type conversions (U256, BigInt, f64, hex encoding, serde helpers)
//! - [`retry`] - Bounded retry with exponential backoff and error classification

pub mod conversion;
pub mod retry;

// ============================================
// Re-exports
// ============================================

pub use conversion::{
    bigint_string, bigint_to_f64, format_units, hex_encode, normalize_address, u256_string,
    u256_to_bigint, u256_to_f64,
};
pub use retry::{retry_with_backoff, RetryAction, RetryPolicy};
