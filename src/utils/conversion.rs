//! Type conversion and formatting utilities.
//!
//! Functions for converting between the on-chain integer types (U256) and the
//! arbitrary-precision integers used by the ledger, plus the display-only
//! floating point projections.

use alloy::primitives::{hex, Address, U256};
use bigdecimal::BigDecimal;
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{ToPrimitive, Zero};
use once_cell::sync::Lazy;

// ============================================
// Hex Encoding
// ============================================

/// Encode bytes as a lowercase hex string with 0x prefix.
pub fn hex_encode(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Canonical (lowercase, 0x-prefixed) form of an address.
///
/// Every comparison and every key built from an address goes through this.
pub fn normalize_address(address: &Address) -> String {
    hex_encode(address.as_slice())
}

// ============================================
// Integer Conversions
// ============================================

/// Convert alloy U256 to a non-negative BigInt.
pub fn u256_to_bigint(value: U256) -> BigInt {
    let bytes: [u8; 32] = value.to_le_bytes();
    BigInt::from_bytes_le(Sign::Plus, &bytes)
}

// ============================================
// Display Projections
// ============================================

/// Convert U256 to f64 with decimal adjustment using BigDecimal for precision.
///
/// Display only. The result must never be fed back into ledger arithmetic.
///
/// # Example
/// ```ignore
/// let value = U256::from(1_000_000_000_000_000_000u128); // 1e18
/// let adjusted = u256_to_f64(value, 18); // Returns 1.0
/// ```
pub fn u256_to_f64(value: U256, decimals: u8) -> f64 {
    bigint_to_f64(&u256_to_bigint(value), decimals)
}

/// Convert a (possibly negative) BigInt to f64 with decimal adjustment.
///
/// Returns 0.0 when the value cannot be represented as a finite f64.
pub fn bigint_to_f64(value: &BigInt, decimals: u8) -> f64 {
    let adjusted = BigDecimal::from(value.clone()) / big_pow10(decimals);

    match adjusted.to_f64() {
        Some(result) if result.is_finite() => result,
        _ => 0.0,
    }
}

/// Exact decimal string of `value / 10^decimals` (e.g. "600" or "-0.25").
pub fn format_units(value: &BigInt, decimals: u8) -> String {
    let divisor = BigUint::from(10u32).pow(decimals as u32);
    let magnitude = value.magnitude();
    let whole = magnitude / &divisor;
    let fraction = magnitude % &divisor;
    let sign = if value.sign() == Sign::Minus { "-" } else { "" };

    if fraction.is_zero() {
        return format!("{}{}", sign, whole);
    }

    let fraction = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    format!("{}{}.{}", sign, whole, fraction.trim_end_matches('0'))
}

// ============================================
// Serde Helpers
// ============================================

/// Serialize a `BigInt` as a decimal string.
///
/// Large ledger totals overflow JSON numbers, and a string keeps them exact in
/// both PostgreSQL JSONB and pub/sub payloads.
pub mod bigint_string {
    use std::str::FromStr;

    use num_bigint::BigInt;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BigInt::from_str(&raw).map_err(D::Error::custom)
    }
}

/// Serialize a `U256` as a decimal string (alloy's default is hex).
pub mod u256_string {
    use std::str::FromStr;

    use alloy::primitives::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_str(&raw).map_err(D::Error::custom)
    }
}

// ============================================
// Internal Helpers
// ============================================

static POW10_CACHE: Lazy<[BigDecimal; 37]> =
    Lazy::new(|| std::array::from_fn(|i| BigDecimal::from(BigInt::from(10u32).pow(i as u32))));

/// Compute 10^exp as BigDecimal.
pub(crate) fn big_pow10(exp: u8) -> BigDecimal {
    if (exp as usize) < POW10_CACHE.len() {
        POW10_CACHE[exp as usize].clone()
    } else {
        BigDecimal::from(BigInt::from(10u32).pow(exp as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_normalize_address_is_lowercase() {
        let address = Address::from_str("0x8Ba1f109551bD432803012645Ac136ddd64DBA72").unwrap();
        assert_eq!(
            normalize_address(&address),
            "0x8ba1f109551bd432803012645ac136ddd64dba72"
        );
    }

    #[test]
    fn test_u256_to_bigint_preserves_max_value() {
        let big = u256_to_bigint(U256::MAX);
        assert_eq!(big.to_string(), U256::MAX.to_string());
    }

    #[test]
    fn test_display_projection() {
        let value = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(u256_to_f64(value, 18), 1.5);
        assert_eq!(bigint_to_f64(&BigInt::from(-250), 3), -0.25);
    }

    #[test]
    fn test_format_units_is_exact() {
        let value = BigInt::from_str("600000000000000000000").unwrap();
        assert_eq!(format_units(&value, 18), "600");
        assert_eq!(format_units(&BigInt::from(-25), 2), "-0.25");
        assert_eq!(format_units(&BigInt::from(0), 18), "0");
        assert_eq!(format_units(&BigInt::from(7), 0), "7");
    }
}
