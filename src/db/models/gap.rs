use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A block range whose logs could not be fetched (PostgreSQL).
///
/// Primary Key: (wallet_address, chain_id, from_block)
///
/// Repeated failures from the same start block count as further attempts on
/// one gap, whose `to_block` widens to the furthest failed block.
///
/// While a gap is open the checkpoint stays below `from_block`, so the range
/// is retried on every cycle. A gap becomes `permanent` once it has failed
/// often enough that the operator chose to skip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionGap {
    pub wallet_address: String,
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: u64,
    pub reason: String,
    pub attempts: u32,
    pub permanent: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl IngestionGap {
    pub fn new(
        wallet_address: String,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
        reason: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            wallet_address: wallet_address.to_lowercase(),
            chain_id,
            from_block,
            to_block,
            reason,
            attempts: 1,
            permanent: false,
            first_seen_at: now,
            last_attempt_at: now,
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn block_count(&self) -> u64 {
        self.to_block.saturating_sub(self.from_block) + 1
    }
}
