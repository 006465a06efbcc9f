use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Inclusive block range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "empty block range [{}, {}]", start, end);
        Self { start, end }
    }

    pub fn block_count(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Suggested-range formats seen in provider errors, with the radix of their numbers:
/// - "retry with the range 33772881-33773212"
/// - "... 0x2034f51-0x2035098 ..."
/// - "this block range should work: [0x2034f51, 0x2035098]"
const SUGGESTION_PATTERNS: [(&str, u32); 3] = [
    (r"retry with the range (\d+)-(\d+)", 10),
    (r"0x([0-9a-fA-F]+)-0x([0-9a-fA-F]+)", 16),
    (r"\[0x([0-9a-fA-F]+),\s*0x([0-9a-fA-F]+)\]", 16),
];

static SUGGESTION_REGEXES: Lazy<Vec<(Regex, u32)>> = Lazy::new(|| {
    SUGGESTION_PATTERNS
        .iter()
        .filter_map(|(pattern, radix)| Regex::new(pattern).ok().map(|re| (re, *radix)))
        .collect()
});

/// Extracts a provider-suggested `(start, end)` block range from error text.
pub fn parse_suggested_range(message: &str) -> Option<(u64, u64)> {
    for (re, radix) in SUGGESTION_REGEXES.iter() {
        let Some(caps) = re.captures(message) else {
            continue;
        };
        // Numbers that overflow u64 fall through to the next format
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(&caps[1], *radix),
            u64::from_str_radix(&caps[2], *radix),
        ) else {
            continue;
        };
        if start <= end {
            return Some((start, end));
        }
    }

    None
}

/// Splits block ranges into provider-friendly chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPlanner {
    max_chunk_size: Option<u64>,
}

impl ChunkPlanner {
    pub fn new(max_chunk_size: Option<u64>) -> Self {
        Self { max_chunk_size }
    }

    /// Base chunk size for a range spanning `span` blocks.
    /// Larger ranges get smaller chunks to stay under per-query log limits.
    pub fn chunk_size(&self, span: u64) -> u64 {
        let tiered = if span > 1_000 {
            50
        } else if span > 500 {
            100
        } else if span > 200 {
            150
        } else {
            100
        };

        match self.max_chunk_size {
            Some(max) => tiered.min(max).max(1),
            None => tiered,
        }
    }

    /// Contiguous, non-overlapping chunks covering exactly `range`.
    pub fn plan(&self, range: BlockRange) -> Vec<BlockRange> {
        let size = self.chunk_size(range.end - range.start);
        let mut chunks = Vec::with_capacity((range.block_count() / size + 1) as usize);

        let mut current = range.start;
        loop {
            let end = current.saturating_add(size - 1).min(range.end);
            chunks.push(BlockRange::new(current, end));
            if end == range.end {
                break;
            }
            current = end + 1;
        }

        chunks
    }

    /// Replacement for a range the provider rejected: a narrower head starting
    /// at `range.start`, and the remainder. Uses the provider's suggestion when
    /// it yields a proper prefix, otherwise bisects. `None` for a single block.
    pub fn narrow(&self, range: BlockRange, error_message: &str) -> Option<(BlockRange, BlockRange)> {
        if range.start == range.end {
            return None;
        }

        let head_end = parse_suggested_range(error_message)
            .map(|(_, end)| end)
            .filter(|end| *end >= range.start && *end < range.end)
            .unwrap_or_else(|| range.start + range.block_count() / 2 - 1);

        Some((
            BlockRange::new(range.start, head_end),
            BlockRange::new(head_end + 1, range.end),
        ))
    }
}
