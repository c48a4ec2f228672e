//! Compile pipeline for folding stored events into positions, effects and errors.
//!
//! This module provides:
//! - Per-partition watermarks so a rebuild resumes after the last folded event
//! - Forced wallet rebuilds when the mapping snapshot version changes
//! - One transaction per wallet for positions, effects, watermarks and errors

use crate::domain::{EventOrderingKey, TimeMs};
use crate::engine::PartitionKey;
use serde::{Deserialize, Serialize};

pub mod incremental;

pub use incremental::{CompileError, CompileReport, Compiler};

/// Resume point of one partition.
///
/// Events at or before `last` are already folded into the stored position. The watermark is
/// only valid for the mapping snapshot it was folded under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldWatermark {
    pub partition: PartitionKey,
    pub last: EventOrderingKey,
    pub mapping_version: i64,
}

impl FoldWatermark {
    /// Mapping version written over a wallet's watermarks when one of its stored events is
    /// rewritten. No snapshot carries it, so the next compile rebuilds the wallet.
    pub const INVALIDATED: i64 = -1;

    pub fn new(partition: PartitionKey, last: EventOrderingKey, mapping_version: i64) -> Self {
        Self {
            partition,
            last,
            mapping_version,
        }
    }

    pub fn last_time_ms(&self) -> TimeMs {
        self.last.time_ms
    }

    /// True when the watermark was produced under a different snapshot.
    pub fn is_stale(&self, mapping_version: i64) -> bool {
        self.mapping_version != mapping_version
    }

    /// True when `key` would already have been folded.
    pub fn covers(&self, key: &EventOrderingKey) -> bool {
        *key <= self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, ConditionId, EventKey, TxHash};

    fn watermark(time: i64, version: i64) -> FoldWatermark {
        FoldWatermark::new(
            PartitionKey::new(Address::new("0xa"), ConditionId::new("0xc"), 0),
            EventOrderingKey::new(TimeMs::new(time), &EventKey::new(TxHash::new("0x5"), 2)),
            version,
        )
    }

    #[test]
    fn test_watermark_covers_earlier_and_equal_keys() {
        let w = watermark(1000, 1);
        let equal = EventOrderingKey::new(TimeMs::new(1000), &EventKey::new(TxHash::new("0x5"), 2));
        let later_log =
            EventOrderingKey::new(TimeMs::new(1000), &EventKey::new(TxHash::new("0x5"), 3));
        let earlier = EventOrderingKey::new(TimeMs::new(999), &EventKey::new(TxHash::new("0xf"), 9));

        assert!(w.covers(&equal));
        assert!(w.covers(&earlier));
        assert!(!w.covers(&later_log));
        assert_eq!(w.last_time_ms(), TimeMs::new(1000));
    }

    #[test]
    fn test_watermark_stale_on_version_change() {
        let w = watermark(1000, 3);
        assert!(!w.is_stale(3));
        assert!(w.is_stale(4));
    }

    #[test]
    fn test_invalidated_watermark_is_always_stale() {
        let w = watermark(1000, FoldWatermark::INVALIDATED);
        assert!(w.is_stale(0));
        assert!(w.is_stale(1));
    }
}
