//! Durable contiguous identifier blocks and their placement rules.
//!
//! A block is a reserved interval of identifier values owned by one process
//! at a time. `last_committed` is the watermark: the highest value of the
//! block confirmed, in contiguous order, as durably used. A freshly created
//! block has `last_committed == first_value - 1`; a block whose watermark
//! has reached `last_value` is full and is never handed out again.
//!
//! # Placement
//!
//! A category's next block starts right after the highest existing block,
//! except when a non-zero interleave interval is configured. The interval
//! partitions the identifier space (offset from the configured start value)
//! into stripes: a block never crosses a stripe boundary (it is truncated to
//! the stripe's remainder), and a block that would begin exactly on a
//! boundary skips one whole stripe instead. Alternating stripes therefore
//! stay free for other sequences sharing the same boundary.

use crate::range::MonotonicRange;
use std::time::SystemTime;
use thiserror::Error;

/// Rejected block configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitializationError {
    /// The block size must be at least 1.
    #[error("block size must be at least 1")]
    InvalidBlockSize,

    /// The start value of a category must be non-negative.
    #[error("block start value must be non-negative, got {0}")]
    InvalidStartValue(i64),

    /// Blocks must fit inside one interleave stripe.
    #[error("block size {size} exceeds interleave interval {interval}")]
    SizeExceedsInterval {
        /// Configured block size.
        size: u64,
        /// Configured interleave interval.
        interval: u64,
    },

    /// No parameters are configured for the category.
    #[error("block parameters not configured for category: {0}")]
    MissingParameters(String),
}

/// Validated per-category block placement parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockParameters {
    block_size: u64,
    block_start_value: i64,
    next_block_interval: u64,
}

impl BlockParameters {
    /// Validate and build parameters.
    ///
    /// `next_block_interval == 0` disables interleaving; otherwise the
    /// block size must fit inside one stripe.
    pub fn new(
        block_size: u64,
        block_start_value: i64,
        next_block_interval: u64,
    ) -> Result<Self, InitializationError> {
        if block_size == 0 {
            return Err(InitializationError::InvalidBlockSize);
        }
        if block_start_value < 0 {
            return Err(InitializationError::InvalidStartValue(block_start_value));
        }
        if next_block_interval != 0 && block_size > next_block_interval {
            return Err(InitializationError::SizeExceedsInterval {
                size: block_size,
                interval: next_block_interval,
            });
        }
        Ok(Self {
            block_size,
            block_start_value,
            next_block_interval,
        })
    }

    /// Parameters for plain contiguous growth from zero.
    pub fn contiguous(block_size: u64) -> Result<Self, InitializationError> {
        Self::new(block_size, 0, 0)
    }

    /// Number of values per block.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// First value of the category's first block.
    pub fn block_start_value(&self) -> i64 {
        self.block_start_value
    }

    /// Stripe width, or 0 when interleaving is disabled.
    pub fn next_block_interval(&self) -> u64 {
        self.next_block_interval
    }
}

/// A reserved, contiguous interval of identifier values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContiguousBlock {
    category: String,
    instance: String,
    first_value: i64,
    last_value: i64,
    last_committed: i64,
    reserved: bool,
    last_updated: SystemTime,
}

impl ContiguousBlock {
    /// Create a reserved block of `size` values starting at `first_value`,
    /// with nothing confirmed yet.
    pub fn new(
        category: &str,
        instance: &str,
        first_value: i64,
        size: u64,
        now: SystemTime,
    ) -> Self {
        assert!(size >= 1, "block size must be at least 1");
        Self {
            category: category.to_string(),
            instance: instance.to_string(),
            first_value,
            last_value: first_value + size as i64 - 1,
            last_committed: first_value - 1,
            reserved: true,
            last_updated: now,
        }
    }

    /// Category this block belongs to.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Instance currently (or last) owning the block.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// First value of the block.
    pub fn first_value(&self) -> i64 {
        self.first_value
    }

    /// Last value of the block.
    pub fn last_value(&self) -> i64 {
        self.last_value
    }

    /// Highest contiguously confirmed value; `first_value - 1` when nothing
    /// is confirmed yet.
    pub fn last_committed(&self) -> i64 {
        self.last_committed
    }

    /// Whether some process currently owns the block.
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// When the block was last written to the store.
    pub fn last_updated(&self) -> SystemTime {
        self.last_updated
    }

    /// Whether every value of the block is confirmed.
    pub fn is_full(&self) -> bool {
        self.last_committed == self.last_value
    }

    /// The unconfirmed tail `[last_committed + 1, last_value]`, or `None`
    /// when the block is full.
    pub fn remaining_range(&self) -> Option<MonotonicRange> {
        if self.is_full() {
            None
        } else {
            Some(MonotonicRange::new(self.last_committed + 1, self.last_value))
        }
    }

    /// The whole interval `[first_value, last_value]`.
    pub fn full_range(&self) -> MonotonicRange {
        MonotonicRange::new(self.first_value, self.last_value)
    }

    /// Advance the watermark.
    pub fn set_last_committed(&mut self, value: i64) {
        debug_assert!(
            value > self.last_committed && value <= self.last_value,
            "watermark must advance within the block",
        );
        self.last_committed = value;
    }

    /// Reassign ownership.
    pub fn set_instance(&mut self, instance: &str) {
        self.instance = instance.to_string();
    }

    /// Mark the block as owned.
    pub fn mark_reserved(&mut self) {
        self.reserved = true;
    }

    /// Mark the block as no longer owned.
    pub fn release_reserved(&mut self) {
        self.reserved = false;
    }

    /// Record a store write.
    pub fn touch(&mut self, now: SystemTime) {
        self.last_updated = now;
    }

    /// Place the block following this one, per the module-level placement
    /// rules.
    pub fn next_block(
        &self,
        instance: &str,
        parameters: &BlockParameters,
        now: SystemTime,
    ) -> Self {
        let natural = self.last_value + 1;
        let size = parameters.block_size();
        if parameters.next_block_interval() == 0 {
            return Self::new(&self.category, instance, natural, size, now);
        }

        let interval = parameters.next_block_interval() as i64;
        let offset = natural - parameters.block_start_value();
        let start = if offset.rem_euclid(interval) == 0 {
            // On a stripe boundary: leave the whole next stripe free.
            natural + interval
        } else {
            natural
        };
        let into_stripe = (start - parameters.block_start_value()).rem_euclid(interval);
        let available = (interval - into_stripe) as u64;
        Self::new(&self.category, instance, start, size.min(available), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const NOW: SystemTime = SystemTime::UNIX_EPOCH;

    fn block(first_value: i64, size: u64) -> ContiguousBlock {
        ContiguousBlock::new("cat-test", "inst-01", first_value, size, NOW)
    }

    #[test]
    fn test_new_block_invariants() {
        let block = block(0, 1000);
        assert_eq!(block.first_value(), 0);
        assert_eq!(block.last_value(), 999);
        assert_eq!(block.last_committed(), -1);
        assert!(block.is_reserved());
        assert!(!block.is_full());
        assert_eq!(block.remaining_range(), Some(MonotonicRange::new(0, 999)));
    }

    #[test]
    fn test_full_block_has_no_remaining_range() {
        let mut block = block(10, 5);
        block.set_last_committed(14);
        assert!(block.is_full());
        assert_eq!(block.remaining_range(), None);
    }

    #[test]
    fn test_next_block_without_interleaving() {
        let parameters = BlockParameters::new(2000, 0, 0).unwrap();
        let first = block(0, 1000);
        let second = first.next_block("inst-01", &parameters, NOW);
        assert_eq!(second.first_value(), 1000);
        assert_eq!(second.last_value(), 2999);
        assert_eq!(second.last_committed(), 999);
    }

    // A block starting exactly on a stripe boundary skips one stripe; a
    // block inside a stripe is truncated at the stripe's end.
    #[test_case((0, 1000), 500, 1000, 0, (2000, 2499); "boundary start skips a stripe")]
    #[test_case((2000, 500), 1000, 1000, 0, (2500, 2999); "truncated at stripe end")]
    #[test_case((0, 1000), 2000, 2000, 0, (1000, 1999); "truncated mid stripe")]
    #[test_case((1000, 1000), 2000, 2000, 0, (4000, 5999); "skip then full stripe")]
    fn test_next_block_interleaved(
        previous: (i64, u64),
        size: u64,
        interval: u64,
        start_value: i64,
        expected: (i64, i64),
    ) {
        let parameters = BlockParameters {
            block_size: size,
            block_start_value: start_value,
            next_block_interval: interval,
        };
        let previous = block(previous.0, previous.1);
        let next = previous.next_block("inst-01", &parameters, NOW);
        assert_eq!((next.first_value(), next.last_value()), expected);
    }

    #[test]
    fn test_next_block_with_nonzero_start_value() {
        let parameters = BlockParameters::new(10, 500, 20).unwrap();
        let mut current = ContiguousBlock::new("cat-test", "inst-01", 500, 10, NOW);

        let expected = [
            (510, 519),
            (540, 549),
            (550, 559),
            (580, 589),
            (590, 599),
            (620, 629),
        ];
        for (first, last) in expected {
            current = current.next_block("inst-01", &parameters, NOW);
            assert_eq!((current.first_value(), current.last_value()), (first, last));
        }
    }

    #[test]
    fn test_next_block_reassigns_instance() {
        let parameters = BlockParameters::contiguous(100).unwrap();
        let next = block(0, 100).next_block("inst-02", &parameters, NOW);
        assert_eq!(next.instance(), "inst-02");
        assert_eq!(next.category(), "cat-test");
    }

    #[test_case(0, 0, 0 => matches Err(InitializationError::InvalidBlockSize); "zero size")]
    #[test_case(1000, -1, 0 => matches Err(InitializationError::InvalidStartValue(-1)); "negative start")]
    #[test_case(1000, 0, 10 => matches Err(InitializationError::SizeExceedsInterval { .. }); "size beyond stripe")]
    #[test_case(1000, 0, 0 => matches Ok(_); "valid contiguous")]
    #[test_case(10, 1, 10 => matches Ok(_); "valid interleaved")]
    fn test_parameter_validation(
        size: u64,
        start: i64,
        interval: u64,
    ) -> Result<BlockParameters, InitializationError> {
        BlockParameters::new(size, start, interval)
    }
}
