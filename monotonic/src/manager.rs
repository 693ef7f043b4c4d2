//! In-process bookkeeping for the blocks owned by one generator.
//!
//! The manager tracks three things: the blocks assigned to this process (in
//! watermark order), a [RangePool] of their unused values, and the set of
//! values currently checked out to callers. Confirmation is
//! contiguity-gated: a block's watermark only advances while the next
//! expected value has been confirmed, and out-of-order confirmations are
//! held back until the gap closes. Values can be released (abandoned) out
//! of order, so advancing past a gap would wrongly mark an abandoned value
//! as used.
//!
//! Not safe for concurrent use: callers serialize access behind one
//! exclusion boundary.

use crate::block::ContiguousBlock;
use crate::pool::RangePool;
use crate::range::MonotonicRange;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::trace;

/// Bookkeeping violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// More values were requested than the assigned blocks can provide.
    #[error("insufficient capacity: {needed} values requested, {available} available")]
    InsufficientCapacity {
        /// Values requested.
        needed: u64,
        /// Values available across all assigned blocks.
        available: u64,
    },

    /// A value was committed or released without being checked out, or
    /// twice. Always a protocol violation by the caller; never retried.
    #[error("accession {0} is not pending")]
    NotPending(i64),
}

/// State of the identifier blocks in use by this process.
#[derive(Debug, Default)]
pub struct BlockManager {
    /// Assigned blocks keyed by last value; the first entry is the block
    /// whose watermark advances next.
    assigned: BTreeMap<i64, ContiguousBlock>,

    /// Unused values across all assigned blocks.
    pool: RangePool,

    /// Values handed to a caller but not yet committed or released.
    pending: HashSet<i64>,

    /// Values confirmed durable, awaiting in-order merge into a watermark.
    to_confirm: BTreeSet<i64>,
}

impl BlockManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a possibly partially-used block; the pool receives its
    /// unconfirmed tail. A full block is ignored.
    pub fn add_block(&mut self, block: ContiguousBlock) {
        let Some(range) = block.remaining_range() else {
            trace!(
                first = block.first_value(),
                "ignoring full block"
            );
            return;
        };
        trace!(
            first = block.first_value(),
            last = block.last_value(),
            committed = block.last_committed(),
            "adding block"
        );
        self.pool.add(range);
        self.assigned.insert(block.last_value(), block);
    }

    /// Register a brand-new block; the pool receives the whole interval.
    pub fn add_new_block(&mut self, block: ContiguousBlock) {
        trace!(
            first = block.first_value(),
            last = block.last_value(),
            "adding new block"
        );
        self.pool.add(block.full_range());
        self.assigned.insert(block.last_value(), block);
    }

    /// Whether `needed` values can be polled right now.
    pub fn has_available(&self, needed: u64) -> bool {
        self.pool.available() >= needed
    }

    /// Number of values available across all assigned blocks.
    pub fn available(&self) -> u64 {
        self.pool.available()
    }

    /// The unused ranges, ascending.
    pub fn available_ranges(&self) -> Vec<MonotonicRange> {
        self.pool.iter().copied().collect()
    }

    /// Clones of the assigned blocks, in watermark order.
    pub fn assigned_blocks(&self) -> Vec<ContiguousBlock> {
        self.assigned.values().cloned().collect()
    }

    /// Check out the next `count` values, smallest first. A single request
    /// may span multiple blocks.
    pub fn poll(&mut self, count: u64) -> Result<Vec<i64>, Error> {
        if !self.has_available(count) {
            return Err(Error::InsufficientCapacity {
                needed: count,
                available: self.pool.available(),
            });
        }
        let mut values = Vec::with_capacity(count as usize);
        while (values.len() as u64) < count {
            let remaining = count - values.len() as u64;
            let Some(range) = self.pool.poll(remaining) else {
                break;
            };
            for value in range.values() {
                self.pending.insert(value);
                values.push(value);
            }
        }
        debug_assert_eq!(values.len() as u64, count);
        trace!(?values, "checked out values");
        Ok(values)
    }

    /// Confirm checked-out values as durably written and advance watermarks
    /// as far as contiguity allows. Returns the blocks whose watermark
    /// changed (callers persist only these).
    pub fn commit(&mut self, values: &[i64]) -> Result<Vec<ContiguousBlock>, Error> {
        self.assert_pending(values)?;
        Ok(self.confirm(values))
    }

    /// Return checked-out values to the pool for reuse.
    pub fn release(&mut self, values: &[i64]) -> Result<(), Error> {
        self.assert_pending(values)?;
        trace!(?values, "releasing values");
        self.pool.add_all(MonotonicRange::from_values(values));
        for value in values {
            self.pending.remove(value);
        }
        Ok(())
    }

    /// Reconcile against values already durably written elsewhere: remove
    /// them from the pool so they are never handed out again, then advance
    /// watermarks exactly as [commit](Self::commit) would, without
    /// requiring the values to be pending. Idempotent; used only during
    /// startup and recovery.
    pub fn recover_state(&mut self, committed: &[i64]) -> Vec<ContiguousBlock> {
        let ranges = MonotonicRange::from_values(committed);
        self.pool.remove(&ranges);
        self.confirm(committed)
    }

    /// Drop all in-memory state.
    pub fn clear(&mut self) {
        self.assigned.clear();
        self.pool.clear();
        self.pending.clear();
        self.to_confirm.clear();
    }

    fn assert_pending(&self, values: &[i64]) -> Result<(), Error> {
        for value in values {
            if !self.pending.contains(value) {
                return Err(Error::NotPending(*value));
            }
        }
        Ok(())
    }

    fn confirm(&mut self, values: &[i64]) -> Vec<ContiguousBlock> {
        for value in values {
            self.pending.remove(value);
            self.to_confirm.insert(*value);
        }

        let mut changed = BTreeMap::new();
        loop {
            let Some(mut entry) = self.assigned.first_entry() else {
                break;
            };
            let block = entry.get_mut();
            let mut advanced = false;
            while let Some(&next) = self.to_confirm.first() {
                if next != block.last_committed() + 1 {
                    break;
                }
                self.to_confirm.pop_first();
                block.set_last_committed(next);
                advanced = true;
            }
            if advanced {
                trace!(
                    first = block.first_value(),
                    committed = block.last_committed(),
                    "advanced watermark"
                );
                changed.insert(block.first_value(), block.clone());
            }
            if block.is_full() {
                entry.remove();
                continue;
            }
            // The front block stalled on a gap; later blocks cannot advance.
            break;
        }
        changed.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ContiguousBlock;
    use std::time::SystemTime;

    const NOW: SystemTime = SystemTime::UNIX_EPOCH;

    fn block(first_value: i64, size: u64) -> ContiguousBlock {
        ContiguousBlock::new("cat-test", "inst-01", first_value, size, NOW)
    }

    #[test]
    fn test_no_capacity_without_blocks() {
        let manager = BlockManager::new();
        assert!(!manager.has_available(10));
        assert!(manager.has_available(0));
    }

    #[test]
    fn test_capacity_tracks_added_blocks() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 100));
        assert!(manager.has_available(10));
        assert!(manager.has_available(100));
        assert!(!manager.has_available(101));
    }

    #[test]
    fn test_poll_without_capacity_fails() {
        let mut manager = BlockManager::new();
        assert_eq!(
            manager.poll(4),
            Err(Error::InsufficientCapacity {
                needed: 4,
                available: 0,
            }),
        );
    }

    #[test]
    fn test_commit_unknown_values_fails() {
        let mut manager = BlockManager::new();
        assert_eq!(manager.commit(&[1, 3, 5]), Err(Error::NotPending(1)));
    }

    #[test]
    fn test_release_unknown_values_fails() {
        let mut manager = BlockManager::new();
        assert_eq!(manager.release(&[1, 3, 5]), Err(Error::NotPending(1)));
    }

    #[test]
    fn test_poll_returns_ascending_values() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 100));
        assert_eq!(manager.poll(10).unwrap(), (0..10).collect::<Vec<i64>>());
    }

    #[test]
    fn test_released_values_are_reused() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 100));
        let values = manager.poll(10).unwrap();
        manager.release(&values).unwrap();
        assert_eq!(manager.poll(10).unwrap(), values);
    }

    #[test]
    fn test_partial_release_fragments_pool() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 100));
        manager.poll(10).unwrap();
        manager.release(&[0, 1, 2, 6, 7, 8, 9]).unwrap();

        assert_eq!(manager.poll(10).unwrap(), vec![0, 1, 2]);
        assert_eq!(manager.poll(10).unwrap(), vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_commit_skips_gap_values() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 100));
        manager.poll(10).unwrap();
        manager.commit(&[0, 1, 2, 6, 7, 8, 9]).unwrap();
        // 3..5 are still pending, so the next poll starts at 10.
        assert_eq!(manager.poll(10).unwrap(), (10..20).collect::<Vec<i64>>());
    }

    #[test]
    fn test_watermark_advances_only_contiguously() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 10));
        manager.poll(10).unwrap();

        let changed = manager.commit(&[0, 1, 2, 6, 7, 8, 9]).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].last_committed(), 2);

        // Closing the gap jumps the watermark to the end.
        let changed = manager.commit(&[3, 4, 5]).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].last_committed(), 9);
        assert!(changed[0].is_full());
    }

    #[test]
    fn test_commit_spanning_blocks_reports_both() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 10));
        manager.add_new_block(block(10, 10));
        let first = manager.poll(10).unwrap();
        let second = manager.poll(2).unwrap();

        let all: Vec<i64> = first.into_iter().chain(second).collect();
        let changed = manager.commit(&all).unwrap();

        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].first_value(), 0);
        assert_eq!(changed[0].last_committed(), 9);
        assert_eq!(changed[1].first_value(), 10);
        assert_eq!(changed[1].last_committed(), 11);
    }

    #[test]
    fn test_empty_commit_changes_nothing() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 10));
        manager.poll(3).unwrap();
        let changed = manager.commit(&[0, 1, 2]).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].last_committed(), 2);

        assert!(manager.commit(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_full_block_leaves_assigned_set() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 10));
        let values = manager.poll(10).unwrap();
        manager.commit(&values).unwrap();
        assert!(manager.assigned_blocks().is_empty());
        assert!(!manager.has_available(1));
    }

    #[test]
    fn test_full_block_is_never_registered() {
        let mut manager = BlockManager::new();
        let mut full = block(0, 10);
        full.set_last_committed(9);
        manager.add_block(full);
        assert!(!manager.has_available(1));
        assert!(manager.assigned_blocks().is_empty());
    }

    #[test]
    fn test_add_block_pools_only_unconfirmed_tail() {
        let mut manager = BlockManager::new();
        let mut partial = block(0, 10);
        partial.set_last_committed(4);
        manager.add_block(partial);
        assert_eq!(manager.available(), 5);
        assert_eq!(manager.poll(5).unwrap(), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_recover_state_excludes_used_values() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 100));
        manager.recover_state(&[0, 1, 2, 6, 7, 8, 9]);

        assert_eq!(manager.poll(10).unwrap(), vec![3, 4, 5]);
        assert_eq!(manager.poll(10).unwrap(), (10..20).collect::<Vec<i64>>());
    }

    #[test]
    fn test_recover_state_across_blocks() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 10));
        manager.add_new_block(block(10, 10));
        manager.recover_state(&[0, 1, 2, 6, 7, 8, 9]);

        assert_eq!(manager.poll(10).unwrap(), vec![3, 4, 5]);
        assert_eq!(manager.poll(10).unwrap(), (10..20).collect::<Vec<i64>>());
    }

    #[test]
    fn test_recover_state_advances_watermark() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 10));
        let changed = manager.recover_state(&[0, 1, 2]);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].last_committed(), 2);
    }

    #[test]
    fn test_recover_state_is_idempotent() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 10));
        let first = manager.recover_state(&[0, 1, 2]);
        assert_eq!(first[0].last_committed(), 2);

        let second = manager.recover_state(&[0, 1, 2]);
        assert!(second.is_empty());
        assert_eq!(manager.available(), 7);
        assert_eq!(manager.assigned_blocks()[0].last_committed(), 2);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut manager = BlockManager::new();
        manager.add_new_block(block(0, 10));
        manager.poll(5).unwrap();
        manager.clear();
        assert!(!manager.has_available(1));
        assert!(manager.assigned_blocks().is_empty());
        assert_eq!(manager.release(&[0]), Err(Error::NotPending(0)));
    }
}
