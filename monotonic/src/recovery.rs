//! Out-of-band reclamation of blocks abandoned by dead processes.
//!
//! A process that crashes leaves its reserved blocks stranded: still
//! marked reserved, possibly with persisted values the watermark never
//! caught up to. [RecoveryAgent] sweeps such blocks, corrects each
//! watermark from the object store's view, and releases the reservation so
//! other generators can claim the remaining values.
//!
//! The sweep runs independently of any live generator and only touches
//! blocks last written at or before a caller-supplied cutoff, which keeps
//! it from racing an actively-operating generator for the same block.
//! Blocks are processed one at a time; progress already saved is retained
//! if the sweep is interrupted.

use crate::block::ContiguousBlock;
use crate::manager::BlockManager;
use crate::store::{self, ContiguousBlockStore, MonotonicDatabase};
use std::time::SystemTime;
use tracing::{debug, info};

/// Reclaims abandoned blocks for a category.
pub struct RecoveryAgent<S, D> {
    block_store: S,
    database: D,
}

impl<S, D> RecoveryAgent<S, D>
where
    S: ContiguousBlockStore,
    D: MonotonicDatabase,
{
    /// Create an agent over the given stores.
    pub fn new(block_store: S, database: D) -> Self {
        Self {
            block_store,
            database,
        }
    }

    /// Sweep every block of `category` still reserved at or before
    /// `cutoff`: correct its watermark from the object store, re-attribute
    /// it to `instance`, and release the reservation. Returns the number
    /// of blocks processed.
    pub async fn run(
        &self,
        category: &str,
        instance: &str,
        cutoff: SystemTime,
    ) -> Result<usize, store::Error> {
        let blocks = self
            .block_store
            .blocks_reserved_before(category, cutoff)
            .await?;
        info!(category, blocks = blocks.len(), "sweeping abandoned blocks");
        let processed = blocks.len();
        for block in blocks {
            debug!(
                first = block.first_value(),
                last = block.last_value(),
                committed = block.last_committed(),
                "recovering block"
            );
            let recovered = if block.is_full() {
                block
            } else {
                self.corrected_watermark(block).await?
            };
            self.release(recovered, instance).await?;
        }
        Ok(processed)
    }

    /// Advance the block's watermark to match the values actually
    /// persisted in its unconfirmed tail.
    async fn corrected_watermark(
        &self,
        block: ContiguousBlock,
    ) -> Result<ContiguousBlock, store::Error> {
        let Some(remaining) = block.remaining_range() else {
            return Ok(block);
        };
        let mut manager = BlockManager::new();
        manager.add_block(block.clone());
        let used = store::used_in_range(&self.database, remaining).await?;
        let changed = manager.recover_state(&used);
        match changed.into_iter().next() {
            Some(updated) => {
                debug!(
                    first = updated.first_value(),
                    committed = updated.last_committed(),
                    "watermark corrected"
                );
                Ok(updated)
            }
            None => Ok(block),
        }
    }

    async fn release(
        &self,
        mut block: ContiguousBlock,
        instance: &str,
    ) -> Result<(), store::Error> {
        block.set_instance(instance);
        block.release_reserved();
        self.block_store.save(&[block]).await
    }
}
