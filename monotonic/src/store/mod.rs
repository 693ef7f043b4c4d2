//! Contracts the allocator consumes from the shared store.
//!
//! Cross-process coordination is delegated entirely to a transactional
//! store implementing [ContiguousBlockStore]: reserving a block must be
//! serializable (or use row locking that prevents two transactions from
//! selecting the same block), and uniqueness of `(category, first_value)`
//! must be a hard constraint so a race in computing the next start is
//! caught as a [Error::Conflict] and retried instead of corrupting the
//! range space.
//!
//! [MonotonicDatabase] is the allocator's read-only view of the
//! accessioned-object store: which identifier values were actually
//! persisted. It is consulted only during startup recovery and by the
//! recovery agent.
//!
//! [memory] provides an in-memory implementation of both contracts for
//! tests and single-process embedders.

use crate::block::{BlockParameters, ContiguousBlock};
use crate::range::MonotonicRange;
use std::future::Future;
use std::time::SystemTime;
use thiserror::Error;

pub mod memory;

/// Largest number of values queried from a [MonotonicDatabase] at once;
/// wider ranges are split before querying.
pub const MAX_QUERY_RANGE: u64 = 100_000;

/// Errors surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// A concurrent reservation touched the same rows (unique-constraint
    /// collision or serialization failure). Expected under concurrency;
    /// callers retry with backoff.
    #[error("conflicting block reservation for category {0}")]
    Conflict(String),

    /// The underlying storage backend failed.
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Durable records of reserved identifier blocks.
///
/// Implementations must serialize concurrent reservations for the same
/// category so that no two blocks ever overlap (see the module
/// documentation). Blocks are never deleted by this subsystem.
pub trait ContiguousBlockStore: Clone + Send + Sync {
    /// Placement parameters configured for the category, if any. Absence
    /// is a fatal configuration error at generator construction.
    fn block_parameters(&self, category: &str) -> Option<BlockParameters>;

    /// Create and reserve the category's next block for `instance`,
    /// placed after the highest existing block per the category's
    /// parameters.
    ///
    /// Losing a placement race to a concurrent process fails with
    /// [Error::Conflict].
    fn reserve_new_block(
        &self,
        category: &str,
        instance: &str,
    ) -> impl Future<Output = Result<ContiguousBlock, Error>> + Send;

    /// Re-reserve every not-full block previously owned by
    /// `(category, instance)`, in ascending value order. Used by eager
    /// startup recovery.
    fn reserve_uncompleted_blocks(
        &self,
        category: &str,
        instance: &str,
    ) -> impl Future<Output = Result<Vec<ContiguousBlock>, Error>> + Send;

    /// Atomically claim one not-full, not-reserved block of the category
    /// for `instance`, or `None` when every block is either full or owned.
    ///
    /// Implementations should prefer lock-first-match-skip-locked-rows
    /// selection where the backend supports it, so concurrent claims
    /// proceed against disjoint rows instead of queuing.
    fn reserve_one_abandoned_block(
        &self,
        category: &str,
        instance: &str,
    ) -> impl Future<Output = Result<Option<ContiguousBlock>, Error>> + Send;

    /// Persist watermark and reservation changes. A block that is now
    /// full is unreserved on save.
    fn save(&self, blocks: &[ContiguousBlock]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Every still-reserved block of the category last written at or
    /// before `cutoff`, in ascending value order. Used by the recovery
    /// agent to find blocks abandoned by dead processes.
    fn blocks_reserved_before(
        &self,
        category: &str,
        cutoff: SystemTime,
    ) -> impl Future<Output = Result<Vec<ContiguousBlock>, Error>> + Send;
}

/// Read-only view of which identifier values are durably associated with
/// an object.
pub trait MonotonicDatabase: Clone + Send + Sync {
    /// The values within `ranges` actually persisted, sorted ascending
    /// without duplicates.
    fn accessions_in_ranges(
        &self,
        ranges: &[MonotonicRange],
    ) -> impl Future<Output = Result<Vec<i64>, Error>> + Send;
}

/// Query the values of `range` present in the database, splitting the
/// range into sub-ranges of at most [MAX_QUERY_RANGE] values per query.
pub async fn used_in_range<D: MonotonicDatabase>(
    database: &D,
    range: MonotonicRange,
) -> Result<Vec<i64>, Error> {
    let mut used = Vec::new();
    for chunk in range.chunks(MAX_QUERY_RANGE) {
        used.extend(database.accessions_in_ranges(&[chunk]).await?);
    }
    Ok(used)
}
