//! Per-process accession generation for one `(category, instance)` pairing.
//!
//! A [MonotonicGenerator] owns the blocks its process draws identifiers
//! from. When capacity runs out it reserves more from the shared store,
//! absorbing reservation races with other processes through bounded
//! exponential backoff. Confirmed values advance each block's durable
//! watermark through the [BlockManager]; rejected values return to the
//! pool for reuse.
//!
//! All public operations serialize behind one internal mutex: the manager
//! is not safe for concurrent use, and callers from multiple tasks block
//! until the exclusive section completes. Once [shutdown](MonotonicGenerator::shutdown)
//! has run, every operation fails with [Error::ShutDown].
//!
//! # Recovery
//!
//! A process that crashes can leave objects persisted without their
//! block's watermark reflecting them. Two policies close that gap and
//! guarantee no durably-used value is ever re-issued:
//!
//! - [RecoveryPolicy::Eager] re-reserves every uncompleted block this
//!   instance previously owned at [init](MonotonicGenerator::init),
//!   reconciling each against the object store up front.
//! - [RecoveryPolicy::Lazy] (default) claims uncompleted, unreserved
//!   blocks of the category one at a time when `generate` needs capacity,
//!   and only reserves brand-new blocks once none remain.

use crate::block::{ContiguousBlock, InitializationError};
use crate::manager::{self, BlockManager};
use crate::metrics::Metrics;
use crate::range::MonotonicRange;
use crate::store::{self, ContiguousBlockStore, MonotonicDatabase};
use accession_core::generator::AccessionGenerator;
use accession_core::models::{AccessionRecord, SaveOutcome};
use accession_core::retry::{retry_with_backoff, BackoffPolicy, Clock, RetryError, SystemClock};
use prometheus_client::registry::Registry;
use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

/// Errors surfaced by a [MonotonicGenerator].
#[derive(Debug, Error)]
pub enum Error {
    /// The generator has been shut down; no further use is possible.
    #[error("generator has been shut down")]
    ShutDown,

    /// The generator's category is not usable.
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    /// A bookkeeping protocol violation; see [manager::Error].
    #[error(transparent)]
    Manager(#[from] manager::Error),

    /// Block reservation kept losing races until the retry budget ran
    /// out.
    #[error("could not reserve a block after {attempts} attempts: {source}")]
    ReservationExhausted {
        /// How many reservation attempts were made.
        attempts: u32,
        /// The error returned by the final attempt.
        #[source]
        source: store::Error,
    },

    /// The shared store failed with a non-retryable error.
    #[error(transparent)]
    Store(#[from] store::Error),
}

impl Error {
    fn from_retry(err: RetryError<store::Error>) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => {
                Self::ReservationExhausted { attempts, source }
            }
            RetryError::Aborted(source) => Self::Store(source),
        }
    }
}

/// When previously-used blocks are reclaimed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Re-reserve all of this instance's uncompleted blocks at `init`.
    Eager,

    /// Claim abandoned blocks one at a time when capacity runs out,
    /// before reserving new ones.
    #[default]
    Lazy,
}

/// Configuration of a [MonotonicGenerator].
pub struct Config<S, D, C = SystemClock> {
    /// Namespace of the identifier sequence this generator draws from.
    pub category: String,

    /// Identity of the owning process, recorded on every reserved block.
    pub instance: String,

    /// Durable block records shared across processes.
    pub block_store: S,

    /// Read-only view of persisted accessions, consulted during recovery.
    pub database: D,

    /// Time source for reservation backoff.
    pub clock: C,

    /// Bounds on reservation retries.
    pub backoff: BackoffPolicy,

    /// When previously-used blocks are reclaimed.
    pub recovery: RecoveryPolicy,
}

/// State guarded by the generator's mutex.
struct Inner {
    manager: BlockManager,

    /// Whether uncompleted blocks may remain for the category; cleared
    /// once a claim attempt comes back empty.
    uncompleted_available: bool,

    shut_down: bool,
}

/// Per-`(category, instance)` accession source backed by a shared block
/// store.
pub struct MonotonicGenerator<S, D, C = SystemClock> {
    category: String,
    instance: String,
    block_store: S,
    database: D,
    clock: C,
    backoff: BackoffPolicy,
    metrics: Metrics,
    inner: Mutex<Inner>,
}

impl<S, D, C> MonotonicGenerator<S, D, C>
where
    S: ContiguousBlockStore,
    D: MonotonicDatabase,
    C: Clock,
{
    /// Create a generator, verifying the category is configured and
    /// running eager recovery when the policy asks for it.
    pub async fn init(config: Config<S, D, C>, registry: &mut Registry) -> Result<Self, Error> {
        if config.block_store.block_parameters(&config.category).is_none() {
            return Err(InitializationError::MissingParameters(config.category).into());
        }
        let generator = Self {
            category: config.category,
            instance: config.instance,
            block_store: config.block_store,
            database: config.database,
            clock: config.clock,
            backoff: config.backoff,
            metrics: Metrics::new(registry),
            inner: Mutex::new(Inner {
                manager: BlockManager::new(),
                uncompleted_available: config.recovery == RecoveryPolicy::Lazy,
                shut_down: false,
            }),
        };
        if config.recovery == RecoveryPolicy::Eager {
            let mut inner = generator.inner.lock().await;
            generator.recover_uncompleted(&mut inner).await?;
        }
        Ok(generator)
    }

    /// Hand out the next `count` values, smallest first, reserving more
    /// blocks from the shared store as needed. Returned values stay
    /// pending until they are committed or released.
    pub async fn generate(&self, count: u64) -> Result<Vec<i64>, Error> {
        let mut inner = self.inner.lock().await;
        Self::ensure_active(&inner)?;
        trace!(count, category = %self.category, "generating accessions");
        while !inner.manager.has_available(count) {
            self.reserve_block(&mut inner).await?;
        }
        let values = inner.manager.poll(count)?;
        self.metrics.accessions_generated.inc_by(values.len() as u64);
        Ok(values)
    }

    /// Confirm values as durably written, persisting every block whose
    /// watermark advanced.
    pub async fn commit(&self, values: &[i64]) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        Self::ensure_active(&inner)?;
        self.commit_locked(&mut inner, values).await
    }

    /// Return values to the pool for reuse by a later
    /// [generate](Self::generate).
    pub async fn release(&self, values: &[i64]) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        Self::ensure_active(&inner)?;
        self.release_locked(&mut inner, values)
    }

    /// Apply a persistence outcome: committed values become durable,
    /// failed ones return to the pool.
    pub async fn post_save(&self, outcome: &SaveOutcome) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        Self::ensure_active(&inner)?;
        let mut committed: Vec<i64> = outcome.committed.iter().copied().collect();
        committed.sort_unstable();
        let mut failed: Vec<i64> = outcome.failed.iter().copied().collect();
        failed.sort_unstable();
        self.commit_locked(&mut inner, &committed).await?;
        self.release_locked(&mut inner, &failed)
    }

    /// Total unused values and the ranges holding them.
    pub async fn available(&self) -> Result<(u64, Vec<MonotonicRange>), Error> {
        let inner = self.inner.lock().await;
        Self::ensure_active(&inner)?;
        Ok((inner.manager.available(), inner.manager.available_ranges()))
    }

    /// Release every assigned block back to the store and refuse further
    /// use. Idempotent: repeated calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return Ok(());
        }
        let mut blocks = inner.manager.assigned_blocks();
        for block in &mut blocks {
            block.release_reserved();
        }
        if !blocks.is_empty() {
            self.block_store.save(&blocks).await?;
        }
        inner.manager.clear();
        inner.shut_down = true;
        info!(category = %self.category, instance = %self.instance, "generator shut down");
        Ok(())
    }

    fn ensure_active(inner: &Inner) -> Result<(), Error> {
        if inner.shut_down {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    async fn commit_locked(&self, inner: &mut Inner, values: &[i64]) -> Result<(), Error> {
        let changed = inner.manager.commit(values)?;
        if !changed.is_empty() {
            self.block_store.save(&changed).await?;
        }
        self.metrics.accessions_committed.inc_by(values.len() as u64);
        Ok(())
    }

    fn release_locked(&self, inner: &mut Inner, values: &[i64]) -> Result<(), Error> {
        inner.manager.release(values)?;
        self.metrics.accessions_released.inc_by(values.len() as u64);
        Ok(())
    }

    /// Bring one more block under management: an abandoned block of the
    /// category when any may remain, a brand-new one otherwise.
    async fn reserve_block(&self, inner: &mut Inner) -> Result<(), Error> {
        if inner.uncompleted_available {
            match self.reserve_abandoned().await? {
                Some(block) => {
                    self.metrics.blocks_reserved.inc();
                    return self.register_reconciled(inner, block).await;
                }
                None => {
                    debug!(category = %self.category, "no uncompleted blocks left to claim");
                    inner.uncompleted_available = false;
                }
            }
        }
        let block = self.reserve_new().await?;
        self.metrics.blocks_reserved.inc();
        inner.manager.add_new_block(block);
        Ok(())
    }

    async fn reserve_abandoned(&self) -> Result<Option<ContiguousBlock>, Error> {
        trace!(category = %self.category, "claiming an uncompleted block");
        retry_with_backoff(
            &self.clock,
            &self.backoff,
            |err: &store::Error| self.note_conflict(err),
            || {
                self.block_store
                    .reserve_one_abandoned_block(&self.category, &self.instance)
            },
        )
        .await
        .map_err(Error::from_retry)
    }

    async fn reserve_new(&self) -> Result<ContiguousBlock, Error> {
        trace!(category = %self.category, "reserving a new block");
        retry_with_backoff(
            &self.clock,
            &self.backoff,
            |err: &store::Error| self.note_conflict(err),
            || self.block_store.reserve_new_block(&self.category, &self.instance),
        )
        .await
        .map_err(Error::from_retry)
    }

    fn note_conflict(&self, err: &store::Error) -> bool {
        let retryable = err.is_retryable();
        if retryable {
            self.metrics.reservation_conflicts.inc();
        }
        retryable
    }

    /// Re-reserve every uncompleted block this instance owned before a
    /// restart and reconcile each against the object store.
    async fn recover_uncompleted(&self, inner: &mut Inner) -> Result<(), Error> {
        let blocks = self
            .block_store
            .reserve_uncompleted_blocks(&self.category, &self.instance)
            .await?;
        if blocks.is_empty() {
            return Ok(());
        }
        info!(
            category = %self.category,
            blocks = blocks.len(),
            "recovering uncompleted blocks"
        );
        for block in blocks {
            self.metrics.blocks_reserved.inc();
            self.register_reconciled(inner, block).await?;
        }
        Ok(())
    }

    /// Register a re-reserved block, excluding values the object store
    /// already holds and persisting any watermark advance they imply.
    async fn register_reconciled(
        &self,
        inner: &mut Inner,
        block: ContiguousBlock,
    ) -> Result<(), Error> {
        let remaining = block.remaining_range();
        inner.manager.add_block(block);
        let Some(remaining) = remaining else {
            return Ok(());
        };
        let used = store::used_in_range(&self.database, remaining).await?;
        if used.is_empty() {
            return Ok(());
        }
        debug!(
            category = %self.category,
            used = used.len(),
            "excluding persisted values found during recovery"
        );
        let changed = inner.manager.recover_state(&used);
        if !changed.is_empty() {
            self.block_store.save(&changed).await?;
        }
        Ok(())
    }
}

impl<M, S, D, C> AccessionGenerator<M> for MonotonicGenerator<S, D, C>
where
    M: Send + Sync,
    S: ContiguousBlockStore,
    D: MonotonicDatabase,
    C: Clock,
{
    type Error = Error;

    fn assign(
        &self,
        objects: Vec<(String, M)>,
    ) -> impl Future<Output = Result<Vec<AccessionRecord<M>>, Self::Error>> + Send {
        async move {
            let values = self.generate(objects.len() as u64).await?;
            Ok(objects
                .into_iter()
                .zip(values)
                .map(|((hash, data), accession)| AccessionRecord::new(accession, hash, data))
                .collect())
        }
    }

    fn post_save(
        &self,
        outcome: &SaveOutcome,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        MonotonicGenerator::post_save(self, outcome)
    }

    fn shutdown(&self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        MonotonicGenerator::shutdown(self)
    }
}
