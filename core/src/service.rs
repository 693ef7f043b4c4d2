//! Idempotent get-or-create resolution of content-addressed objects.
//!
//! Several processes may try to accession the same logical object (same
//! content hash) at once. [AccessioningService] resolves that race: it
//! assigns candidate accessions, attempts a bulk persist, and reconciles
//! rejected records (duplicate content) against the records that won,
//! feeding the outcome back into the generator so losing candidates return
//! to the pool.
//!
//! # Modes
//!
//! - [SaveMode::SaveAllThenResolve] (default): persist everything, then
//!   look up pre-existing records only for the rejects. One round trip in
//!   the common no-collision case.
//! - [SaveMode::PrefilterExisting]: look up existing records first and
//!   release their candidate accessions before persisting the remainder.
//!   Consumes fewer identifiers under high collision rates at the cost of
//!   an extra lookup.

use crate::generator::AccessionGenerator;
use crate::hashing::HashingFunction;
use crate::models::{AccessionRecord, GetOrCreateRecord, SaveOutcome};
use crate::store::{self, ObjectStore};
use std::collections::HashSet;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Errors surfaced by [AccessioningService].
#[derive(Debug, Error)]
pub enum Error {
    /// The generator could not produce or reconcile accessions.
    #[error("accession generation failed: {0}")]
    Generation(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The object store failed.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Records rejected as duplicates could not all be matched to
    /// pre-existing records. This is an unrecoverable inconsistency (a
    /// concurrent failure or a retry race during lookup) and is never
    /// retried.
    #[error("pre-existing record lookup mismatch: {found} records for {expected} rejected hashes")]
    MissingUnsavedAccessions {
        /// Number of rejected hashes that were looked up.
        expected: usize,
        /// Number of pre-existing records actually found.
        found: usize,
    },
}

/// How a batch is reconciled against pre-existing records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SaveMode {
    /// Persist all candidates, then resolve the rejects.
    #[default]
    SaveAllThenResolve,

    /// Look up existing records first, release their candidates, then
    /// persist the remainder.
    PrefilterExisting,
}

/// Resolves batches of objects to accessions, creating records for hashes
/// seen for the first time and returning existing records otherwise.
pub struct AccessioningService<M, G, S, F, H> {
    generator: G,
    store: S,
    summary: F,
    hasher: H,
    mode: SaveMode,
    _model: PhantomData<fn() -> M>,
}

impl<M, G, S, F, H> AccessioningService<M, G, S, F, H>
where
    M: Send + Sync,
    G: AccessionGenerator<M>,
    S: ObjectStore<M>,
    F: Fn(&M) -> String + Send + Sync,
    H: HashingFunction,
{
    /// Create a service over the given generator and store.
    ///
    /// `summary` reduces an object to the string that identifies it;
    /// `hasher` turns that summary into the content hash.
    pub fn new(generator: G, store: S, summary: F, hasher: H, mode: SaveMode) -> Self {
        Self {
            generator,
            store,
            summary,
            hasher,
            mode,
            _model: PhantomData,
        }
    }

    /// Resolve a batch: assign accessions to unseen hashes, return existing
    /// records for the rest.
    ///
    /// Hashes are deduplicated within the batch (first occurrence wins).
    /// Newly created records come first in the result, pre-existing ones
    /// are appended and flagged
    /// [already_created](GetOrCreateRecord::already_created).
    pub async fn get_or_create(
        &self,
        messages: Vec<M>,
    ) -> Result<Vec<GetOrCreateRecord<M>>, Error> {
        let hashed = self.hash_batch(messages);
        trace!(batch = hashed.len(), "resolving batch");
        let records = self
            .generator
            .assign(hashed)
            .await
            .map_err(|err| Error::Generation(Box::new(err)))?;
        match self.mode {
            SaveMode::SaveAllThenResolve => self.save_all_then_resolve(records).await,
            SaveMode::PrefilterExisting => self.save_prefiltering_existing(records).await,
        }
    }

    /// Fetch the records for a batch of objects without creating anything.
    pub async fn get(&self, messages: &[M]) -> Result<Vec<AccessionRecord<M>>, Error> {
        let hashes: Vec<String> = messages.iter().map(|message| self.hash(message)).collect();
        Ok(self.store.find_by_hashes(&hashes).await?)
    }

    /// Shut down the underlying generator, releasing its reservations.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.generator
            .shutdown()
            .await
            .map_err(|err| Error::Generation(Box::new(err)))
    }

    fn hash(&self, message: &M) -> String {
        self.hasher.hash(&(self.summary)(message))
    }

    /// Hash every message, keeping the first occurrence of each hash.
    fn hash_batch(&self, messages: Vec<M>) -> Vec<(String, M)> {
        let mut seen = HashSet::new();
        let mut hashed = Vec::with_capacity(messages.len());
        for message in messages {
            let hash = self.hash(&message);
            if seen.insert(hash.clone()) {
                hashed.push((hash, message));
            }
        }
        hashed
    }

    async fn save_all_then_resolve(
        &self,
        records: Vec<AccessionRecord<M>>,
    ) -> Result<Vec<GetOrCreateRecord<M>>, Error> {
        let outcome = self.store.save(&records).await?;
        self.generator
            .post_save(&outcome)
            .await
            .map_err(|err| Error::Generation(Box::new(err)))?;

        let mut resolved = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for record in records {
            if outcome.is_committed(record.accession) {
                resolved.push(GetOrCreateRecord::created(record));
            } else {
                rejected.push(record);
            }
        }
        if !rejected.is_empty() {
            debug!(rejected = rejected.len(), "resolving rejected records");
            for record in self.preexisting_records(&rejected).await? {
                resolved.push(GetOrCreateRecord::preexisting(record));
            }
        }
        Ok(resolved)
    }

    async fn save_prefiltering_existing(
        &self,
        records: Vec<AccessionRecord<M>>,
    ) -> Result<Vec<GetOrCreateRecord<M>>, Error> {
        let hashes: Vec<String> = records.iter().map(|record| record.hash.clone()).collect();
        let preexisting = self.store.find_by_hashes(&hashes).await?;
        let preexisting_hashes: HashSet<&str> = preexisting
            .iter()
            .map(|record| record.hash.as_str())
            .collect();

        // Candidates whose hash already exists are wasted; return them to
        // the pool before attempting the persist.
        let mut to_save = Vec::new();
        let mut wasted = HashSet::new();
        for record in records {
            if preexisting_hashes.contains(record.hash.as_str()) {
                wasted.insert(record.accession);
            } else {
                to_save.push(record);
            }
        }
        if !wasted.is_empty() {
            debug!(released = wasted.len(), "releasing candidates for existing hashes");
            self.generator
                .post_save(&SaveOutcome::new(HashSet::new(), wasted))
                .await
                .map_err(|err| Error::Generation(Box::new(err)))?;
        }

        let mut resolved = if to_save.is_empty() {
            Vec::new()
        } else {
            self.save_all_then_resolve(to_save).await?
        };
        resolved.extend(preexisting.into_iter().map(GetOrCreateRecord::preexisting));
        Ok(resolved)
    }

    /// Look up the records that beat the rejected candidates. Every
    /// rejected hash must resolve; anything less is a consistency error.
    async fn preexisting_records(
        &self,
        rejected: &[AccessionRecord<M>],
    ) -> Result<Vec<AccessionRecord<M>>, Error> {
        let hashes: Vec<String> = rejected.iter().map(|record| record.hash.clone()).collect();
        let found = self.store.find_by_hashes(&hashes).await?;
        if found.len() != hashes.len() {
            error!(
                expected = hashes.len(),
                found = found.len(),
                "rejected records do not match pre-existing records"
            );
            return Err(Error::MissingUnsavedAccessions {
                expected: hashes.len(),
                found: found.len(),
            });
        }
        Ok(found)
    }
}
