//! Contract the resolver consumes from the accessioned-object store.

use crate::models::{AccessionRecord, SaveOutcome};
use std::future::Future;
use thiserror::Error;

/// Errors surfaced by an object store implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying storage backend failed.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Durable storage of accessioned objects, keyed by content hash.
///
/// Implementations must enforce hash uniqueness: persisting a record whose
/// hash already exists reports that record as failed rather than
/// overwriting, which is how concurrent get-or-create races are detected.
pub trait ObjectStore<M>: Clone + Send + Sync {
    /// Attempt to persist every record in one bulk operation.
    ///
    /// The outcome partitions the batch: records written durably are
    /// committed, records rejected because their hash already exists are
    /// failed. A failure of one record must not prevent others from being
    /// written.
    fn save(
        &self,
        records: &[AccessionRecord<M>],
    ) -> impl Future<Output = Result<SaveOutcome, Error>> + Send;

    /// Fetch the record for each of the given hashes that exists.
    ///
    /// Missing hashes are skipped; the result preserves the order of the
    /// input hashes.
    fn find_by_hashes(
        &self,
        hashes: &[String],
    ) -> impl Future<Output = Result<Vec<AccessionRecord<M>>, Error>> + Send;
}
