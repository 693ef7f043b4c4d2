//! Records exchanged between the resolver, the object store, and an
//! accession generator.

use std::collections::HashSet;

/// An object together with its assigned accession and content hash.
///
/// The hash uniquely determines identity: two objects with the same hash are
/// the same logical object and share one accession.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessionRecord<M> {
    /// The assigned identifier.
    pub accession: i64,

    /// Deterministic hash of the object's identifying content.
    pub hash: String,

    /// Version of the record, starting at 1.
    pub version: u32,

    /// The object itself.
    pub data: M,
}

impl<M> AccessionRecord<M> {
    /// Create a first-version record.
    pub fn new(accession: i64, hash: String, data: M) -> Self {
        Self {
            accession,
            hash,
            version: 1,
            data,
        }
    }
}

/// Result of resolving one object through get-or-create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetOrCreateRecord<M> {
    /// The resolved record.
    pub record: AccessionRecord<M>,

    /// Whether the accession already existed before this call (assigned by
    /// an earlier call or by a concurrent process).
    pub already_created: bool,
}

impl<M> GetOrCreateRecord<M> {
    /// Wrap a record that was created by this call.
    pub fn created(record: AccessionRecord<M>) -> Self {
        Self {
            record,
            already_created: false,
        }
    }

    /// Wrap a record that existed before this call.
    pub fn preexisting(record: AccessionRecord<M>) -> Self {
        Self {
            record,
            already_created: true,
        }
    }
}

/// Partition of a batch persistence attempt.
///
/// Every accession in an attempted batch appears in exactly one of the two
/// sets: `committed` if its record was durably written, `failed` if the
/// store rejected it (a record with the same content hash already exists).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Accessions whose records were durably written.
    pub committed: HashSet<i64>,

    /// Accessions whose records were rejected.
    pub failed: HashSet<i64>,
}

impl SaveOutcome {
    /// Build an outcome from its two partitions.
    pub fn new(committed: HashSet<i64>, failed: HashSet<i64>) -> Self {
        Self { committed, failed }
    }

    /// Whether the given accession was durably written.
    pub fn is_committed(&self, accession: i64) -> bool {
        self.committed.contains(&accession)
    }
}
