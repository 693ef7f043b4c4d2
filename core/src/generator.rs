//! Seam between the resolver and an accession generator.

use crate::models::{AccessionRecord, SaveOutcome};
use std::future::Future;

/// Source of fresh accessions for a batch of hashed objects.
///
/// The resolver drives this in two phases: [assign](Self::assign) hands out
/// candidate accessions before a persistence attempt, and
/// [post_save](Self::post_save) reports which of them were durably written
/// so the generator can confirm or reclaim them.
pub trait AccessionGenerator<M>: Send + Sync {
    /// Error type surfaced by this generator.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Assign one fresh accession per `(hash, object)` pair, preserving
    /// input order.
    fn assign(
        &self,
        objects: Vec<(String, M)>,
    ) -> impl Future<Output = Result<Vec<AccessionRecord<M>>, Self::Error>> + Send;

    /// Feed back the outcome of a persistence attempt: committed accessions
    /// become durable, failed ones return to the pool for reuse.
    fn post_save(
        &self,
        outcome: &SaveOutcome,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Release every outstanding reservation and refuse further use.
    fn shutdown(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
