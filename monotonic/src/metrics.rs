//! Prometheus metrics for the allocator.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Counters exposed by a generator.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Accessions handed out by `generate`.
    pub accessions_generated: Counter,

    /// Accessions confirmed as durably written.
    pub accessions_committed: Counter,

    /// Accessions returned to the pool for reuse.
    pub accessions_released: Counter,

    /// Blocks reserved or re-reserved by this generator.
    pub blocks_reserved: Counter,

    /// Reservation attempts lost to a concurrent process and retried.
    pub reservation_conflicts: Counter,
}

impl Metrics {
    /// Create metrics registered under the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "accessions_generated",
            "Number of accessions handed out",
            metrics.accessions_generated.clone(),
        );
        registry.register(
            "accessions_committed",
            "Number of accessions confirmed as durably written",
            metrics.accessions_committed.clone(),
        );
        registry.register(
            "accessions_released",
            "Number of accessions returned to the pool",
            metrics.accessions_released.clone(),
        );
        registry.register(
            "blocks_reserved",
            "Number of blocks reserved by this generator",
            metrics.blocks_reserved.clone(),
        );
        registry.register(
            "reservation_conflicts",
            "Number of block reservations lost to a concurrent process",
            metrics.reservation_conflicts.clone(),
        );
        metrics
    }
}
