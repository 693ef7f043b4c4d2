//! End-to-end resolution against the monotonic allocator: independent
//! services, each with its own generator, share one block store and one
//! object store the way separate processes share a database.

use accession_core::hashing::Sha256HashingFunction;
use accession_core::models::{AccessionRecord, SaveOutcome};
use accession_core::retry::{BackoffPolicy, Clock, ManualClock};
use accession_core::service::{AccessioningService, SaveMode};
use accession_core::store::{self as object_store, ObjectStore};
use accession_monotonic::block::BlockParameters;
use accession_monotonic::generator::{Config, MonotonicGenerator, RecoveryPolicy};
use accession_monotonic::range::MonotonicRange;
use accession_monotonic::recovery::RecoveryAgent;
use accession_monotonic::store::memory::MemoryBlockStore;
use accession_monotonic::store::{Error as StoreError, MonotonicDatabase};
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

const CATEGORY: &str = "cat-test";
const BLOCK_SIZE: u64 = 10;

/// Accessioned objects keyed by content hash, doubling as the
/// [MonotonicDatabase] view the allocator consults during recovery.
#[derive(Clone, Default)]
struct SharedObjectStore {
    records: Arc<Mutex<HashMap<String, AccessionRecord<String>>>>,
}

impl ObjectStore<String> for SharedObjectStore {
    fn save(
        &self,
        records: &[AccessionRecord<String>],
    ) -> impl Future<Output = Result<SaveOutcome, object_store::Error>> + Send {
        let mut stored = self.records.lock().unwrap();
        let mut outcome = SaveOutcome::default();
        for record in records {
            if stored.contains_key(&record.hash) {
                outcome.failed.insert(record.accession);
            } else {
                stored.insert(record.hash.clone(), record.clone());
                outcome.committed.insert(record.accession);
            }
        }
        std::future::ready(Ok(outcome))
    }

    fn find_by_hashes(
        &self,
        hashes: &[String],
    ) -> impl Future<Output = Result<Vec<AccessionRecord<String>>, object_store::Error>> + Send
    {
        let stored = self.records.lock().unwrap();
        let found = hashes
            .iter()
            .filter_map(|hash| stored.get(hash).cloned())
            .collect();
        std::future::ready(Ok(found))
    }
}

impl MonotonicDatabase for SharedObjectStore {
    fn accessions_in_ranges(
        &self,
        ranges: &[MonotonicRange],
    ) -> impl Future<Output = Result<Vec<i64>, StoreError>> + Send {
        let stored = self.records.lock().unwrap();
        let mut found: Vec<i64> = stored
            .values()
            .map(|record| record.accession)
            .filter(|accession| ranges.iter().any(|range| range.contains(*accession)))
            .collect();
        found.sort_unstable();
        std::future::ready(Ok(found))
    }
}

type TestGenerator =
    MonotonicGenerator<MemoryBlockStore<ManualClock>, SharedObjectStore, ManualClock>;
type TestService = AccessioningService<
    String,
    TestGenerator,
    SharedObjectStore,
    fn(&String) -> String,
    Sha256HashingFunction,
>;

struct Fixture {
    block_store: MemoryBlockStore<ManualClock>,
    objects: SharedObjectStore,
    clock: ManualClock,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        let clock = ManualClock::default();
        let block_store = MemoryBlockStore::with_clock(clock.clone());
        block_store.configure(CATEGORY, BlockParameters::contiguous(BLOCK_SIZE).unwrap());
        Self {
            block_store,
            objects: SharedObjectStore::default(),
            clock,
        }
    }

    async fn generator(&self, instance: &str) -> TestGenerator {
        MonotonicGenerator::init(
            Config {
                category: CATEGORY.to_string(),
                instance: instance.to_string(),
                block_store: self.block_store.clone(),
                database: self.objects.clone(),
                clock: self.clock.clone(),
                backoff: BackoffPolicy::default(),
                recovery: RecoveryPolicy::default(),
            },
            &mut Registry::default(),
        )
        .await
        .unwrap()
    }

    async fn service(&self, instance: &str) -> TestService {
        AccessioningService::new(
            self.generator(instance).await,
            self.objects.clone(),
            String::clone as fn(&String) -> String,
            Sha256HashingFunction,
            SaveMode::SaveAllThenResolve,
        )
    }
}

fn batch(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_services_agree_on_one_accession() {
    let fixture = Fixture::new();
    let first = fixture.service("inst-01").await;
    let second = fixture.service("inst-02").await;

    let (left, right) = tokio::join!(
        first.get_or_create(batch(&["shared", "left-only"])),
        second.get_or_create(batch(&["shared", "right-only"])),
    );
    let left = left.unwrap();
    let right = right.unwrap();

    let left_shared = left.iter().find(|r| r.record.data == "shared").unwrap();
    let right_shared = right.iter().find(|r| r.record.data == "shared").unwrap();

    // Exactly one service created the shared record; both see one value.
    assert_eq!(left_shared.record.accession, right_shared.record.accession);
    assert!(left_shared.already_created != right_shared.already_created);
}

#[tokio::test]
async fn test_losing_candidate_is_released_and_reused() {
    let fixture = Fixture::new();
    let first = fixture.service("inst-01").await;
    let second = fixture.service("inst-02").await;

    let created = first.get_or_create(batch(&["x"])).await.unwrap();
    assert_eq!(created[0].record.accession, 0);

    // The second service draws from its own block, so its candidates for
    // "x" and "y" are 10 and 11; the one wasted on "x" must come back.
    let resolved = second.get_or_create(batch(&["x", "y"])).await.unwrap();
    let x = resolved.iter().find(|r| r.record.data == "x").unwrap();
    let y = resolved.iter().find(|r| r.record.data == "y").unwrap();
    assert!(x.already_created);
    assert_eq!(x.record.accession, 0);
    assert!(!y.already_created);
    assert_eq!(y.record.accession, 11);

    let reused = second.get_or_create(batch(&["z"])).await.unwrap();
    assert_eq!(reused[0].record.accession, 10);
}

#[tokio::test]
async fn test_swept_block_is_claimed_by_next_service() {
    let fixture = Fixture::new();

    // A service accessions three objects, then its process dies without
    // shutting down: the block stays reserved with watermark 2.
    let crashed = fixture.service("inst-01").await;
    crashed.get_or_create(batch(&["a", "b", "c"])).await.unwrap();
    drop(crashed);

    let cutoff = fixture.clock.current();
    let swept = RecoveryAgent::new(fixture.block_store.clone(), fixture.objects.clone())
        .run(CATEGORY, "inst-recovery", cutoff)
        .await
        .unwrap();
    assert_eq!(swept, 1);

    // The released block's remaining values are picked up instead of a
    // fresh block being reserved.
    let next = fixture.service("inst-02").await;
    let resolved = next.get_or_create(batch(&["d"])).await.unwrap();
    assert_eq!(resolved[0].record.accession, 3);
    assert_eq!(fixture.block_store.blocks(CATEGORY).len(), 1);
}
