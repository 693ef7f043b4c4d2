//! In-memory store implementations.
//!
//! [MemoryBlockStore] keeps the block table behind one mutex, which makes
//! every operation a serializable transaction: concurrent reservations are
//! linearized exactly as the [ContiguousBlockStore] contract requires of a
//! relational backend. [MemoryDatabase] is the matching object-store view.
//! Both are intended for tests and single-process embedders.

use crate::block::{BlockParameters, ContiguousBlock};
use crate::range::MonotonicRange;
use crate::store::{ContiguousBlockStore, Error, MonotonicDatabase};
use accession_core::retry::{Clock, SystemClock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

#[derive(Default)]
struct State {
    parameters: HashMap<String, BlockParameters>,

    /// Blocks keyed by `(category, first_value)`; the key uniqueness
    /// mirrors the hard constraint a relational backend enforces.
    blocks: BTreeMap<(String, i64), ContiguousBlock>,

    /// Remaining number of reservations to fail with [Error::Conflict].
    conflicts: u32,
}

/// [ContiguousBlockStore] over an in-memory block table.
///
/// Time is injected so tests can control `last_updated` stamps; see
/// [MemoryBlockStore::with_clock].
#[derive(Clone)]
pub struct MemoryBlockStore<C: Clock = SystemClock> {
    clock: C,
    state: Arc<Mutex<State>>,
}

impl MemoryBlockStore<SystemClock> {
    /// Create an empty store stamping blocks with the wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryBlockStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryBlockStore<C> {
    /// Create an empty store stamping blocks with the given clock.
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Set the placement parameters for a category.
    pub fn configure(&self, category: &str, parameters: BlockParameters) {
        let mut state = self.state.lock().unwrap();
        state.parameters.insert(category.to_string(), parameters);
    }

    /// Fail the next `count` reservations with [Error::Conflict], as a
    /// backend would when a concurrent transaction wins a placement race.
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().unwrap().conflicts = count;
    }

    /// Snapshot of the category's blocks, ascending by first value.
    pub fn blocks(&self, category: &str) -> Vec<ContiguousBlock> {
        let state = self.state.lock().unwrap();
        state
            .blocks
            .values()
            .filter(|block| block.category() == category)
            .cloned()
            .collect()
    }

    fn upsert(state: &mut State, mut block: ContiguousBlock, now: SystemTime) {
        if block.is_full() {
            block.release_reserved();
        }
        block.touch(now);
        state
            .blocks
            .insert((block.category().to_string(), block.first_value()), block);
    }
}

impl<C: Clock> ContiguousBlockStore for MemoryBlockStore<C> {
    fn block_parameters(&self, category: &str) -> Option<BlockParameters> {
        self.state.lock().unwrap().parameters.get(category).copied()
    }

    fn reserve_new_block(
        &self,
        category: &str,
        instance: &str,
    ) -> impl std::future::Future<Output = Result<ContiguousBlock, Error>> + Send {
        let now = self.clock.current();
        let mut state = self.state.lock().unwrap();
        let result = (|| {
            if state.conflicts > 0 {
                state.conflicts -= 1;
                return Err(Error::Conflict(category.to_string()));
            }
            let parameters = state
                .parameters
                .get(category)
                .copied()
                .ok_or_else(|| Error::Backend(format!("no parameters for category {category}")))?;
            let highest = state
                .blocks
                .values()
                .filter(|block| block.category() == category)
                .max_by_key(|block| block.last_value());
            let block = match highest {
                Some(previous) => previous.next_block(instance, &parameters, now),
                None => ContiguousBlock::new(
                    category,
                    instance,
                    parameters.block_start_value(),
                    parameters.block_size(),
                    now,
                ),
            };
            if state
                .blocks
                .contains_key(&(category.to_string(), block.first_value()))
            {
                return Err(Error::Conflict(category.to_string()));
            }
            Self::upsert(&mut state, block.clone(), now);
            Ok(block)
        })();
        std::future::ready(result)
    }

    fn reserve_uncompleted_blocks(
        &self,
        category: &str,
        instance: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ContiguousBlock>, Error>> + Send {
        let now = self.clock.current();
        let mut state = self.state.lock().unwrap();
        let uncompleted: Vec<ContiguousBlock> = state
            .blocks
            .values()
            .filter(|block| {
                block.category() == category && block.instance() == instance && !block.is_full()
            })
            .cloned()
            .collect();
        let mut reserved = Vec::with_capacity(uncompleted.len());
        for mut block in uncompleted {
            block.mark_reserved();
            block.touch(now);
            Self::upsert(&mut state, block.clone(), now);
            reserved.push(block);
        }
        std::future::ready(Ok(reserved))
    }

    fn reserve_one_abandoned_block(
        &self,
        category: &str,
        instance: &str,
    ) -> impl std::future::Future<Output = Result<Option<ContiguousBlock>, Error>> + Send {
        let now = self.clock.current();
        let mut state = self.state.lock().unwrap();
        let found = state
            .blocks
            .values()
            .filter(|block| {
                block.category() == category && !block.is_reserved() && !block.is_full()
            })
            .min_by_key(|block| block.last_value())
            .cloned();
        let claimed = found.map(|mut block| {
            block.set_instance(instance);
            block.mark_reserved();
            block.touch(now);
            Self::upsert(&mut state, block.clone(), now);
            block
        });
        std::future::ready(Ok(claimed))
    }

    fn save(
        &self,
        blocks: &[ContiguousBlock],
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send {
        let now = self.clock.current();
        let mut state = self.state.lock().unwrap();
        for block in blocks {
            Self::upsert(&mut state, block.clone(), now);
        }
        std::future::ready(Ok(()))
    }

    fn blocks_reserved_before(
        &self,
        category: &str,
        cutoff: SystemTime,
    ) -> impl std::future::Future<Output = Result<Vec<ContiguousBlock>, Error>> + Send {
        let state = self.state.lock().unwrap();
        let abandoned = state
            .blocks
            .values()
            .filter(|block| {
                block.category() == category
                    && block.is_reserved()
                    && block.last_updated() <= cutoff
            })
            .cloned()
            .collect();
        std::future::ready(Ok(abandoned))
    }
}

/// [MonotonicDatabase] over an in-memory set of used values.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    used: Arc<Mutex<BTreeSet<i64>>>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record values as durably associated with an object.
    pub fn record(&self, values: &[i64]) {
        self.used.lock().unwrap().extend(values.iter().copied());
    }
}

impl MonotonicDatabase for MemoryDatabase {
    fn accessions_in_ranges(
        &self,
        ranges: &[MonotonicRange],
    ) -> impl std::future::Future<Output = Result<Vec<i64>, Error>> + Send {
        let used = self.used.lock().unwrap();
        let mut found: Vec<i64> = ranges
            .iter()
            .flat_map(|range| used.range(range.start()..=range.end()).copied())
            .collect();
        found.sort_unstable();
        found.dedup();
        std::future::ready(Ok(found))
    }
}
