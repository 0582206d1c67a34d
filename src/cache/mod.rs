//! Concurrent merge cache with generation rotation.
//!
//! Producers fold samples into the current [`Generation`] under a
//! shared read lock; the flush cycle swaps in a fresh generation under
//! the write lock and walks the detached one without contending with
//! new arrivals. Within a generation the maps are sharded, so accepts
//! for different identities proceed in parallel while accepts for the
//! same identity serialize on its shard entry.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use anyhow::Result;

use crate::metric::recent::{BoundedRecentBuffer, RecordEntry};
use crate::metric::value::MetricValue;
use crate::metric::MetricIdentity;

/// Key of one record buffer: the record table plus the owning entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub metric: &'static str,
    pub entity_id: String,
}

/// One aggregation window's in-flight values.
pub struct Generation {
    metrics: DashMap<MetricIdentity, MetricValue>,
    records: DashMap<RecordKey, BoundedRecentBuffer>,
    record_capacity: usize,
}

impl Generation {
    fn new(shards: usize, record_capacity: usize) -> Self {
        Self {
            metrics: DashMap::with_capacity_and_shard_amount(256, shards),
            records: DashMap::with_capacity_and_shard_amount(64, shards),
            record_capacity,
        }
    }

    /// Merges a sample into the generation. The entry lock makes the
    /// read-modify-write atomic per identity.
    fn merge(&self, identity: MetricIdentity, value: MetricValue) -> Result<()> {
        match self.metrics.entry(identity) {
            Entry::Occupied(mut occupied) => occupied.get_mut().merge(&value),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                Ok(())
            }
        }
    }

    fn record(&self, key: RecordKey, entry: RecordEntry) {
        self.records
            .entry(key)
            .or_insert_with(|| BoundedRecentBuffer::new(self.record_capacity))
            .accept(entry);
    }

    /// Consumes the generation into plain vectors for the flush cycle.
    pub fn into_parts(self) -> (Vec<(MetricIdentity, MetricValue)>, Vec<(RecordKey, Vec<RecordEntry>)>) {
        let metrics = self.metrics.into_iter().collect();
        let records = self
            .records
            .into_iter()
            .map(|(key, mut buffer)| (key, buffer.drain()))
            .collect();
        (metrics, records)
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.records.is_empty()
    }
}

/// Shared cache front: many producers, one rotating consumer.
pub struct AggregationCache {
    current: RwLock<Generation>,
    shards: usize,
    record_capacity: usize,
}

impl AggregationCache {
    /// `shards` is rounded up to a power of two as the sharded maps
    /// require.
    pub fn new(shards: usize, record_capacity: usize) -> Self {
        let shards = shards.max(2).next_power_of_two();
        Self {
            current: RwLock::new(Generation::new(shards, record_capacity)),
            shards,
            record_capacity,
        }
    }

    /// Folds one metric sample into the current generation. Fails only
    /// on a value-kind collision, which callers drop and count.
    pub fn accept(&self, identity: MetricIdentity, value: MetricValue) -> Result<()> {
        let generation = self.current.read();
        generation.merge(identity, value)
    }

    /// Offers one record sample to its entity's bounded buffer.
    pub fn accept_record(&self, key: RecordKey, entry: RecordEntry) {
        let generation = self.current.read();
        generation.record(key, entry);
    }

    /// Swaps in an empty generation and returns the previous one. The
    /// write lock waits out in-flight accepts, so the detached
    /// generation can no longer change.
    pub fn rotate(&self) -> Generation {
        let mut guard = self.current.write();
        std::mem::replace(&mut *guard, Generation::new(self.shards, self.record_capacity))
    }

    pub fn metric_count(&self) -> usize {
        self.current.read().metric_count()
    }
}
