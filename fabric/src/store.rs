//! Bounded, age-evicting record storage.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use fabric_base::{Target, codec::StoredRecord};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{metrics::Metrics, policy::Accept};

#[derive(Debug)]
struct Entry {
    record: StoredRecord,
    stored_at: Instant,
}

/// Node-local records of one family, keyed by target.
///
/// Holds at most `max_size` records, dropping the least recently used one when full.
/// Records older than `max_age` are no longer returned and are removed by
/// [`RecordStore::evict`].
#[derive(Debug)]
pub struct RecordStore {
    name: &'static str,
    cache: Mutex<LruCache<Target, Entry>>,
    max_age: Duration,
    metrics: Arc<Metrics>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new(
        name: &'static str,
        max_size: NonZeroUsize,
        max_age: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name,
            cache: Mutex::new(LruCache::new(max_size)),
            max_age,
            metrics,
        }
    }

    /// The live record for `target`.
    pub fn get(&self, target: &Target) -> Option<StoredRecord> {
        let mut cache = self.cache.lock();
        let entry = cache.get(target)?;
        if entry.stored_at.elapsed() >= self.max_age {
            return None;
        }
        Some(entry.record.clone())
    }

    /// Runs a read-decide-write step for `target` under the store lock.
    ///
    /// `decide` sees the live record, if any. On [`Accept::First`] and [`Accept::Replace`]
    /// the candidate is written. On [`Accept::Identical`] the stored record is kept and its
    /// age is reset, so republishing keeps a record alive.
    pub fn upsert_with<E>(
        &self,
        target: Target,
        cand: StoredRecord,
        decide: impl FnOnce(Option<&StoredRecord>, &StoredRecord) -> Result<Accept, E>,
    ) -> Result<Accept, E> {
        let mut cache = self.cache.lock();
        let now = Instant::now();
        let existing = cache
            .get(&target)
            .filter(|entry| now.duration_since(entry.stored_at) < self.max_age)
            .map(|entry| &entry.record);
        let accept = decide(existing, &cand)?;
        if accept.writes() {
            trace!(store = self.name, %target, seq = cand.seq, "storing record");
            let evicted = cache.push(
                target,
                Entry {
                    record: cand,
                    stored_at: now,
                },
            );
            if matches!(evicted, Some((key, _)) if key != target) {
                self.metrics.records_evicted.inc();
            }
        } else if let Some(entry) = cache.get_mut(&target) {
            entry.stored_at = now;
        }
        Ok(accept)
    }

    /// Removes expired records, returning how many were dropped.
    pub fn evict(&self) -> usize {
        let mut cache = self.cache.lock();
        let expired: Vec<Target> = cache
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() >= self.max_age)
            .map(|(target, _)| *target)
            .collect();
        for target in &expired {
            cache.pop(target);
        }
        if !expired.is_empty() {
            debug!(store = self.name, count = expired.len(), "evicted expired records");
            self.metrics.records_evicted.inc_by(expired.len() as u64);
        }
        expired.len()
    }

    /// Number of records held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}
