//! Bucketed priority queue whose elements can move between buckets while queued.
//!
//! Bucket 0 is dequeued first, FIFO within a bucket. Each bucket is a
//! `SkipMap` keyed by insertion sequence, so moving or removing an element
//! unlinks it from its bucket instead of leaving a stale entry behind.
//!
//! The element → slot map is sharded by hash. Every change to an element's
//! bucket entry happens under its shard lock, so an element is in at most one
//! bucket and a dequeue claims it exactly once.

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::error::QueueError;

/// Bucket count used by [`DynamicPriorityQueue::new`]: the maximum view
/// distance (32) plus three.
pub const DEFAULT_MAX_PRIORITY: usize = 32 + 3;

const SHARDS: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Slot {
    priority: usize,
    seq: u64,
}

type Shard<E> = Mutex<FxHashMap<E, Slot>>;

pub struct DynamicPriorityQueue<E> {
    buckets: Box<[SkipMap<u64, E>]>,
    shards: Box<[Shard<E>]>,
    len: AtomicUsize,
    seq: AtomicU64,
}

impl<E: Eq + Hash + Clone + Send + 'static> Default for DynamicPriorityQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Eq + Hash + Clone + Send + 'static> DynamicPriorityQueue<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_priority(DEFAULT_MAX_PRIORITY)
    }

    /// Queue with priorities `0..max_priority`.
    ///
    /// # Panics
    /// If `max_priority` is zero.
    #[must_use]
    pub fn with_max_priority(max_priority: usize) -> Self {
        assert!(max_priority > 0, "priority queue needs at least one bucket");
        Self {
            buckets: (0..max_priority).map(|_| SkipMap::new()).collect(),
            shards: (0..SHARDS).map(|_| Mutex::default()).collect(),
            len: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of buckets; valid priorities are `0..max_priority()`.
    #[must_use]
    pub fn max_priority(&self) -> usize {
        self.buckets.len()
    }

    fn check(&self, priority: usize) -> Result<(), QueueError> {
        if priority < self.buckets.len() {
            Ok(())
        } else {
            Err(QueueError::PriorityOutOfRange {
                priority,
                max: self.buckets.len(),
            })
        }
    }

    fn shard(&self, element: &E) -> MutexGuard<'_, FxHashMap<E, Slot>> {
        let hash = FxBuildHasher.hash_one(element);
        self.shards[(hash as usize) % SHARDS].lock()
    }

    /// Link `element` into `priority`'s bucket. Caller holds its shard.
    fn link(&self, element: E, priority: usize) -> Slot {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.buckets[priority].insert(seq, element);
        Slot { priority, seq }
    }

    /// Queue `element` at `priority`.
    ///
    /// # Panics
    /// If `element` is already queued or `priority` is out of range.
    pub fn enqueue(&self, element: E, priority: usize) {
        if let Err(err) = self.try_enqueue(element, priority) {
            panic!("{err}");
        }
    }

    /// Queue `element` at `priority`, rejecting duplicates and bad priorities.
    pub fn try_enqueue(&self, element: E, priority: usize) -> Result<(), QueueError> {
        self.check(priority)?;
        let mut shard = self.shard(&element);
        if shard.contains_key(&element) {
            return Err(QueueError::Duplicate);
        }
        let slot = self.link(element.clone(), priority);
        shard.insert(element, slot);
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Move a queued element to `priority`, behind the elements already there.
    ///
    /// Returns `false` if the element is not queued (possibly dequeued
    /// concurrently) or already has that priority.
    ///
    /// # Panics
    /// If `priority` is out of range.
    pub fn change_priority(&self, element: &E, priority: usize) -> bool {
        if let Err(err) = self.check(priority) {
            panic!("{err}");
        }
        let mut shard = self.shard(element);
        let Some(slot) = shard.get_mut(element) else {
            return false;
        };
        if slot.priority == priority {
            return false;
        }
        self.buckets[slot.priority].remove(&slot.seq);
        *slot = self.link(element.clone(), priority);
        true
    }

    /// Remove and return the oldest element of the lowest non-empty bucket.
    pub fn dequeue(&self) -> Option<E> {
        for bucket in &*self.buckets {
            while let Some(entry) = bucket.front() {
                let element = entry.value().clone();
                let mut shard = self.shard(&element);
                // A mismatch means the entry was unlinked after we saw it.
                if shard.get(&element).is_some_and(|slot| slot.seq == *entry.key()) {
                    shard.remove(&element);
                    entry.remove();
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return Some(element);
                }
            }
        }
        None
    }

    #[must_use]
    pub fn contains(&self, element: &E) -> bool {
        self.shard(element).contains_key(element)
    }

    /// Current priority of a queued element.
    #[must_use]
    pub fn priority_of(&self, element: &E) -> Option<usize> {
        self.shard(element).get(element).map(|slot| slot.priority)
    }

    /// Remove a queued element. Returns `false` if it was not queued.
    pub fn remove(&self, element: &E) -> bool {
        let mut shard = self.shard(element);
        let Some(slot) = shard.remove(element) else {
            return false;
        };
        self.buckets[slot.priority].remove(&slot.seq);
        self.len.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Number of queued elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Dequeue everything, in priority order.
    pub fn drain(&self) -> Vec<E> {
        std::iter::from_fn(|| self.dequeue()).collect()
    }

    /// Entries physically linked into buckets, live or not.
    #[cfg(test)]
    pub(crate) fn linked_entries(&self) -> usize {
        self.buckets.iter().map(SkipMap::len).sum()
    }
}

impl<E> std::fmt::Debug for DynamicPriorityQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets: Vec<usize> = self.buckets.iter().map(SkipMap::len).collect();
        f.debug_struct("DynamicPriorityQueue")
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("buckets", &buckets)
            .finish_non_exhaustive()
    }
}
