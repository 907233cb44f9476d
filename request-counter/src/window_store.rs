//! The in-memory window of request timestamps.
//!
//! This is an unordered multiset of timestamps behind a single reader/writer
//! lock. Counting takes the read lock, so many readers can count at once.
//! Inserting and evicting take the write lock, which serializes all mutation.
//! Mutation happens once per request plus once per sweep, so the write lock is
//! not a hot spot.
//!
//! Order of the entries is not meaningful. Eviction swaps expired entries with
//! the last live entry and shrinks, so it never allocates.

use crate::timestamp::Timestamp;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Concurrent multiset of request timestamps.
#[derive(Debug, Default)]
pub struct WindowStore {
    inner: RwLock<Vec<Timestamp>>,
}

impl WindowStore {
    /// Make a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a store holding the given entries, e.g. a replayed log.
    pub fn from_entries(entries: Vec<Timestamp>) -> Self {
        Self {
            inner: RwLock::new(entries),
        }
    }

    /// Insert a timestamp.
    pub fn record(&self, ts: Timestamp) {
        self.write().push(ts);
    }

    /// Insert a timestamp and return the number of entries including it.
    ///
    /// Both happen under one write lock, so concurrent callers always observe
    /// distinct counts.
    pub fn record_and_count(&self, ts: Timestamp) -> usize {
        let mut guard = self.write();
        guard.push(ts);
        guard.len()
    }

    /// Get the number of entries currently retained.
    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Remove every entry strictly older than `cutoff`, returning how many were removed.
    ///
    /// An entry is expired when `now - ts > retention`, i.e. `ts < now - retention`,
    /// so callers pass `now - retention` as the cutoff.
    pub fn evict_older_than(&self, cutoff: Timestamp) -> usize {
        let mut guard = self.write();
        let before = guard.len();
        let mut idx = 0;
        let mut live = before;
        while idx < live {
            if guard[idx] < cutoff {
                live -= 1;
                guard.swap(idx, live);
            } else {
                idx += 1;
            }
        }
        guard.truncate(live);
        before - live
    }

    /// Copy out the current entries, in no particular order.
    pub fn snapshot(&self) -> Vec<Timestamp> {
        self.read().clone()
    }

    // The multiset has no invariant a panicking writer could break, so a
    // poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Timestamp>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Timestamp>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta};
    use std::{sync::Arc, thread};

    fn at(secs: i64) -> Timestamp {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_count_tracks_records_before_any_sweep() {
        let store = WindowStore::new();
        assert_eq!(store.count(), 0);

        for i in 0..10 {
            store.record(at(1000 + i));
            assert_eq!(store.count(), (i + 1) as usize);
        }
    }

    #[test]
    fn test_duplicates_are_kept() {
        let store = WindowStore::new();
        store.record(at(5));
        store.record(at(5));
        store.record(at(5));
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn test_evict_keeps_boundary_and_newer() {
        let store = WindowStore::from_entries(vec![at(0), at(10), at(70), at(9), at(11)]);

        // now = 70, retention = 60 -> cutoff = 10. Entries aged exactly 60s stay.
        let removed = store.evict_older_than(at(70) - TimeDelta::seconds(60));
        assert_eq!(removed, 2);

        let mut left = store.snapshot();
        left.sort();
        assert_eq!(left, vec![at(10), at(11), at(70)]);
    }

    #[test]
    fn test_evict_all_and_empty() {
        let store = WindowStore::from_entries(vec![at(1), at(2), at(3)]);
        assert_eq!(store.evict_older_than(at(100)), 3);
        assert_eq!(store.count(), 0);

        // An empty store is not an error
        assert_eq!(store.evict_older_than(at(200)), 0);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_evict_does_not_reallocate() {
        let store = WindowStore::from_entries((0..100).map(at).collect());
        let cap_before = store.read().capacity();

        assert_eq!(store.evict_older_than(at(50)), 50);
        assert_eq!(store.read().capacity(), cap_before);

        let mut left = store.snapshot();
        left.sort();
        assert_eq!(left, (50..100).map(at).collect::<Vec<_>>());
    }

    #[test]
    fn test_evict_interleaved_pattern() {
        // Alternate expired and live entries, including an expired entry at the end
        let entries = vec![at(1), at(100), at(2), at(101), at(3), at(102), at(4)];
        let store = WindowStore::from_entries(entries);

        assert_eq!(store.evict_older_than(at(50)), 4);
        let mut left = store.snapshot();
        left.sort();
        assert_eq!(left, vec![at(100), at(101), at(102)]);
    }

    #[test]
    fn test_concurrent_record_and_count_are_distinct() {
        let store = Arc::new(WindowStore::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    (0..250)
                        .map(|i| store.record_and_count(at(i)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen: Vec<usize> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        seen.sort_unstable();

        assert_eq!(seen, (1..=2000).collect::<Vec<_>>());
        assert_eq!(store.count(), 2000);
    }
}
