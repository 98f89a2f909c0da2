// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The beacon cache (C3): a thread-safe, per-session payload store with a
//! chunking protocol that hands out transmission-sized slices while
//! guaranteeing at-most-once delivery under crash-free operation and
//! at-least-once re-queueing on send failure.
//!
//! Locking discipline: the global map uses a reader-writer lock (read for
//! lookup, write for insert/remove); each entry has its own mutex guarding
//! its four lists and `total_bytes`. Acquisition order is always
//! global-read-or-write, then entry — never the reverse, and never held
//! across I/O.

pub mod evictor;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, RwLock,
    },
};

pub use rum_protocol::BeaconKey;
use tracing::{debug, span, Level};

/// A single instrumentation record. Immutable after construction except for
/// `marked_for_sending`, which only a chunking snapshot mutates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp: i64,
    pub data: String,
    pub marked_for_sending: bool,
}

impl Record {
    pub fn new(timestamp: i64, data: String) -> Self {
        Record { timestamp, data, marked_for_sending: false }
    }

    pub fn size_in_bytes(&self) -> i64 {
        self.data.len() as i64
    }
}

/// Per-key bucket: two active queues, two in-flight snapshot queues, and a
/// running byte total over the active queues only.
#[derive(Debug, Default)]
struct CacheEntry {
    events: VecDeque<Record>,
    actions: VecDeque<Record>,
    events_being_sent: VecDeque<Record>,
    actions_being_sent: VecDeque<Record>,
    total_bytes: i64,
}

impl CacheEntry {
    fn has_snapshot_in_flight(&self) -> bool {
        !self.events_being_sent.is_empty() || !self.actions_being_sent.is_empty()
    }

    fn has_active_data(&self) -> bool {
        !self.events.is_empty() || !self.actions.is_empty()
    }
}

/// Proof that `prepare_chunk_snapshot` succeeded for a given key. Callers
/// that only need to know "is a snapshot in flight" can hold this as an
/// `Option<ChunkHandle>`; the chunking operations themselves are keyed.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHandle {
    key: BeaconKey,
}

impl ChunkHandle {
    pub fn key(&self) -> BeaconKey {
        self.key
    }
}

/// Global beacon cache, shared by instrumentation threads, the sender, and
/// the evictor.
pub struct BeaconCache {
    entries: RwLock<HashMap<BeaconKey, Arc<Mutex<CacheEntry>>>>,
    global_bytes: AtomicI64,
}

impl BeaconCache {
    pub fn new() -> Self {
        BeaconCache { entries: RwLock::new(HashMap::new()), global_bytes: AtomicI64::new(0) }
    }

    pub fn num_bytes_in_cache(&self) -> i64 {
        self.global_bytes.load(Ordering::Relaxed)
    }

    pub fn get_beacon_keys(&self) -> Vec<BeaconKey> {
        let entries = self.entries.read().unwrap();
        entries.keys().copied().collect()
    }

    pub fn is_empty(&self, key: &BeaconKey) -> bool {
        let Some(entry) = self.lookup(key) else { return true };
        let entry = entry.lock().unwrap();
        !entry.has_active_data() && !entry.has_snapshot_in_flight()
    }

    pub fn add_event(&self, key: BeaconKey, timestamp: i64, data: String) {
        self.append(key, timestamp, data, true);
    }

    pub fn add_action(&self, key: BeaconKey, timestamp: i64, data: String) {
        self.append(key, timestamp, data, false);
    }

    fn append(&self, key: BeaconKey, timestamp: i64, data: String, is_event: bool) {
        let entry_arc = self.get_or_create_entry(key);
        let record = Record::new(timestamp, data);
        let added_bytes = record.size_in_bytes();
        {
            let _s = span!(Level::DEBUG, "lock(cache_entry)").entered();
            let mut entry = entry_arc.lock().unwrap();
            if is_event {
                entry.events.push_back(record);
            } else {
                entry.actions.push_back(record);
            }
            entry.total_bytes += added_bytes;
        }
        self.global_bytes.fetch_add(added_bytes, Ordering::Relaxed);
    }

    fn lookup(&self, key: &BeaconKey) -> Option<Arc<Mutex<CacheEntry>>> {
        let entries = self.entries.read().unwrap();
        entries.get(key).cloned()
    }

    fn get_or_create_entry(&self, key: BeaconKey) -> Arc<Mutex<CacheEntry>> {
        {
            let entries = self.entries.read().unwrap();
            if let Some(entry) = entries.get(&key) {
                return Arc::clone(entry);
            }
        }
        let _s = span!(Level::DEBUG, "lock(cache_entries_write)").entered();
        let mut entries = self.entries.write().unwrap();
        Arc::clone(entries.entry(key).or_insert_with(|| {
            debug!(?key, "created cache entry");
            Arc::new(Mutex::new(CacheEntry::default()))
        }))
    }

    pub fn delete_cache_entry(&self, key: &BeaconKey) {
        let removed = {
            let _s = span!(Level::DEBUG, "lock(cache_entries_write)").entered();
            let mut entries = self.entries.write().unwrap();
            entries.remove(key)
        };
        if let Some(entry_arc) = removed {
            let entry = entry_arc.lock().unwrap();
            let freed = entry.total_bytes;
            drop(entry);
            self.global_bytes.fetch_sub(freed, Ordering::Relaxed);
            debug!(?key, freed, "deleted cache entry");
        }
    }

    pub fn prepare_chunk_snapshot(&self, key: &BeaconKey) -> Option<ChunkHandle> {
        let entry_arc = self.lookup(key)?;
        let mut entry = entry_arc.lock().unwrap();
        if entry.has_snapshot_in_flight() || !entry.has_active_data() {
            return None;
        }
        entry.events_being_sent = std::mem::take(&mut entry.events);
        entry.actions_being_sent = std::mem::take(&mut entry.actions);
        let moved_bytes = entry.total_bytes;
        entry.total_bytes = 0;
        drop(entry);
        self.global_bytes.fetch_sub(moved_bytes, Ordering::Relaxed);
        Some(ChunkHandle { key: *key })
    }

    pub fn next_chunk(&self, key: &BeaconKey, prefix: &str, max_bytes: usize, delimiter: &str) -> String {
        let Some(entry_arc) = self.lookup(key) else { return String::new() };
        let mut entry = entry_arc.lock().unwrap();
        if !entry.has_snapshot_in_flight() {
            return String::new();
        }

        let nothing_left =
            entry.events_being_sent.iter().chain(entry.actions_being_sent.iter()).all(|r| r.marked_for_sending);
        if nothing_left {
            // Every record in this snapshot was already handed out by an
            // earlier call and never committed or rolled back; there's
            // nothing left to chunk. End the snapshot here rather than
            // leaving it in flight forever.
            entry.events_being_sent.clear();
            entry.actions_being_sent.clear();
            return String::new();
        }

        let mut chunk = String::from(prefix);
        let entry = &mut *entry;
        for record in entry.events_being_sent.iter_mut().chain(entry.actions_being_sent.iter_mut()) {
            if record.marked_for_sending {
                continue;
            }
            let addition = delimiter.len() + record.data.len();
            if chunk.len() + addition > max_bytes {
                break;
            }
            chunk.push_str(delimiter);
            chunk.push_str(&record.data);
            record.marked_for_sending = true;
        }
        chunk
    }

    pub fn commit_chunk(&self, key: &BeaconKey) {
        let Some(entry_arc) = self.lookup(key) else { return };
        let mut entry = entry_arc.lock().unwrap();
        entry.events_being_sent.retain(|r| !r.marked_for_sending);
        if entry.events_being_sent.is_empty() {
            entry.actions_being_sent.retain(|r| !r.marked_for_sending);
        }
    }

    pub fn rollback_chunk(&self, key: &BeaconKey) {
        let Some(entry_arc) = self.lookup(key) else { return };
        let mut entry = entry_arc.lock().unwrap();
        let mut restored_bytes = 0i64;

        while let Some(mut record) = entry.events_being_sent.pop_back() {
            record.marked_for_sending = false;
            restored_bytes += record.size_in_bytes();
            entry.events.push_front(record);
        }
        while let Some(mut record) = entry.actions_being_sent.pop_back() {
            record.marked_for_sending = false;
            restored_bytes += record.size_in_bytes();
            entry.actions.push_front(record);
        }

        entry.total_bytes += restored_bytes;
        drop(entry);
        self.global_bytes.fetch_add(restored_bytes, Ordering::Relaxed);
    }

    pub fn evict_by_age(&self, key: &BeaconKey, min_timestamp: i64) -> usize {
        let Some(entry_arc) = self.lookup(key) else { return 0 };
        let mut entry = entry_arc.lock().unwrap();
        let mut removed = 0usize;
        let mut freed_bytes = 0i64;

        let entry_ref = &mut *entry;
        for list in [&mut entry_ref.events, &mut entry_ref.actions] {
            let before = list.len();
            let mut kept = VecDeque::with_capacity(before);
            while let Some(record) = list.pop_front() {
                if record.timestamp < min_timestamp {
                    freed_bytes += record.size_in_bytes();
                } else {
                    kept.push_back(record);
                }
            }
            removed += before - kept.len();
            *list = kept;
        }

        entry_ref.total_bytes -= freed_bytes;
        drop(entry);
        self.global_bytes.fetch_sub(freed_bytes, Ordering::Relaxed);
        removed
    }

    pub fn evict_by_number(&self, key: &BeaconKey, n: usize) -> usize {
        let Some(entry_arc) = self.lookup(key) else { return 0 };
        let mut entry = entry_arc.lock().unwrap();
        let mut removed = 0usize;
        let mut freed_bytes = 0i64;

        for _ in 0..n {
            let take_events = match (entry.events.front(), entry.actions.front()) {
                (Some(e), Some(a)) => e.timestamp <= a.timestamp,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let popped =
                if take_events { entry.events.pop_front() } else { entry.actions.pop_front() };
            match popped {
                Some(record) => {
                    freed_bytes += record.size_in_bytes();
                    removed += 1;
                }
                None => break,
            }
        }

        entry.total_bytes -= freed_bytes;
        drop(entry);
        self.global_bytes.fetch_sub(freed_bytes, Ordering::Relaxed);
        removed
    }
}

impl Default for BeaconCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> BeaconKey {
        BeaconKey::new(7, 0)
    }

    #[test]
    fn s1_basic_send() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 100, "e1".to_string());
        cache.add_action(key(), 101, "a1".to_string());
        assert_eq!(cache.num_bytes_in_cache(), 4);

        let handle = cache.prepare_chunk_snapshot(&key()).expect("snapshot");
        assert_eq!(handle.key(), key());
        let chunk = cache.next_chunk(&key(), "PFX", 1024, "&");
        assert_eq!(chunk, "PFX&e1&a1");
        cache.commit_chunk(&key());

        assert_eq!(cache.next_chunk(&key(), "PFX", 1024, "&"), "");
        assert_eq!(cache.num_bytes_in_cache(), 0);
        assert!(cache.is_empty(&key()));
    }

    #[test]
    fn s2_rollback_restores_order_and_bytes() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 100, "e1".to_string());
        cache.add_action(key(), 101, "a1".to_string());
        cache.prepare_chunk_snapshot(&key()).unwrap();
        cache.next_chunk(&key(), "PFX", 1024, "&");

        cache.rollback_chunk(&key());

        assert_eq!(cache.num_bytes_in_cache(), 4);
        // re-snapshot to inspect active-list order without mutating it twice
        let handle = cache.prepare_chunk_snapshot(&key()).unwrap();
        assert_eq!(handle.key(), key());
        assert_eq!(cache.next_chunk(&key(), "", 1024, "&"), "&e1&a1");
    }

    #[test]
    fn snapshot_isolation_active_writes_not_visible_in_flight() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 100, "e1".to_string());
        cache.prepare_chunk_snapshot(&key()).unwrap();

        cache.add_event(key(), 200, "e2".to_string());

        let chunk = cache.next_chunk(&key(), "", 1024, "&");
        assert_eq!(chunk, "&e1");
        assert_eq!(cache.num_bytes_in_cache(), 2); // only e2, still active
    }

    #[test]
    fn prepare_then_rollback_is_a_no_op() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 1, "x".to_string());
        cache.prepare_chunk_snapshot(&key()).unwrap();
        cache.rollback_chunk(&key());
        assert_eq!(cache.num_bytes_in_cache(), 1);
        assert!(cache.prepare_chunk_snapshot(&key()).is_some());
    }

    #[test]
    fn prepare_chunk_snapshot_rejects_concurrent_snapshot() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 1, "x".to_string());
        assert!(cache.prepare_chunk_snapshot(&key()).is_some());
        assert!(cache.prepare_chunk_snapshot(&key()).is_none());
    }

    #[test]
    fn prepare_chunk_snapshot_none_for_unknown_key() {
        let cache = BeaconCache::new();
        assert!(cache.prepare_chunk_snapshot(&key()).is_none());
    }

    #[test]
    fn next_chunk_with_max_bytes_equal_to_prefix_returns_prefix() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 1, "e1".to_string());
        cache.prepare_chunk_snapshot(&key()).unwrap();
        let chunk = cache.next_chunk(&key(), "PFX", 3, "&");
        assert_eq!(chunk, "PFX");
    }

    #[test]
    fn eviction_never_touches_in_flight() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 1, "old".to_string());
        cache.prepare_chunk_snapshot(&key()).unwrap();
        cache.add_event(key(), 1000, "new".to_string());

        let removed = cache.evict_by_age(&key(), 500);
        assert_eq!(removed, 0); // "new" is after min_timestamp; "old" is in flight
        assert_eq!(cache.num_bytes_in_cache(), 3);
    }

    #[test]
    fn evict_by_number_ties_favor_events() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 1, "e".to_string());
        cache.add_action(key(), 1, "a".to_string());
        let removed = cache.evict_by_number(&key(), 1);
        assert_eq!(removed, 1);
        cache.prepare_chunk_snapshot(&key()).unwrap();
        assert_eq!(cache.next_chunk(&key(), "", 1024, ""), "a");
    }

    #[test]
    fn next_chunk_called_twice_without_commit_ends_the_snapshot() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 1, "e1".to_string());
        cache.prepare_chunk_snapshot(&key()).unwrap();

        let first = cache.next_chunk(&key(), "", 1024, "&");
        assert_eq!(first, "&e1");

        // called again before commit_chunk or rollback_chunk: every record
        // is already marked, so the snapshot must end here instead of
        // returning the bare prefix forever.
        let second = cache.next_chunk(&key(), "PFX", 1024, "&");
        assert_eq!(second, "");
        assert!(cache.is_empty(&key()));
    }

    #[test]
    fn delete_cache_entry_frees_global_bytes() {
        let cache = BeaconCache::new();
        cache.add_event(key(), 1, "e1".to_string());
        cache.delete_cache_entry(&key());
        assert_eq!(cache.num_bytes_in_cache(), 0);
        assert!(cache.is_empty(&key()));
    }
}
