//! Response cache (C14, §4.14): bounded, approximate LFU+LRU eviction
//! keyed by operation name plus normalized parameters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    inserted_at: Instant,
    last_used_at: Instant,
    hit_count: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    size_bytes: usize,
}

pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_size_bytes: usize,
    max_entries: usize,
    ttl: Duration,

    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub keys_added: AtomicU64,
    pub evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_size_bytes: usize, max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: HashMap::new(), size_bytes: 0 }),
            max_size_bytes,
            max_entries,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            keys_added: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Normalized key: operation name plus a stable, sorted parameter
    /// string. `with_positions` is part of the key so positioned and
    /// unpositioned responses never collide.
    pub fn key(operation: &str, params: &str, with_positions: bool) -> String {
        format!("{operation}|{params}|pos={with_positions}")
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.inserted_at.elapsed() > self.ttl {
            let removed = inner.entries.remove(key).unwrap();
            inner.size_bytes -= removed.value.len();
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.last_used_at = Instant::now();
        entry.hit_count += 1;
        let value = entry.value.clone();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    pub fn put(&self, key: String, value: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(old) = inner.entries.remove(&key) {
            inner.size_bytes -= old.value.len();
        }

        while (inner.size_bytes + value.len() > self.max_size_bytes
            || inner.entries.len() >= self.max_entries)
            && !inner.entries.is_empty()
        {
            self.evict_one(&mut inner);
        }

        let size = value.len();
        inner.entries.insert(
            key,
            Entry { value, inserted_at: Instant::now(), last_used_at: Instant::now(), hit_count: 0 },
        );
        inner.size_bytes += size;
        self.keys_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Approximate LFU+LRU: picks the entry with the lowest hit count,
    /// breaking ties by oldest last-use. Not a strict global minimum
    /// search across very large caches, but exact enough at the
    /// configured bounds (§4.14 "approximate, not strict").
    fn evict_one(&self, inner: &mut Inner) {
        let victim = inner
            .entries
            .iter()
            .min_by(|a, b| {
                a.1.hit_count
                    .cmp(&b.1.hit_count)
                    .then(a.1.last_used_at.cmp(&b.1.last_used_at))
            })
            .map(|(k, _)| k.clone());

        if let Some(key) = victim {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.size_bytes -= entry.value.len();
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.size_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            keys_added: self.keys_added.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size_bytes: inner.size_bytes as u64,
            items: inner.entries.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub keys_added: u64,
    pub evictions: u64,
    pub size_bytes: u64,
    pub items: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_when_entry_cap_exceeded() {
        let cache = ResponseCache::new(1_000_000, 2, Duration::from_secs(60));
        cache.put("a".into(), vec![1]);
        cache.put("b".into(), vec![2]);
        cache.put("c".into(), vec![3]);
        assert_eq!(cache.stats().items, 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn invalidate_clears_everything() {
        let cache = ResponseCache::new(1_000_000, 100, Duration::from_secs(60));
        cache.put("a".into(), vec![1]);
        cache.invalidate();
        assert_eq!(cache.stats().items, 0);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn distinct_keys_for_positions_flag() {
        let k1 = ResponseCache::key("get_graph", "max_nodes=10", true);
        let k2 = ResponseCache::key("get_graph", "max_nodes=10", false);
        assert_ne!(k1, k2);
    }
}
