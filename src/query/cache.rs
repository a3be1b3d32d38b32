use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use crate::query::compiler::CompiledQuery;

/// Compiled queries keyed by raw input. Compilation is deterministic, so an
/// entry never goes stale.
pub struct QueryCache {
    cache: Mutex<LruCache<String, Vec<CompiledQuery>>>,
    capacity: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        QueryCache {
            cache: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, input: &str) -> Option<Vec<CompiledQuery>> {
        let mut cache = self.cache.lock();
        if let Some(compiled) = cache.get(input) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            Some(compiled.clone())
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, input: &str, compiled: Vec<CompiledQuery>) {
        self.cache.lock().put(input.to_string(), compiled);
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            size: self.cache.lock().len(),
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}
