//! In-memory response cache.
//!
//! The gateway's lookup contract: exact-match memoisation keyed by the
//! normalised query text (lowercased, whitespace-collapsed, SHA-256 hashed).
//! Bounded capacity with least-recently-inserted eviction, hit/miss
//! counters, and an operator-facing clear. Anything smarter (semantic
//! lookup, embeddings) belongs to an external collaborator behind this same
//! get/put surface.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Default number of cached responses.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Bounded exact-match response cache. Share as `Arc<ResponseCache>`.
pub struct ResponseCache {
    capacity: usize,
    /// Key → response; insertion order tracked for eviction.
    entries: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Default)]
struct CacheState {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

/// Point-in-time cache statistics for `/cache/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key: SHA-256 of the normalised query.
    fn key(query: &str) -> String {
        let normalised = query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        hex::encode(Sha256::digest(normalised.as_bytes()))
    }

    /// Look up a response for a query.
    pub async fn get(&self, query: &str) -> Option<String> {
        let key = Self::key(query);
        let state = self.entries.lock().await;
        match state.map.get(&key) {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(response.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response, evicting the oldest entry at capacity.
    pub async fn put(&self, query: &str, response: &str) {
        let key = Self::key(query);
        let mut state = self.entries.lock().await;
        if !state.map.contains_key(&key) {
            if state.map.len() == self.capacity {
                if let Some(oldest) = state.order.pop_front() {
                    state.map.remove(&oldest);
                }
            }
            state.order.push_back(key.clone());
        }
        state.map.insert(key, response.to_string());
    }

    /// Drop every entry. Counters survive — they describe the session, not
    /// the current contents.
    pub async fn clear(&self) -> usize {
        let mut state = self.entries.lock().await;
        let dropped = state.map.len();
        state.map.clear();
        state.order.clear();
        dropped
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await.map.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries,
            capacity: self.capacity,
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}
