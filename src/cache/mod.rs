//! Content-keyed result cache for agent calls.
//!
//! Keys are a deterministic hash over the agent role plus a canonicalized
//! (key-order-independent) serialization of the stage context, so logically
//! identical inputs collapse to one cached computation. This is what makes
//! repeated revise-loop iterations safe without redundant backend calls.
//! A cache miss is control flow, not an error.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::agent::AgentRole;
use crate::core::errors::{ForemanError, Result};

#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    /// Maximum number of entries; inserting past this evicts the oldest.
    pub max_entries: usize,
    /// Time-to-live measured from `stored_at`.
    pub ttl: Duration,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl ResultCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(ForemanError::configuration("max_entries cannot be zero"));
        }
        if self.ttl.is_zero() {
            return Err(ForemanError::configuration("ttl cannot be zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

/// Cache hit/miss/eviction counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<u64, CacheEntry>,
    config: ResultCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    pub fn new(config: ResultCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            entries: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Look up a cached outcome. Expired entries are evicted on read.
    pub fn get(&self, role: AgentRole, context: &Value) -> Option<Value> {
        let key = cache_key(role, context);
        if let Some(entry) = self.entries.get(&key) {
            if entry.stored_at.elapsed() > self.config.ttl {
                drop(entry);
                self.entries.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(role = %role, "Cache entry expired");
                return None;
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite. At capacity, the single oldest-by-`stored_at`
    /// entry is evicted before a new key goes in.
    pub fn set(&self, role: AgentRole, context: &Value, value: Value) {
        let key = cache_key(role, context);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_entries {
            // Bind the key first so no shard guard is held across the remove.
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().stored_at)
                .map(|entry| *entry.key());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            eviction_count: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Deterministic key over role and canonicalized context.
fn cache_key(role: AgentRole, context: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    role.as_str().hash(&mut hasher);
    canonical_json(context).hash(&mut hasher);
    hasher.finish()
}

/// Canonical serialization: object keys sorted recursively so field order
/// in nested maps never changes the key.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}
