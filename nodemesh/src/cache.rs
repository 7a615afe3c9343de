//! Federated search result cache
//!
//! Entries are keyed by the normalized query, the sorted set of nodes that
//! were asked and the canonical JSON of the search options. Payloads are
//! shared immutably, so a hit returns exactly what was stored.

use crate::federation::AggregatedResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache key: sha256 hex of the normalized lookup inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct CacheEntry {
    payload: Arc<AggregatedResult>,
    node_ids: Vec<String>,
    created_at: Instant,
    hits: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct ResultCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build the key for a lookup
    pub fn key(query: &str, node_ids: &[String], options: &Value) -> CacheKey {
        let mut ids: Vec<&str> = node_ids.iter().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut hasher = Sha256::new();
        hasher.update(normalize_text(query).as_bytes());
        hasher.update(b"\n");
        hasher.update(ids.join(",").as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_json(options).as_bytes());
        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<AggregatedResult>> {
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.created_at.elapsed() < self.ttl => {
                    entry.hits.fetch_add(1, Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache_lookup(true);
                    return Some(Arc::clone(&entry.payload));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write();
            if entries
                .get(key)
                .map(|e| e.created_at.elapsed() >= self.ttl)
                .unwrap_or(false)
            {
                entries.remove(key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(false);
        None
    }

    /// Store a result. A later write for the same key replaces the earlier one.
    pub fn put(&self, key: CacheKey, node_ids: Vec<String>, result: Arc<AggregatedResult>) {
        let mut entries = self.entries.write();
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                payload: result,
                node_ids,
                created_at: Instant::now(),
                hits: AtomicU64::new(0),
            },
        );
    }

    /// Drop every entry that involved the node
    pub fn invalidate_node(&self, node_id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.node_ids.iter().any(|id| id == node_id));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Invalidated {} cached result(s) involving node {}", removed, node_id);
        }
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| e.created_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times an entry has been served
    pub fn entry_hits(&self, key: &CacheKey) -> Option<u64> {
        self.entries
            .read()
            .get(key)
            .map(|e| e.hits.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.len(),
            max_entries: self.max_entries,
            ttl_secs: self.ttl.as_secs(),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Lowercase and collapse runs of whitespace to one space
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// JSON with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*k).clone()).to_string());
                    out.push(':');
                    write(&map[k.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(query: &str) -> Arc<AggregatedResult> {
        Arc::new(AggregatedResult {
            query: query.to_string(),
            ..AggregatedResult::default()
        })
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_normalization() {
        let a = ResultCache::key("Rust  Async\tRuntime", &ids(&["b", "a"]), &json!({"x": 1, "y": 2}));
        let b = ResultCache::key("rust async runtime", &ids(&["a", "b", "a"]), &json!({"y": 2, "x": 1}));
        assert_eq!(a, b);

        let c = ResultCache::key("rust async runtime", &ids(&["a"]), &json!({"x": 1, "y": 2}));
        assert_ne!(a, c);
    }

    #[test]
    fn test_get_returns_same_payload() {
        let cache = ResultCache::new(Duration::from_secs(60), 10);
        let key = ResultCache::key("q", &ids(&["a"]), &Value::Null);
        let stored = result("q");
        cache.put(key.clone(), ids(&["a"]), Arc::clone(&stored));

        let hit = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&hit, &stored));
        assert_eq!(cache.entry_hits(&key), Some(1));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_expired_entry_removed() {
        let cache = ResultCache::new(Duration::from_millis(10), 10);
        let key = ResultCache::key("q", &[], &Value::Null);
        cache.put(key.clone(), vec![], result("q"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_invalidate_node() {
        let cache = ResultCache::new(Duration::from_secs(60), 10);
        cache.put(ResultCache::key("a", &ids(&["n1"]), &Value::Null), ids(&["n1"]), result("a"));
        cache.put(ResultCache::key("b", &ids(&["n1", "n2"]), &Value::Null), ids(&["n1", "n2"]), result("b"));
        cache.put(ResultCache::key("c", &ids(&["n2"]), &Value::Null), ids(&["n2"]), result("c"));

        assert_eq!(cache.invalidate_node("n1"), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        let k1 = ResultCache::key("one", &[], &Value::Null);
        let k2 = ResultCache::key("two", &[], &Value::Null);
        let k3 = ResultCache::key("three", &[], &Value::Null);
        cache.put(k1.clone(), vec![], result("one"));
        std::thread::sleep(Duration::from_millis(2));
        cache.put(k2.clone(), vec![], result("two"));
        std::thread::sleep(Duration::from_millis(2));
        cache.put(k3.clone(), vec![], result("three"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn test_purge_expired() {
        let cache = ResultCache::new(Duration::from_millis(10), 10);
        cache.put(ResultCache::key("a", &[], &Value::Null), vec![], result("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.purge_expired(), 1);
    }

    #[test]
    fn test_canonical_json_nested() {
        let v = json!({"b": [{"z": 1, "a": 2}], "a": "x"});
        assert_eq!(canonical_json(&v), r#"{"a":"x","b":[{"a":2,"z":1}]}"#);
    }
}
