//! Bounded response cache with time-based eviction.
//!
//! Eviction is a periodic global sweep, not a per-key timer:
//! - `get()` ignores stale entries but leaves them in place
//! - `sweep()` removes everything older than `max_age`
//! - on insert at capacity, an opportunistic sweep runs first, then the
//!   oldest entry is evicted if still full

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub stored_at: Instant,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    max_age: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(max_age: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_age,
            max_entries: max_entries.max(1),
        }
    }

    /// Key for an operation when the caller supplied none. Object keys are
    /// sorted, so equal arguments give equal keys.
    pub fn derive_key(integration: &str, op: &str, args: &Value) -> String {
        let mut key = Self::prefix(integration);
        key.push_str(op);
        key.push(':');
        write_canonical(&mut key, args);
        key
    }

    /// Caller-supplied keys are namespaced too, so per-integration
    /// invalidation reaches them.
    pub fn scoped_key(integration: &str, key: &str) -> String {
        format!("{}{key}", Self::prefix(integration))
    }

    /// Shared prefix of every key belonging to `integration`.
    pub fn prefix(integration: &str) -> String {
        format!("{integration}:")
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.stored_at) <= self.max_age
    }

    pub fn get(&self, key: &str, now: Instant) -> Option<Value> {
        self.entries
            .get(key)
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, key: String, value: Value, now: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.sweep(now);
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            if let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest_key);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
            },
        );
    }

    /// Drop every entry older than `max_age`; returns how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let max_age = self.max_age;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) <= max_age);
        before - self.entries.len()
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(max_entries: usize) -> ResponseCache {
        ResponseCache::new(Duration::from_secs(60), max_entries)
    }

    #[test]
    fn stale_entries_are_skipped_but_kept_until_sweep() {
        let mut cache = cache(8);
        let t0 = Instant::now();
        cache.insert("k".into(), json!(1), t0);

        assert_eq!(cache.get("k", t0 + Duration::from_secs(60)), Some(json!(1)));
        assert_eq!(cache.get("k", t0 + Duration::from_secs(61)), None);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.sweep(t0 + Duration::from_secs(61)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_evicts_oldest() {
        let mut cache = cache(2);
        let t0 = Instant::now();
        cache.insert("a".into(), json!("a"), t0);
        cache.insert("b".into(), json!("b"), t0 + Duration::from_secs(1));
        cache.insert("c".into(), json!("c"), t0 + Duration::from_secs(2));

        let now = t0 + Duration::from_secs(3);
        assert_eq!(cache.get("a", now), None);
        assert_eq!(cache.get("b", now), Some(json!("b")));
        assert_eq!(cache.get("c", now), Some(json!("c")));
    }

    #[test]
    fn full_cache_prefers_sweeping_expired() {
        let mut cache = cache(2);
        let t0 = Instant::now();
        cache.insert("old".into(), json!(0), t0);
        cache.insert("recent".into(), json!(1), t0 + Duration::from_secs(90));
        cache.insert("new".into(), json!(2), t0 + Duration::from_secs(100));

        assert_eq!(cache.len(), 2);
        let now = t0 + Duration::from_secs(100);
        assert_eq!(cache.get("recent", now), Some(json!(1)));
        assert_eq!(cache.get("new", now), Some(json!(2)));
    }

    #[test]
    fn overwrite_at_capacity_does_not_evict() {
        let mut cache = cache(2);
        let t0 = Instant::now();
        cache.insert("a".into(), json!(1), t0);
        cache.insert("b".into(), json!(2), t0);
        cache.insert("a".into(), json!(3), t0);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b", t0), Some(json!(2)));
    }

    #[test]
    fn invalidate_prefix_only_touches_one_integration() {
        let mut cache = cache(8);
        let t0 = Instant::now();
        let read = ResponseCache::derive_key("spreadsheet", "read", &json!({ "range": "A1" }));
        let custom = ResponseCache::scoped_key("spreadsheet", "monthly-report");
        let balance = ResponseCache::derive_key("sms", "balance", &json!(null));
        cache.insert(read.clone(), json!(1), t0);
        cache.insert(custom.clone(), json!(2), t0);
        cache.insert(balance.clone(), json!(3), t0);

        assert_eq!(cache.invalidate_prefix(&ResponseCache::prefix("spreadsheet")), 2);
        assert_eq!(cache.get(&read, t0), None);
        assert_eq!(cache.get(&custom, t0), None);
        assert_eq!(cache.get(&balance, t0), Some(json!(3)));
    }

    #[test]
    fn derived_keys_ignore_argument_order() {
        let a = ResponseCache::derive_key("spreadsheet", "read", &json!({ "range": "A1", "id": "x" }));
        let b = ResponseCache::derive_key("spreadsheet", "read", &json!({ "id": "x", "range": "A1" }));
        assert_eq!(a, b);
    }
}
