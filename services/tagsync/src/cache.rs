//! Live value cache: last value read per device tag

use crate::device::TagValue;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;

/// Written by ingestion, read concurrently by the status surface.
/// Last write wins per key.
///
/// A retired tag is kept out of the cache even while a running epoch still
/// reads it; the retired set is cleared when a new epoch starts.
#[derive(Debug, Default)]
pub struct LiveValueCache {
    values: DashMap<String, TagValue>,
    retired: DashSet<String>,
}

impl LiveValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, tag_id: &str, value: TagValue) {
        if self.is_retired(tag_id) {
            return;
        }
        self.values.insert(tag_id.to_string(), value);
        // lost a race with retire(): undo
        if self.is_retired(tag_id) {
            self.values.remove(tag_id);
        }
    }

    pub fn get(&self, tag_id: &str) -> Option<TagValue> {
        self.values.get(tag_id).map(|v| v.value().clone())
    }

    pub fn remove(&self, tag_id: &str) -> Option<TagValue> {
        self.values.remove(tag_id).map(|(_, v)| v)
    }

    /// Evict `tag_id` and refuse further updates for it
    pub fn retire(&self, tag_id: &str) -> Option<TagValue> {
        self.retired.insert(tag_id.to_string());
        self.remove(tag_id)
    }

    pub fn is_retired(&self, tag_id: &str) -> bool {
        self.retired.contains(tag_id)
    }

    pub fn clear_retired(&self) {
        self.retired.clear();
    }

    pub fn snapshot(&self) -> HashMap<String, TagValue> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_last_write_wins_and_eviction() {
        let cache = LiveValueCache::new();
        cache.update("T1", TagValue::Float(1.0));
        cache.update("T1", TagValue::Float(2.0));
        cache.update("T2", TagValue::Int(3));
        assert_eq!(cache.get("T1"), Some(TagValue::Float(2.0)));

        cache.remove("T1");
        let snapshot = cache.snapshot();
        assert!(!snapshot.contains_key("T1"));
        assert_eq!(snapshot.get("T2"), Some(&TagValue::Int(3)));
    }

    #[test]
    fn test_retired_tag_stays_evicted() {
        let cache = LiveValueCache::new();
        cache.update("T1", TagValue::Float(1.0));
        assert_eq!(cache.retire("T1"), Some(TagValue::Float(1.0)));

        cache.update("T1", TagValue::Float(2.0));
        assert!(cache.get("T1").is_none());
        assert!(cache.is_retired("T1"));

        cache.clear_retired();
        cache.update("T1", TagValue::Float(3.0));
        assert_eq!(cache.get("T1"), Some(TagValue::Float(3.0)));
    }

    #[tokio::test]
    async fn test_concurrent_writers_and_readers() {
        let cache = Arc::new(LiveValueCache::new());
        let mut handles = Vec::new();
        for i in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for n in 0..100 {
                    cache.update(&format!("T{i}"), TagValue::Int(n));
                    let _ = cache.snapshot();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get("T0"), Some(TagValue::Int(99)));
    }
}
