//! TTL cache for read results.

use crate::provider::OperationOutput;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    output: OperationOutput,
    expires_at: Instant,
}

/// Read results keyed by [`crate::provider::Operation::cache_key`], each
/// with its own expiry.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry for `key`. Expired entries are evicted on access.
    pub fn get(&self, key: &str) -> Option<OperationOutput> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.output.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, output: OperationOutput, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key,
                Entry {
                    output,
                    expires_at: Instant::now() + ttl,
                },
            );
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_then_expiry() {
        let cache = ResultCache::new();
        cache.put("k".into(), OperationOutput::Exists(true), Duration::from_millis(30));
        assert_eq!(cache.get("k"), Some(OperationOutput::Exists(true)));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_is_not_stored() {
        let cache = ResultCache::new();
        cache.put("k".into(), OperationOutput::Exists(true), Duration::ZERO);
        assert!(cache.is_empty());
    }
}
