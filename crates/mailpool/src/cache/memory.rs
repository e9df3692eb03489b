//! Bounded, time-expiring memory tier

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::CacheKey;

struct MemoryEntry {
    payload: Arc<[u8]>,
    inserted_at: Instant,
}

/// LRU map of raw payloads with a fixed time-to-live
///
/// Expired entries are dropped lazily when looked up.
pub struct MemoryTier {
    entries: Mutex<LruCache<CacheKey, MemoryEntry>>,
    ttl: Duration,
}

impl MemoryTier {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                Some(Arc::clone(&entry.payload))
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: CacheKey, payload: &[u8]) {
        self.lock().put(
            key,
            MemoryEntry {
                payload: Arc::from(payload),
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.lock().pop(key).is_some()
    }

    /// Drop every entry of `account`, returning how many went
    pub fn remove_account(&self, account: &str) -> usize {
        let mut entries = self.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.account == account)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_after_put() {
        let tier = MemoryTier::new(4, Duration::from_secs(60));
        tier.put(CacheKey::new("a", "k"), b"payload");
        assert_eq!(tier.get(&CacheKey::new("a", "k")).as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let tier = MemoryTier::new(2, Duration::from_secs(60));
        tier.put(CacheKey::new("a", "1"), b"1");
        tier.put(CacheKey::new("a", "2"), b"2");
        tier.get(&CacheKey::new("a", "1"));
        tier.put(CacheKey::new("a", "3"), b"3");

        assert!(tier.get(&CacheKey::new("a", "1")).is_some());
        assert!(tier.get(&CacheKey::new("a", "2")).is_none());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_entries_expire() {
        let tier = MemoryTier::new(4, Duration::from_millis(20));
        tier.put(CacheKey::new("a", "k"), b"v");
        thread::sleep(Duration::from_millis(40));
        assert!(tier.get(&CacheKey::new("a", "k")).is_none());
        assert!(tier.is_empty());
    }

    #[test]
    fn test_remove_account_is_scoped() {
        let tier = MemoryTier::new(8, Duration::from_secs(60));
        tier.put(CacheKey::new("a", "1"), b"1");
        tier.put(CacheKey::new("a", "2"), b"2");
        tier.put(CacheKey::new("b", "1"), b"1");

        assert_eq!(tier.remove_account("a"), 2);
        assert_eq!(tier.len(), 1);
        assert!(tier.get(&CacheKey::new("b", "1")).is_some());
    }
}
