//! One cache table: memory tier in front of a compressed persistent tier

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::memory::MemoryTier;
use crate::config::CacheSettings;
use crate::models::CacheKey;
use crate::storage::{CacheStore, CacheTable, PayloadCodec, StoredEntry, TierUsage};

/// Counters of one cache table since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evicted: u64,
    pub memory_entries: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evicted: AtomicU64,
}

/// Memory + persistent cache for one [`CacheTable`]
///
/// Never fails: persistent-tier errors are logged and the cache behaves as
/// if the tier were empty (reads) or absent (writes).
pub struct TieredCache {
    table: CacheTable,
    memory: MemoryTier,
    store: Option<Arc<dyn CacheStore>>,
    codec: PayloadCodec,
    max_rows: usize,
    max_bytes: u64,
    cleanup_threshold: f64,
    eviction_fraction: f64,
    counters: Counters,
    /// Bumped per account before any removal; reads started under an older
    /// generation do not repopulate the memory tier
    generations: RwLock<HashMap<String, u64>>,
}

impl TieredCache {
    /// Build a cache; `store = None` keeps it memory-only
    pub fn new(
        table: CacheTable,
        store: Option<Arc<dyn CacheStore>>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            table,
            memory: MemoryTier::new(settings.memory_capacity, settings.memory_ttl()),
            store,
            codec: PayloadCodec::new(
                settings.compression_threshold_bytes,
                settings.compression_level,
            ),
            max_rows: settings.persistent_max_rows,
            max_bytes: settings.persistent_max_bytes,
            cleanup_threshold: settings.cleanup_threshold,
            eviction_fraction: settings.eviction_fraction,
            counters: Counters::default(),
            generations: RwLock::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> CacheTable {
        self.table
    }

    /// Look up a payload
    ///
    /// `force_refresh` always reports a miss so the caller refetches and
    /// writes the fresh value.
    pub fn get(&self, key: &CacheKey, force_refresh: bool) -> Option<Vec<u8>> {
        let label = self.table.label();
        if force_refresh {
            debug!("[CACHE] {} {}/{}: forced refresh", label, key.account, key.key);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(payload) = self.memory.get(key) {
            debug!("[CACHE] {} memory hit for {}", label, key.account);
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(payload.to_vec());
        }

        let generation = self.generation(&key.account);
        match self.read_persistent(key) {
            Some(raw) => {
                debug!("[CACHE] {} persistent hit for {}", label, key.account);
                self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
                self.promote(key, generation, &raw);
                Some(raw)
            }
            None => {
                debug!("[CACHE] {} miss for {}", label, key.account);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn generation(&self, account: &str) -> u64 {
        self.generations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    fn bump_generation(&self, account: &str) {
        let mut generations = self.generations.write().unwrap_or_else(PoisonError::into_inner);
        let generation = generations.entry(account.to_string()).or_default();
        *generation = generation.wrapping_add(1);
    }

    /// Copy a persistent hit into memory unless the account was invalidated
    /// since `seen` was read
    fn promote(&self, key: &CacheKey, seen: u64, raw: &[u8]) {
        let generations = self.generations.read().unwrap_or_else(PoisonError::into_inner);
        if generations.get(&key.account).copied().unwrap_or(0) != seen {
            debug!(
                "[CACHE] {} entry for {} invalidated during read, not promoting",
                self.table.label(),
                key.account
            );
            return;
        }
        self.memory.put(key.clone(), raw);
    }

    fn read_persistent(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let store = self.store.as_ref()?;
        let entry = match store.read_entry(self.table, &key.account, &key.key, Utc::now()) {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(
                    "[CACHE] {} tier unavailable, treating as miss: {:#}",
                    self.table.label(),
                    e
                );
                return None;
            }
        };

        match self.codec.decode(&entry.payload, entry.compressed) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(
                    "[CACHE] Dropping undecodable {} entry for {}: {:#}",
                    self.table.label(),
                    key.account,
                    e
                );
                if let Err(e) = store.delete_entry(self.table, &key.account, &key.key) {
                    warn!("[CACHE] Failed to delete corrupt entry: {:#}", e);
                }
                None
            }
        }
    }

    /// Store a payload in both tiers, then evict if the persistent tier is full
    pub fn put(&self, key: &CacheKey, message_id: Option<&str>, payload: &[u8]) {
        self.memory.put(key.clone(), payload);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        let Some(store) = self.store.as_ref() else {
            return;
        };

        let encoded = match self.codec.encode(payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("[CACHE] Compression failed, keeping in memory only: {:#}", e);
                return;
            }
        };

        let now = Utc::now();
        let entry = StoredEntry {
            account: key.account.clone(),
            cache_key: key.key.clone(),
            message_id: message_id.map(str::to_string),
            payload: encoded.bytes,
            compressed: encoded.compressed,
            raw_size: payload.len(),
            access_count: 0,
            last_accessed_at: now,
            created_at: now,
        };

        if let Err(e) = store.upsert_entry(self.table, &entry) {
            warn!(
                "[CACHE] {} tier write failed, keeping in memory only: {:#}",
                self.table.label(),
                e
            );
            return;
        }

        self.enforce_limits(store.as_ref());
    }

    fn enforce_limits(&self, store: &dyn CacheStore) {
        let usage = match store.usage(self.table) {
            Ok(usage) => usage,
            Err(e) => {
                warn!("[CACHE] Could not read {} usage: {:#}", self.table.label(), e);
                return;
            }
        };

        let ratio = usage.ratio(self.max_rows, self.max_bytes);
        if ratio <= self.cleanup_threshold {
            return;
        }

        let count = ((usage.rows as f64 * self.eviction_fraction).ceil() as usize).max(1);
        match store.evict_least_used(self.table, count) {
            Ok(evicted) => {
                self.counters
                    .evicted
                    .fetch_add(evicted as u64, Ordering::Relaxed);
                info!(
                    "[CACHE] {} tier at {:.0}% ({} rows, {} bytes), evicted {} least-used rows",
                    self.table.label(),
                    ratio * 100.0,
                    usage.rows,
                    usage.bytes,
                    evicted
                );
            }
            Err(e) => warn!("[CACHE] {} eviction failed: {:#}", self.table.label(), e),
        }
    }

    /// Remove one entry from both tiers
    pub fn remove(&self, key: &CacheKey) {
        self.bump_generation(&key.account);
        self.memory.remove(key);
        if let Some(store) = &self.store
            && let Err(e) = store.delete_entry(self.table, &key.account, &key.key)
        {
            warn!("[CACHE] {} delete failed: {:#}", self.table.label(), e);
        }
    }

    /// Delete persistent rows of `account` carrying `message_id`
    pub fn remove_message(&self, account: &str, message_id: &str) -> usize {
        self.bump_generation(account);
        let Some(store) = &self.store else {
            return 0;
        };
        store
            .delete_by_message(self.table, account, message_id)
            .unwrap_or_else(|e| {
                warn!("[CACHE] {} delete failed: {:#}", self.table.label(), e);
                0
            })
    }

    /// Delete persistent rows of `account` whose key starts with `prefix`
    pub fn remove_prefix(&self, account: &str, prefix: &str) -> usize {
        self.bump_generation(account);
        let Some(store) = &self.store else {
            return 0;
        };
        store
            .delete_by_prefix(self.table, account, prefix)
            .unwrap_or_else(|e| {
                warn!("[CACHE] {} delete failed: {:#}", self.table.label(), e);
                0
            })
    }

    /// Drop every memory entry of `account`
    pub fn forget_account(&self, account: &str) -> usize {
        self.bump_generation(account);
        self.memory.remove_account(account)
    }

    /// Persistent usage, `None` when memory-only or unavailable
    pub fn usage(&self) -> Option<TierUsage> {
        let store = self.store.as_ref()?;
        store
            .usage(self.table)
            .inspect_err(|e| warn!("[CACHE] Could not read {} usage: {:#}", self.table.label(), e))
            .ok()
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            persistent_hits: self.counters.persistent_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
        }
    }

    /// Empty the memory tier (the persistent tier is kept)
    pub fn clear_memory(&self) {
        self.memory.clear();
    }
}
