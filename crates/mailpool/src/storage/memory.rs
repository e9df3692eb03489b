//! In-memory storage implementation
//!
//! Implements every storage trait with HashMaps behind RwLocks. Used by tests
//! and by deployments that do not need state to survive a restart.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::traits::{
    BatchStore, CacheStore, CacheTable, EntryFilter, EntryMeta, StoredEntry, TierUsage, TokenStore,
};
use crate::models::{BatchProgress, BatchState, CachedAccessToken, ItemRecord, ItemStatus};

/// (account, cache_key)
type EntryKey = (String, String);

/// Internal storage for one batch
struct BatchData {
    label: String,
    state: BatchState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    items: Vec<ItemRecord>,
}

impl BatchData {
    fn progress(&self, batch_id: &str) -> BatchProgress {
        let count = |status| self.items.iter().filter(|i| i.status == status).count();
        BatchProgress {
            batch_id: batch_id.to_string(),
            label: self.label.clone(),
            state: self.state,
            total: self.items.len(),
            succeeded: count(ItemStatus::Success),
            failed: count(ItemStatus::Failed),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// In-memory implementation of [`TokenStore`], [`CacheStore`] and [`BatchStore`]
pub struct InMemoryStore {
    tokens: RwLock<HashMap<String, CachedAccessToken>>,
    lists: RwLock<HashMap<EntryKey, StoredEntry>>,
    details: RwLock<HashMap<EntryKey, StoredEntry>>,
    batches: RwLock<HashMap<String, BatchData>>,
}

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

/// Least-used first, with the key as a stable tie breaker
fn usage_order(a: &StoredEntry, b: &StoredEntry) -> std::cmp::Ordering {
    (a.access_count, a.last_accessed_at, &a.account, &a.cache_key).cmp(&(
        b.access_count,
        b.last_accessed_at,
        &b.account,
        &b.cache_key,
    ))
}

impl InMemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            details: RwLock::new(HashMap::new()),
            batches: RwLock::new(HashMap::new()),
        }
    }

    fn table(&self, table: CacheTable) -> &RwLock<HashMap<EntryKey, StoredEntry>> {
        match table {
            CacheTable::Lists => &self.lists,
            CacheTable::Details => &self.details,
        }
    }

    fn delete_where(
        &self,
        table: CacheTable,
        predicate: impl Fn(&StoredEntry) -> bool,
    ) -> Result<usize> {
        let mut rows = self.table(table).write().map_err(poisoned)?;
        let before = rows.len();
        rows.retain(|_, entry| !predicate(entry));
        Ok(before - rows.len())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for InMemoryStore {
    fn get_token(&self, account: &str) -> Result<Option<CachedAccessToken>> {
        let tokens = self.tokens.read().map_err(poisoned)?;
        Ok(tokens.get(account).cloned())
    }

    fn save_token(&self, token: &CachedAccessToken) -> Result<()> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        tokens.insert(token.account.clone(), token.clone());
        Ok(())
    }

    fn delete_token(&self, account: &str) -> Result<()> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        tokens.remove(account);
        Ok(())
    }

    fn purge_expired_tokens(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        let count = tokens.len();
        tokens.retain(|_, t| t.expires_at >= before);
        Ok(count - tokens.len())
    }
}

impl CacheStore for InMemoryStore {
    fn upsert_entry(&self, table: CacheTable, entry: &StoredEntry) -> Result<()> {
        let mut rows = self.table(table).write().map_err(poisoned)?;
        let key = (entry.account.clone(), entry.cache_key.clone());
        let mut entry = entry.clone();
        if let Some(previous) = rows.get(&key) {
            entry.access_count = previous.access_count;
            entry.last_accessed_at = previous.last_accessed_at.max(entry.last_accessed_at);
            entry.created_at = previous.created_at;
        }
        rows.insert(key, entry);
        Ok(())
    }

    fn read_entry(
        &self,
        table: CacheTable,
        account: &str,
        cache_key: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StoredEntry>> {
        let mut rows = self.table(table).write().map_err(poisoned)?;
        let Some(entry) = rows.get_mut(&(account.to_string(), cache_key.to_string())) else {
            return Ok(None);
        };
        entry.access_count += 1;
        entry.last_accessed_at = at;
        Ok(Some(entry.clone()))
    }

    fn scan_entries(
        &self,
        table: CacheTable,
        filter: &EntryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntryMeta>> {
        let rows = self.table(table).read().map_err(poisoned)?;
        let mut matching: Vec<&StoredEntry> = rows.values().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| usage_order(a, b));

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(StoredEntry::meta)
            .collect())
    }

    fn delete_entry(&self, table: CacheTable, account: &str, cache_key: &str) -> Result<bool> {
        let mut rows = self.table(table).write().map_err(poisoned)?;
        Ok(rows
            .remove(&(account.to_string(), cache_key.to_string()))
            .is_some())
    }

    fn delete_by_message(
        &self,
        table: CacheTable,
        account: &str,
        message_id: &str,
    ) -> Result<usize> {
        self.delete_where(table, |e| {
            e.account == account && e.message_id.as_deref() == Some(message_id)
        })
    }

    fn delete_by_prefix(&self, table: CacheTable, account: &str, prefix: &str) -> Result<usize> {
        self.delete_where(table, |e| {
            e.account == account && e.cache_key.starts_with(prefix)
        })
    }

    fn usage(&self, table: CacheTable) -> Result<TierUsage> {
        let rows = self.table(table).read().map_err(poisoned)?;
        Ok(TierUsage {
            rows: rows.len(),
            bytes: rows.values().map(|e| e.stored_size() as u64).sum(),
        })
    }

    fn evict_least_used(&self, table: CacheTable, count: usize) -> Result<usize> {
        let mut rows = self.table(table).write().map_err(poisoned)?;
        let mut ordered: Vec<&StoredEntry> = rows.values().collect();
        ordered.sort_by(|a, b| usage_order(a, b));

        let victims: Vec<EntryKey> = ordered
            .into_iter()
            .take(count)
            .map(|e| (e.account.clone(), e.cache_key.clone()))
            .collect();

        for key in &victims {
            rows.remove(key);
        }
        Ok(victims.len())
    }

    fn clear_table(&self, table: CacheTable) -> Result<()> {
        self.table(table).write().map_err(poisoned)?.clear();
        Ok(())
    }
}

impl BatchStore for InMemoryStore {
    fn create_batch(
        &self,
        batch_id: &str,
        label: &str,
        item_labels: &[String],
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut batches = self.batches.write().map_err(poisoned)?;
        if batches.contains_key(batch_id) {
            return Err(anyhow!("batch {} already exists", batch_id));
        }

        let items = item_labels
            .iter()
            .enumerate()
            .map(|(index, label)| ItemRecord {
                index,
                label: label.clone(),
                status: ItemStatus::Pending,
                error: None,
                finished_at: None,
            })
            .collect();

        batches.insert(
            batch_id.to_string(),
            BatchData {
                label: label.to_string(),
                state: BatchState::Running,
                started_at,
                finished_at: None,
                items,
            },
        );
        Ok(())
    }

    fn record_outcome(
        &self,
        batch_id: &str,
        index: usize,
        status: ItemStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut batches = self.batches.write().map_err(poisoned)?;
        let batch = batches
            .get_mut(batch_id)
            .ok_or_else(|| anyhow!("unknown batch {}", batch_id))?;
        let item = batch
            .items
            .get_mut(index)
            .ok_or_else(|| anyhow!("batch {} has no item {}", batch_id, index))?;

        if item.status.is_terminal() {
            return Ok(false);
        }
        item.status = status;
        item.error = error.map(str::to_string);
        item.finished_at = Some(at);
        Ok(true)
    }

    fn finish_batch(&self, batch_id: &str, state: BatchState, at: DateTime<Utc>) -> Result<()> {
        let mut batches = self.batches.write().map_err(poisoned)?;
        let batch = batches
            .get_mut(batch_id)
            .ok_or_else(|| anyhow!("unknown batch {}", batch_id))?;
        batch.state = state;
        batch.finished_at = Some(at);
        Ok(())
    }

    fn load_progress(&self, batch_id: &str) -> Result<Option<BatchProgress>> {
        let batches = self.batches.read().map_err(poisoned)?;
        Ok(batches.get(batch_id).map(|b| b.progress(batch_id)))
    }

    fn load_items(&self, batch_id: &str, status: Option<ItemStatus>) -> Result<Vec<ItemRecord>> {
        let batches = self.batches.read().map_err(poisoned)?;
        Ok(batches
            .get(batch_id)
            .map(|b| {
                b.items
                    .iter()
                    .filter(|i| status.is_none_or(|s| i.status == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_batches(&self, limit: usize) -> Result<Vec<BatchProgress>> {
        let batches = self.batches.read().map_err(poisoned)?;
        let mut all: Vec<BatchProgress> = batches.iter().map(|(id, b)| b.progress(id)).collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }

    fn purge_batches(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut batches = self.batches.write().map_err(poisoned)?;
        let len = batches.len();
        batches.retain(|_, b| b.finished_at.is_none_or(|at| at >= before));
        Ok(len - batches.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(account: &str, key: &str, access_count: u64, age_secs: i64) -> StoredEntry {
        let at = Utc::now() - Duration::seconds(age_secs);
        StoredEntry {
            account: account.to_string(),
            cache_key: key.to_string(),
            message_id: Some(key.to_string()),
            payload: vec![0u8; 10],
            compressed: false,
            raw_size: 10,
            access_count,
            last_accessed_at: at,
            created_at: at,
        }
    }

    #[test]
    fn test_read_entry_counts_access() {
        let store = InMemoryStore::new();
        store
            .upsert_entry(CacheTable::Details, &entry("a", "m1", 0, 10))
            .unwrap();

        let now = Utc::now();
        let first = store
            .read_entry(CacheTable::Details, "a", "m1", now)
            .unwrap()
            .unwrap();
        assert_eq!(first.access_count, 1);
        assert_eq!(first.last_accessed_at, now);

        let second = store
            .read_entry(CacheTable::Details, "a", "m1", now)
            .unwrap()
            .unwrap();
        assert_eq!(second.access_count, 2);
    }

    #[test]
    fn test_upsert_keeps_usage_counters() {
        let store = InMemoryStore::new();
        store
            .upsert_entry(CacheTable::Lists, &entry("a", "k", 7, 10))
            .unwrap();
        store
            .upsert_entry(CacheTable::Lists, &entry("a", "k", 0, 0))
            .unwrap();

        let meta = store
            .scan_entries(CacheTable::Lists, &EntryFilter::default(), 10, 0)
            .unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].access_count, 7);
    }

    #[test]
    fn test_evict_least_used() {
        let store = InMemoryStore::new();
        store
            .upsert_entry(CacheTable::Details, &entry("a", "hot", 9, 0))
            .unwrap();
        store
            .upsert_entry(CacheTable::Details, &entry("a", "cold-old", 1, 100))
            .unwrap();
        store
            .upsert_entry(CacheTable::Details, &entry("a", "cold-new", 1, 5))
            .unwrap();

        assert_eq!(store.evict_least_used(CacheTable::Details, 1).unwrap(), 1);

        let keys: Vec<String> = store
            .scan_entries(CacheTable::Details, &EntryFilter::default(), 10, 0)
            .unwrap()
            .into_iter()
            .map(|m| m.cache_key)
            .collect();
        assert_eq!(keys, vec!["cold-new".to_string(), "hot".to_string()]);
    }

    #[test]
    fn test_tables_are_independent() {
        let store = InMemoryStore::new();
        store
            .upsert_entry(CacheTable::Lists, &entry("a", "k", 0, 0))
            .unwrap();
        assert_eq!(store.usage(CacheTable::Lists).unwrap().rows, 1);
        assert_eq!(store.usage(CacheTable::Details).unwrap().rows, 0);
    }

    #[test]
    fn test_record_outcome_is_monotonic() {
        let store = InMemoryStore::new();
        store
            .create_batch("b1", "refresh", &["x".into(), "y".into()], Utc::now())
            .unwrap();

        assert!(
            store
                .record_outcome("b1", 0, ItemStatus::Failed, Some("boom"), Utc::now())
                .unwrap()
        );
        assert!(
            !store
                .record_outcome("b1", 0, ItemStatus::Success, None, Utc::now())
                .unwrap()
        );

        let progress = store.load_progress("b1").unwrap().unwrap();
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.succeeded, 0);
        assert_eq!(progress.total, 2);
    }

    #[test]
    fn test_purge_batches() {
        let store = InMemoryStore::new();
        let labels = vec!["a@test".to_string()];
        let long_ago = Utc::now() - Duration::days(30);

        store.create_batch("done", "refresh", &labels, long_ago).unwrap();
        store.finish_batch("done", BatchState::Completed, long_ago).unwrap();
        store.create_batch("running", "refresh", &labels, long_ago).unwrap();

        assert_eq!(store.purge_batches(Utc::now()).unwrap(), 1);
        assert!(store.load_progress("done").unwrap().is_none());
        assert!(store.load_items("done", None).unwrap().is_empty());
        assert!(store.load_progress("running").unwrap().is_some());
    }
}
