//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{BatchProgress, BatchState, CachedAccessToken, ItemRecord, ItemStatus};

/// Persistent tier of the token cache
pub trait TokenStore: Send + Sync {
    /// Get the stored token for an account key
    fn get_token(&self, account: &str) -> Result<Option<CachedAccessToken>>;

    /// Insert or replace the token for its account
    fn save_token(&self, token: &CachedAccessToken) -> Result<()>;

    /// Delete the token for an account (no-op if absent)
    fn delete_token(&self, account: &str) -> Result<()>;

    /// Delete tokens that expired before `before`, returning how many
    fn purge_expired_tokens(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// The two independent mail caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTable {
    /// Folder listing pages
    Lists,
    /// Individual messages
    Details,
}

impl CacheTable {
    /// SQL table backing this cache
    pub fn table_name(&self) -> &'static str {
        match self {
            CacheTable::Lists => "list_cache",
            CacheTable::Details => "detail_cache",
        }
    }

    /// Short name for logs
    pub fn label(&self) -> &'static str {
        match self {
            CacheTable::Lists => "list",
            CacheTable::Details => "detail",
        }
    }
}

/// A row of a persistent cache tier, payload as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub account: String,
    pub cache_key: String,
    /// Set for detail entries so one message can be deleted across folders
    pub message_id: Option<String>,
    /// Stored bytes (compressed when `compressed` is set)
    pub payload: Vec<u8>,
    pub compressed: bool,
    /// Size before compression
    pub raw_size: usize,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StoredEntry {
    /// Bytes this row occupies in the tier
    pub fn stored_size(&self) -> usize {
        self.payload.len()
    }

    /// Metadata view without the payload
    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            account: self.account.clone(),
            cache_key: self.cache_key.clone(),
            message_id: self.message_id.clone(),
            compressed: self.compressed,
            raw_size: self.raw_size,
            stored_size: self.stored_size(),
            access_count: self.access_count,
            last_accessed_at: self.last_accessed_at,
            created_at: self.created_at,
        }
    }
}

/// Row metadata returned by scans
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
    pub account: String,
    pub cache_key: String,
    pub message_id: Option<String>,
    pub compressed: bool,
    pub raw_size: usize,
    pub stored_size: usize,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Filter for [`CacheStore::scan_entries`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub account: Option<String>,
    pub key_prefix: Option<String>,
    pub message_id: Option<String>,
}

impl EntryFilter {
    pub fn account(account: impl Into<String>) -> Self {
        Self {
            account: Some(account.into()),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, entry: &StoredEntry) -> bool {
        self.account.as_ref().is_none_or(|a| *a == entry.account)
            && self
                .key_prefix
                .as_ref()
                .is_none_or(|p| entry.cache_key.starts_with(p.as_str()))
            && self
                .message_id
                .as_ref()
                .is_none_or(|m| entry.message_id.as_ref() == Some(m))
    }
}

/// Row count and byte size of a tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub rows: usize,
    pub bytes: u64,
}

impl TierUsage {
    /// Fraction of capacity in use: the larger of the row and byte ratios
    pub fn ratio(&self, max_rows: usize, max_bytes: u64) -> f64 {
        let rows = self.rows as f64 / max_rows.max(1) as f64;
        let bytes = self.bytes as f64 / max_bytes.max(1) as f64;
        rows.max(bytes)
    }
}

/// Persistent tier of the mail caches
///
/// Every method addresses one [`CacheTable`]; the two tables never share rows.
pub trait CacheStore: Send + Sync {
    /// Insert or replace a row by (account, cache_key)
    ///
    /// Replacing keeps the usage counters of the previous row.
    fn upsert_entry(&self, table: CacheTable, entry: &StoredEntry) -> Result<()>;

    /// Point lookup that counts as an access
    ///
    /// Increments `access_count` and sets `last_accessed_at = at` on the row
    /// before returning it.
    fn read_entry(
        &self,
        table: CacheTable,
        account: &str,
        cache_key: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StoredEntry>>;

    /// Filtered, paginated scan ordered least-used first
    /// (`access_count`, then `last_accessed_at`, ascending)
    fn scan_entries(
        &self,
        table: CacheTable,
        filter: &EntryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntryMeta>>;

    /// Delete one row, returning whether it existed
    fn delete_entry(&self, table: CacheTable, account: &str, cache_key: &str) -> Result<bool>;

    /// Delete every row of `account` carrying `message_id`
    fn delete_by_message(&self, table: CacheTable, account: &str, message_id: &str)
    -> Result<usize>;

    /// Delete every row of `account` whose key starts with `prefix`
    ///
    /// An empty prefix deletes the whole account.
    fn delete_by_prefix(&self, table: CacheTable, account: &str, prefix: &str) -> Result<usize>;

    /// Row count and stored byte total
    fn usage(&self, table: CacheTable) -> Result<TierUsage>;

    /// Delete the `count` least-used rows, returning how many went
    fn evict_least_used(&self, table: CacheTable, count: usize) -> Result<usize>;

    /// Delete every row (for maintenance and tests)
    fn clear_table(&self, table: CacheTable) -> Result<()>;
}

/// Progress bookkeeping for batches
///
/// Aggregates are always derived from item rows.
pub trait BatchStore: Send + Sync {
    /// Register a running batch with all items pending
    fn create_batch(
        &self,
        batch_id: &str,
        label: &str,
        item_labels: &[String],
        started_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Move a pending item to a terminal status
    ///
    /// Returns false (and changes nothing) if the item already left pending.
    fn record_outcome(
        &self,
        batch_id: &str,
        index: usize,
        status: ItemStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark the batch as terminal
    fn finish_batch(&self, batch_id: &str, state: BatchState, at: DateTime<Utc>) -> Result<()>;

    /// Aggregate progress of a batch
    fn load_progress(&self, batch_id: &str) -> Result<Option<BatchProgress>>;

    /// Item rows, optionally filtered by status, ordered by index
    fn load_items(&self, batch_id: &str, status: Option<ItemStatus>) -> Result<Vec<ItemRecord>>;

    /// Most recently started batches first
    fn list_batches(&self, limit: usize) -> Result<Vec<BatchProgress>>;

    /// Delete batches (and their items) that finished before `before`
    ///
    /// Running batches are never deleted.
    fn purge_batches(&self, before: DateTime<Utc>) -> Result<usize>;
}
