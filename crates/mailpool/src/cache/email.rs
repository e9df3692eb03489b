//! List and detail caches for mail data

use log::debug;
use serde::Serialize;
use std::sync::Arc;

use super::tiered::{TierStats, TieredCache};
use crate::config::CacheSettings;
use crate::models::{CacheKey, DetailKey, ListScope, account_key};
use crate::storage::{CacheStore, CacheTable, TierUsage};

/// Snapshot of both caches
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmailCacheStats {
    pub lists: TierStats,
    pub details: TierStats,
    pub list_usage: Option<TierUsage>,
    pub detail_usage: Option<TierUsage>,
}

/// Folder listings and message details, each in its own tiered cache
pub struct EmailCache {
    lists: TieredCache,
    details: TieredCache,
}

impl EmailCache {
    /// `store = None` keeps both caches memory-only
    pub fn new(store: Option<Arc<dyn CacheStore>>, settings: &CacheSettings) -> Self {
        Self {
            lists: TieredCache::new(CacheTable::Lists, store.clone(), settings),
            details: TieredCache::new(CacheTable::Details, store, settings),
        }
    }

    pub fn get_list(&self, email: &str, scope: &ListScope, force_refresh: bool) -> Option<Vec<u8>> {
        self.lists
            .get(&CacheKey::new(email, scope.cache_key()), force_refresh)
    }

    pub fn put_list(&self, email: &str, scope: &ListScope, payload: &[u8]) {
        self.lists
            .put(&CacheKey::new(email, scope.cache_key()), None, payload);
    }

    pub fn get_detail(&self, email: &str, key: &DetailKey, force_refresh: bool) -> Option<Vec<u8>> {
        self.details
            .get(&CacheKey::new(email, key.cache_key()), force_refresh)
    }

    pub fn put_detail(&self, email: &str, key: &DetailKey, payload: &[u8]) {
        self.details.put(
            &CacheKey::new(email, key.cache_key()),
            Some(&key.message_id),
            payload,
        );
    }

    /// Forget a message that was deleted upstream
    ///
    /// Deletes its detail rows in every folder and the account's stored
    /// list pages (they still enumerate it), then drops all of the
    /// account's memory entries in both caches. Returns the detail rows
    /// removed.
    pub fn remove_message(&self, email: &str, message_id: &str) -> usize {
        let account = account_key(email);
        let details = self.details.remove_message(&account, message_id);
        let lists = self.lists.remove_prefix(&account, "");
        self.forget_account(&account);
        debug!(
            "[CACHE] Removed message {} for {} ({} detail rows, {} list pages)",
            message_id, account, details, lists
        );
        details
    }

    /// Delete every stored page of one folder
    pub fn invalidate_folder(&self, email: &str, folder: &str) -> usize {
        let account = account_key(email);
        let removed = self
            .lists
            .remove_prefix(&account, &ListScope::folder_prefix(folder));
        self.lists.forget_account(&account);
        removed
    }

    /// Drop the account's memory entries in both caches
    pub fn forget_account(&self, email: &str) -> usize {
        let account = account_key(email);
        self.lists.forget_account(&account) + self.details.forget_account(&account)
    }

    /// Delete everything cached for the account, both tiers
    pub fn purge_account(&self, email: &str) -> usize {
        let account = account_key(email);
        self.forget_account(&account);
        self.lists.remove_prefix(&account, "") + self.details.remove_prefix(&account, "")
    }

    pub fn stats(&self) -> EmailCacheStats {
        EmailCacheStats {
            lists: self.lists.stats(),
            details: self.details.stats(),
            list_usage: self.lists.usage(),
            detail_usage: self.details.usage(),
        }
    }
}
