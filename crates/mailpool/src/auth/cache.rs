//! Two-tier access token cache
//!
//! Lookups go memory → persistent store → identity provider. A token is
//! only ever served while it still has the refresh buffer to spare.

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::provider::{IdentityProvider, RefreshRequest};
use crate::config::{IdentitySettings, TokenSettings};
use crate::error::{Error, Result};
use crate::models::{AccountIdentity, ApiMethod, CachedAccessToken, account_key};
use crate::storage::TokenStore;

/// Receives refresh tokens the provider rotated during an exchange
///
/// The account records live outside this crate; whoever owns them
/// implements this to keep the stored refresh token current.
pub trait RefreshTokenSink: Send + Sync {
    fn refresh_token_rotated(&self, account: &AccountIdentity, refresh_token: &str);
}

/// Access token lifecycle cache
pub struct TokenCache {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn TokenStore>,
    sink: RwLock<Option<Arc<dyn RefreshTokenSink>>>,
    memory: RwLock<HashMap<String, CachedAccessToken>>,
    imap_scope: String,
    graph_scope: String,
    refresh_buffer: Duration,
    max_cache: Duration,
    refreshes: AtomicU64,
}

impl TokenCache {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn TokenStore>,
        identity: &IdentitySettings,
        tokens: &TokenSettings,
    ) -> Self {
        Self {
            provider,
            store,
            sink: RwLock::new(None),
            memory: RwLock::new(HashMap::new()),
            imap_scope: identity.imap_scope.clone(),
            graph_scope: identity.graph_scope.clone(),
            refresh_buffer: tokens.refresh_buffer(),
            max_cache: tokens.max_cache_duration(),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Report rotated refresh tokens to `sink`
    pub fn with_sink(self, sink: Arc<dyn RefreshTokenSink>) -> Self {
        self.set_sink(sink);
        self
    }

    pub fn set_sink(&self, sink: Arc<dyn RefreshTokenSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Scope requested for accounts using `method`
    pub fn scope_for(&self, method: ApiMethod) -> &str {
        match method {
            ApiMethod::Imap => &self.imap_scope,
            ApiMethod::Graph => &self.graph_scope,
        }
    }

    pub fn refresh_buffer(&self) -> Duration {
        self.refresh_buffer
    }

    /// Get a usable access token for `account`
    ///
    /// The returned token always satisfies `expires_at >= now + refresh_buffer`.
    pub fn acquire(&self, account: &AccountIdentity) -> Result<CachedAccessToken> {
        let key = account.key();
        let scope = self.scope_for(account.api_method);

        if let Some(token) = self.memory_get(&key)
            && token.scope == scope
            && token.is_usable(self.refresh_buffer)
        {
            debug!("[TOKENS] Memory hit for {}", key);
            return Ok(token);
        }

        match self.store.get_token(&key) {
            Ok(Some(token)) if token.scope == scope && token.is_usable(self.refresh_buffer) => {
                debug!("[TOKENS] Persistent hit for {}, promoting", key);
                self.memory_put(token.clone());
                return Ok(token);
            }
            Ok(_) => {}
            Err(e) => warn!("[TOKENS] Token store unavailable for {}: {:#}", key, e),
        }

        self.refresh(account)
    }

    /// Exchange the refresh token now, replacing whatever is cached
    pub fn refresh(&self, account: &AccountIdentity) -> Result<CachedAccessToken> {
        let key = account.key();
        let scope = self.scope_for(account.api_method).to_string();

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let grant = self.provider.refresh(&RefreshRequest {
            account: &key,
            client_id: &account.client_id,
            refresh_token: &account.refresh_token,
            scope: &scope,
        })?;

        let issued_at = Utc::now();
        let max_secs = self.max_cache.num_seconds().max(0) as u64;
        let lifetime = Duration::seconds(grant.expires_in.min(max_secs) as i64);

        if lifetime <= self.refresh_buffer {
            return Err(Error::transient(format!(
                "provider granted {} a token valid for {}s, inside the {}s refresh buffer",
                key,
                grant.expires_in,
                self.refresh_buffer.num_seconds()
            )));
        }

        let token = CachedAccessToken {
            account: key.clone(),
            token_value: grant.access_token,
            token_type: grant.token_type,
            scope,
            expires_at: issued_at + lifetime,
            issued_at,
        };

        if let Err(e) = self.store.save_token(&token) {
            warn!("[TOKENS] Failed to persist token for {}: {:#}", key, e);
        }
        self.memory_put(token.clone());

        if let Some(rotated) = grant.refresh_token.as_deref()
            && rotated != account.refresh_token
        {
            let sink = self
                .sink
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match sink {
                Some(sink) => sink.refresh_token_rotated(account, rotated),
                None => debug!("[TOKENS] Provider rotated refresh token for {} (no sink)", key),
            }
        }

        info!(
            "[TOKENS] Refreshed token for {} (cached {}s of {}s)",
            key,
            lifetime.num_seconds(),
            grant.expires_in
        );
        Ok(token)
    }

    /// Forget the token of `email` in both tiers
    pub fn invalidate(&self, email: &str) {
        let key = account_key(email);
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        if let Err(e) = self.store.delete_token(&key) {
            warn!("[TOKENS] Failed to delete stored token for {}: {:#}", key, e);
        }
        debug!("[TOKENS] Invalidated token for {}", key);
    }

    /// Drop expired tokens from both tiers, returning how many persistent rows went
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, token| token.expires_at >= now);
        Ok(self.store.purge_expired_tokens(now)?)
    }

    /// Accounts with a token in the memory tier
    pub fn cached_accounts(&self) -> usize {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Refresh-grant exchanges attempted since construction
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn memory_get(&self, key: &str) -> Option<CachedAccessToken> {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn memory_put(&self, token: CachedAccessToken) {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.account.clone(), token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenGrant;
    use crate::storage::InMemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Provider answering with a fixed lifetime and counting calls
    struct MockProvider {
        calls: AtomicUsize,
        expires_in: u64,
        rotate_to: Option<String>,
        fail_with: Option<u16>,
    }

    impl MockProvider {
        fn new(expires_in: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                expires_in,
                rotate_to: None,
                fail_with: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl IdentityProvider for MockProvider {
        fn refresh(&self, request: &RefreshRequest<'_>) -> Result<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(status) = self.fail_with {
                return Err(crate::auth::provider::classify_status(
                    request.account,
                    status,
                    r#"{"error":"invalid_grant"}"#,
                ));
            }
            Ok(TokenGrant {
                access_token: format!("at-{}-{}", request.account, n),
                expires_in: self.expires_in,
                token_type: "Bearer".to_string(),
                refresh_token: self.rotate_to.clone(),
                scope: Some(request.scope.to_string()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        rotated: Mutex<Vec<(String, String)>>,
    }

    impl RefreshTokenSink for RecordingSink {
        fn refresh_token_rotated(&self, account: &AccountIdentity, refresh_token: &str) {
            self.rotated
                .lock()
                .unwrap()
                .push((account.key(), refresh_token.to_string()));
        }
    }

    fn settings(buffer: u64, max_cache: u64) -> (IdentitySettings, TokenSettings) {
        (
            IdentitySettings::default(),
            TokenSettings {
                refresh_buffer_secs: buffer,
                max_cache_secs: max_cache,
            },
        )
    }

    fn create_cache(provider: Arc<MockProvider>, store: Arc<InMemoryStore>) -> TokenCache {
        let (identity, tokens) = settings(60, 3000);
        TokenCache::new(provider, store, &identity, &tokens)
    }

    fn account() -> AccountIdentity {
        AccountIdentity::new("User@Test.com", "client", "rt-1")
    }

    #[test]
    fn test_acquire_caches_in_memory() {
        let provider = Arc::new(MockProvider::new(3600));
        let cache = create_cache(provider.clone(), Arc::new(InMemoryStore::new()));

        let first = cache.acquire(&account()).unwrap();
        let second = cache.acquire(&account()).unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(first.token_value, second.token_value);
        assert_eq!(first.account, "user@test.com");
    }

    #[test]
    fn test_acquire_honors_refresh_buffer() {
        let provider = Arc::new(MockProvider::new(3600));
        let cache = create_cache(provider, Arc::new(InMemoryStore::new()));

        let token = cache.acquire(&account()).unwrap();
        assert!(token.expires_at >= Utc::now() + cache.refresh_buffer());
    }

    #[test]
    fn test_expiry_capped_at_max_cache() {
        let provider = Arc::new(MockProvider::new(86_400));
        let cache = create_cache(provider, Arc::new(InMemoryStore::new()));

        let token = cache.acquire(&account()).unwrap();
        assert_eq!((token.expires_at - token.issued_at).num_seconds(), 3000);
    }

    #[test]
    fn test_token_inside_buffer_is_refreshed() {
        let provider = Arc::new(MockProvider::new(3600));
        let store = Arc::new(InMemoryStore::new());
        let cache = create_cache(provider.clone(), store.clone());

        // 30s left with a 60s buffer
        let now = Utc::now();
        store
            .save_token(&CachedAccessToken {
                account: "user@test.com".to_string(),
                token_value: "stale".to_string(),
                token_type: "Bearer".to_string(),
                scope: cache.scope_for(ApiMethod::Imap).to_string(),
                expires_at: now + Duration::seconds(30),
                issued_at: now - Duration::seconds(3000),
            })
            .unwrap();

        let token = cache.acquire(&account()).unwrap();
        assert_ne!(token.token_value, "stale");
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_persistent_tier_is_promoted() {
        let provider = Arc::new(MockProvider::new(3600));
        let store = Arc::new(InMemoryStore::new());

        let warm = create_cache(provider.clone(), store.clone());
        let issued = warm.acquire(&account()).unwrap();

        // A fresh cache over the same store does not call upstream
        let cold = create_cache(provider.clone(), store);
        let served = cold.acquire(&account()).unwrap();
        assert_eq!(served.token_value, issued.token_value);
        assert_eq!(provider.calls(), 1);
        assert_eq!(cold.cached_accounts(), 1);
    }

    #[test]
    fn test_invalidate_forces_one_refresh() {
        let provider = Arc::new(MockProvider::new(3600));
        let cache = create_cache(provider.clone(), Arc::new(InMemoryStore::new()));

        cache.acquire(&account()).unwrap();
        cache.invalidate("USER@test.com");
        cache.acquire(&account()).unwrap();
        cache.acquire(&account()).unwrap();

        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn test_rejected_grant_is_invalid_credential() {
        let provider = Arc::new(MockProvider {
            fail_with: Some(400),
            ..MockProvider::new(3600)
        });
        let store = Arc::new(InMemoryStore::new());
        let cache = create_cache(provider, store.clone());

        let err = cache.acquire(&account()).unwrap_err();
        assert!(err.is_auth_failure());
        assert!(store.get_token("user@test.com").unwrap().is_none());
    }

    #[test]
    fn test_short_grant_is_not_cached() {
        let provider = Arc::new(MockProvider::new(45));
        let store = Arc::new(InMemoryStore::new());
        let cache = create_cache(provider, store.clone());

        let err = cache.acquire(&account()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);
        assert_eq!(cache.cached_accounts(), 0);
        assert!(store.get_token("user@test.com").unwrap().is_none());
    }

    #[test]
    fn test_scope_change_triggers_refresh() {
        let provider = Arc::new(MockProvider::new(3600));
        let cache = create_cache(provider.clone(), Arc::new(InMemoryStore::new()));

        let imap = cache.acquire(&account()).unwrap();
        let graph = cache
            .acquire(&account().with_api_method(ApiMethod::Graph))
            .unwrap();

        assert_eq!(provider.calls(), 2);
        assert_ne!(imap.scope, graph.scope);
        assert_eq!(graph.scope, cache.scope_for(ApiMethod::Graph));
    }

    #[test]
    fn test_rotated_refresh_token_reaches_sink() {
        let provider = Arc::new(MockProvider {
            rotate_to: Some("rt-2".to_string()),
            ..MockProvider::new(3600)
        });
        let sink = Arc::new(RecordingSink::default());
        let cache =
            create_cache(provider, Arc::new(InMemoryStore::new())).with_sink(sink.clone());

        cache.acquire(&account()).unwrap();

        let rotated = sink.rotated.lock().unwrap();
        assert_eq!(
            rotated.as_slice(),
            &[("user@test.com".to_string(), "rt-2".to_string())]
        );
    }

    #[test]
    fn test_unchanged_refresh_token_is_not_reported() {
        let provider = Arc::new(MockProvider {
            rotate_to: Some("rt-1".to_string()),
            ..MockProvider::new(3600)
        });
        let sink = Arc::new(RecordingSink::default());
        let cache =
            create_cache(provider, Arc::new(InMemoryStore::new())).with_sink(sink.clone());

        cache.acquire(&account()).unwrap();
        assert!(sink.rotated.lock().unwrap().is_empty());
    }

    /// Token store whose every call fails
    struct UnavailableStore;

    impl TokenStore for UnavailableStore {
        fn get_token(&self, _account: &str) -> anyhow::Result<Option<CachedAccessToken>> {
            Err(anyhow::anyhow!("database is locked"))
        }
        fn save_token(&self, _token: &CachedAccessToken) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("database is locked"))
        }
        fn delete_token(&self, _account: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("database is locked"))
        }
        fn purge_expired_tokens(&self, _before: chrono::DateTime<Utc>) -> anyhow::Result<usize> {
            Err(anyhow::anyhow!("database is locked"))
        }
    }

    #[test]
    fn test_store_failures_fall_back_to_memory_tier() {
        let provider = Arc::new(MockProvider::new(3600));
        let (identity, tokens) = settings(60, 3000);
        let cache =
            TokenCache::new(provider.clone(), Arc::new(UnavailableStore), &identity, &tokens);

        let first = cache.acquire(&account()).unwrap();
        let second = cache.acquire(&account()).unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(first.token_value, second.token_value);
        assert_eq!(cache.cached_accounts(), 1);

        // Invalidation still clears the memory tier
        cache.invalidate("user@test.com");
        assert_eq!(cache.cached_accounts(), 0);
        assert!(cache.purge_expired().is_err());
    }
}
