//! MailGateway facade
//!
//! Wires the token cache, connection pool, mail cache and batch
//! orchestrator together and exposes the API the account layer calls.
//! Construct one per process and share it; it holds no global state.

use anyhow::Context;
use log::{info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{HttpIdentityProvider, IdentityProvider, RefreshTokenSink, TokenCache};
use crate::batch::{BatchHandle, BatchItem, BatchOrchestrator};
use crate::cache::{EmailCache, EmailCacheStats};
use crate::config::Settings;
use crate::error::{Error, Result, TransportError};
use crate::models::{
    AccountIdentity, ApiMethod, BatchProgress, CachedAccessToken, DetailKey, ItemRecord,
    ItemStatus, ListScope, account_key,
};
use crate::pool::{ConnectionPool, DrainReport, PoolStats};
use crate::storage::{BatchStore, CacheStore, SqliteStore, TokenStore};
use crate::transport::{
    CapabilityCache, CapabilityProbe, MailSession, ScopeCapabilityProbe, SessionConnector,
    SessionResult,
};

/// Receives accounts that passed [`MailGateway::import_accounts`]
///
/// The account records live outside this crate; the sink persists them.
pub trait AccountSink: Send + Sync {
    /// Store a validated account (with its detected API method)
    fn store_account(&self, account: &AccountIdentity) -> anyhow::Result<()>;
}

/// Point-in-time view of every component
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub pools: Vec<PoolStats>,
    pub cache: EmailCacheStats,
    pub cached_tokens: usize,
    pub token_refreshes: u64,
}

/// Caller-facing entry point
pub struct MailGateway {
    settings: Settings,
    tokens: Arc<TokenCache>,
    pool: Arc<ConnectionPool>,
    cache: Arc<EmailCache>,
    batches: Arc<BatchOrchestrator>,
    capabilities: Arc<CapabilityCache>,
}

impl MailGateway {
    /// Assemble a gateway over one store implementing every storage trait
    pub fn new<S>(
        settings: Settings,
        provider: Arc<dyn IdentityProvider>,
        connector: Arc<dyn SessionConnector>,
        store: Arc<S>,
    ) -> Result<Self>
    where
        S: TokenStore + CacheStore + BatchStore + 'static,
    {
        settings.validate()?;

        let token_store: Arc<dyn TokenStore> = store.clone();
        let cache_store: Arc<dyn CacheStore> = store.clone();
        let batch_store: Arc<dyn BatchStore> = store;

        let tokens = TokenCache::new(
            Arc::clone(&provider),
            token_store,
            &settings.identity,
            &settings.tokens,
        );
        let probe = ScopeCapabilityProbe::new(provider, settings.identity.graph_scope.clone());

        Ok(Self {
            tokens: Arc::new(tokens),
            pool: Arc::new(ConnectionPool::new(connector, settings.pool.clone())),
            cache: Arc::new(EmailCache::new(Some(cache_store), &settings.cache)),
            batches: Arc::new(BatchOrchestrator::new(batch_store, settings.batch.clone())),
            capabilities: Arc::new(CapabilityCache::new(Arc::new(probe))),
            settings,
        })
    }

    /// Gateway over the SQLite database and HTTP identity provider from `settings`
    pub fn open(settings: Settings, connector: Arc<dyn SessionConnector>) -> Result<Self> {
        let db_path = settings
            .database_path()
            .context("Could not determine database path")?;
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let provider = Arc::new(HttpIdentityProvider::from_settings(&settings.identity));
        info!("[STORE] Opened database at {}", db_path.display());
        Self::new(settings, provider, connector, store)
    }

    /// Replace the capability probe (the default asks for a Graph token)
    pub fn with_capability_probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.capabilities = Arc::new(CapabilityCache::new(probe));
        self
    }

    /// Report rotated refresh tokens to `sink`
    pub fn set_refresh_token_sink(&self, sink: Arc<dyn RefreshTokenSink>) {
        self.tokens.set_sink(sink);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &EmailCache {
        &self.cache
    }

    pub fn batches(&self) -> &BatchOrchestrator {
        &self.batches
    }

    // ========================================================================
    // Tokens and sessions
    // ========================================================================

    /// Usable access token for `account`
    pub fn acquire_token(&self, account: &AccountIdentity) -> Result<CachedAccessToken> {
        self.tokens.acquire(account)
    }

    /// Run `f` on a pooled session of `account`
    ///
    /// If the provider rejects the token (at connect time or from inside
    /// `f`), the token is invalidated and the call retried once with a fresh
    /// token. A rejection inside `f` also drains the account's idle
    /// sessions, which were opened with the rejected token. A session that
    /// hit a network, TLS or timeout error is discarded instead of being
    /// pooled again.
    pub fn with_connection<R, F>(&self, account: &AccountIdentity, mut f: F) -> Result<R>
    where
        F: FnMut(&mut dyn MailSession) -> SessionResult<R>,
    {
        let key = account.key();
        let mut retried = false;

        loop {
            let token = self.tokens.acquire(account)?;
            let mut conn = match self.pool.checkout(&account.email, &token) {
                Ok(conn) => conn,
                Err(e) if e.is_auth_failure() && !retried => {
                    warn!("[POOL] Session auth for {} rejected, refreshing token", key);
                    self.tokens.invalidate(&key);
                    retried = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match f(&mut *conn) {
                Ok(value) => return Ok(value),
                Err(TransportError::Auth(reason)) if !retried => {
                    warn!(
                        "[POOL] Auth failure on session for {} ({}), refreshing token",
                        key, reason
                    );
                    conn.mark_broken();
                    drop(conn);
                    self.tokens.invalidate(&key);
                    // Idle siblings authenticated with the same token
                    self.pool.drain(Some(&key));
                    retried = true;
                }
                Err(e) => {
                    if !matches!(e, TransportError::Protocol(_)) {
                        conn.mark_broken();
                    }
                    return Err(e.into_error(&key));
                }
            }
        }
    }

    // ========================================================================
    // Cache
    // ========================================================================

    pub fn get_list(&self, email: &str, scope: &ListScope, force_refresh: bool) -> Option<Vec<u8>> {
        self.cache.get_list(email, scope, force_refresh)
    }

    pub fn write_list(&self, email: &str, scope: &ListScope, payload: &[u8]) {
        self.cache.put_list(email, scope, payload);
    }

    pub fn get_detail(&self, email: &str, key: &DetailKey, force_refresh: bool) -> Option<Vec<u8>> {
        self.cache.get_detail(email, key, force_refresh)
    }

    pub fn write_detail(&self, email: &str, key: &DetailKey, payload: &[u8]) {
        self.cache.put_detail(email, key, payload);
    }

    /// Cached list page decoded from JSON; an undecodable page is a miss
    pub fn get_list_json<T: DeserializeOwned>(
        &self,
        email: &str,
        scope: &ListScope,
        force_refresh: bool,
    ) -> Option<T> {
        decode_json(self.get_list(email, scope, force_refresh)?, email)
    }

    pub fn write_list_json<T: Serialize>(
        &self,
        email: &str,
        scope: &ListScope,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value).context("Failed to serialize list page")?;
        self.write_list(email, scope, &payload);
        Ok(())
    }

    /// Cached message decoded from JSON; an undecodable message is a miss
    pub fn get_detail_json<T: DeserializeOwned>(
        &self,
        email: &str,
        key: &DetailKey,
        force_refresh: bool,
    ) -> Option<T> {
        decode_json(self.get_detail(email, key, force_refresh)?, email)
    }

    pub fn write_detail_json<T: Serialize>(
        &self,
        email: &str,
        key: &DetailKey,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value).context("Failed to serialize message")?;
        self.write_detail(email, key, &payload);
        Ok(())
    }

    /// Forget a message deleted upstream; returns detail rows removed
    pub fn remove_message(&self, email: &str, message_id: &str) -> usize {
        self.cache.remove_message(email, message_id)
    }

    /// Forget everything held for an account: token, idle sessions and
    /// memory-cached mail
    pub fn invalidate_account(&self, email: &str) -> DrainReport {
        let key = account_key(email);
        self.tokens.invalidate(&key);
        let report = self.pool.drain(Some(&key));
        let dropped = self.cache.forget_account(&key);
        info!(
            "[POOL] Invalidated {}: {} session(s) drained, {} cache entries dropped",
            key,
            report.total(),
            dropped
        );
        report
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Start a batch of arbitrary work
    pub fn run_batch<T, F, E>(
        &self,
        label: &str,
        items: Vec<BatchItem<T>>,
        concurrency: Option<usize>,
        work: F,
    ) -> Result<BatchHandle>
    where
        T: Send + 'static,
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Display,
    {
        self.batches.submit(label, items, concurrency, work)
    }

    /// Force a token refresh for every account
    pub fn refresh_tokens(
        &self,
        accounts: Vec<AccountIdentity>,
        concurrency: Option<usize>,
    ) -> Result<BatchHandle> {
        let tokens = Arc::clone(&self.tokens);
        let items = accounts
            .into_iter()
            .map(|account| BatchItem::new(account.key(), account))
            .collect();

        self.batches
            .submit("refresh_tokens", items, concurrency, move |account| {
                tokens.refresh(&account).map(|_| ())
            })
    }

    /// Validate credentials, detect the API method and hand each account to `sink`
    pub fn import_accounts(
        &self,
        accounts: Vec<AccountIdentity>,
        concurrency: Option<usize>,
        sink: Arc<dyn AccountSink>,
    ) -> Result<BatchHandle> {
        let tokens = Arc::clone(&self.tokens);
        let capabilities = Arc::clone(&self.capabilities);
        let items = accounts
            .into_iter()
            .map(|account| BatchItem::new(account.key(), account))
            .collect();

        self.batches
            .submit("import_accounts", items, concurrency, move |account| {
                import_one(&tokens, &capabilities, sink.as_ref(), account)
            })
    }

    pub fn batch_progress(&self, batch_id: &str) -> Result<Option<BatchProgress>> {
        self.batches.progress(batch_id)
    }

    pub fn batch_items(
        &self,
        batch_id: &str,
        status: Option<ItemStatus>,
    ) -> Result<Vec<ItemRecord>> {
        self.batches.items(batch_id, status)
    }

    /// Forget batches that finished more than `max_age` ago
    pub fn purge_batches(&self, max_age: Duration) -> Result<usize> {
        self.batches.purge_finished(max_age)
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Detected API method, probing once per account
    pub fn api_method_for(&self, account: &AccountIdentity) -> Result<ApiMethod> {
        self.capabilities.api_method_for(account)
    }

    pub fn reprobe(&self, account: &AccountIdentity) -> Result<ApiMethod> {
        self.capabilities.reprobe(account)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            pools: self.pool.all_stats(),
            cache: self.cache.stats(),
            cached_tokens: self.tokens.cached_accounts(),
            token_refreshes: self.tokens.refresh_count(),
        }
    }

    /// Close the pool and log out every session
    pub fn shutdown(&self) -> DrainReport {
        self.pool.shutdown()
    }
}

fn import_one(
    tokens: &TokenCache,
    capabilities: &CapabilityCache,
    sink: &dyn AccountSink,
    mut account: AccountIdentity,
) -> Result<()> {
    tokens.acquire(&account)?;
    account.api_method = capabilities.api_method_for(&account)?;
    sink.store_account(&account).map_err(Error::Storage)
}

fn decode_json<T: DeserializeOwned>(payload: Vec<u8>, email: &str) -> Option<T> {
    match serde_json::from_slice(&payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("[CACHE] Ignoring undecodable JSON entry for {}: {}", email, e);
            None
        }
    }
}
