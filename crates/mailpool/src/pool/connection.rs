//! Connection pool state and checkout logic

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use super::guard::PooledConnection;
use crate::config::PoolSettings;
use crate::error::{Error, ErrorKind, Result, TransportError};
use crate::models::{CachedAccessToken, account_key};
use crate::transport::{ConnectParams, MailSession, SessionConnector, XOAuth2};

/// Outcome of a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Sessions that logged out cleanly within the drain timeout
    pub graceful: usize,
    /// Sessions that failed to log out or were abandoned at the deadline
    pub aborted: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.graceful + self.aborted
    }
}

/// Snapshot of one account's pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub account: String,
    pub idle: usize,
    pub live: usize,
    pub capacity: usize,
}

impl PoolStats {
    /// Sessions currently handed out
    pub fn in_use(&self) -> usize {
        self.live.saturating_sub(self.idle)
    }
}

pub(super) struct IdleSession {
    session: Box<dyn MailSession>,
    validated_at: Instant,
}

struct PoolState {
    idle: Vec<IdleSession>,
    /// Idle plus checked-out sessions, plus slots reserved for sessions being opened
    live: usize,
    /// Bumped by every drain; older checkouts are discarded on checkin
    generation: u64,
}

/// Pool of one account
pub(super) struct AccountPool {
    account: String,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl AccountPool {
    fn new(account: String) -> Self {
        Self {
            account,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                live: 0,
                generation: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn account(&self) -> &str {
        &self.account
    }

    /// Give up one live slot and wake one waiter
    pub(super) fn release_slot(&self) {
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    /// Return a healthy session, unless a drain or shutdown happened since checkout
    ///
    /// Returns the session back when it may not be pooled.
    pub(super) fn restore(
        &self,
        session: Box<dyn MailSession>,
        generation: u64,
        closed: bool,
    ) -> Option<Box<dyn MailSession>> {
        let mut state = self.lock();
        if closed || state.generation != generation {
            return Some(session);
        }
        state.idle.push(IdleSession {
            session,
            validated_at: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
        None
    }

    fn stats(&self, capacity: usize) -> PoolStats {
        let state = self.lock();
        PoolStats {
            account: self.account.clone(),
            idle: state.idle.len(),
            live: state.live,
            capacity,
        }
    }
}

/// State shared between the pool and its guards
pub(super) struct PoolShared {
    settings: PoolSettings,
    connector: Arc<dyn SessionConnector>,
    accounts: RwLock<HashMap<String, Arc<AccountPool>>>,
    closed: AtomicBool,
}

impl PoolShared {
    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Bounded pool of authenticated sessions, keyed by account
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn SessionConnector>, settings: PoolSettings) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                settings,
                connector,
                accounts: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.settings.capacity_per_account
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Check out a session for `email`, authenticating new ones with `token`
    ///
    /// Reuses a probed idle session when one exists, opens a new one while
    /// the account is below capacity, and otherwise waits up to the
    /// checkout timeout for a session to come back.
    pub fn checkout(&self, email: &str, token: &CachedAccessToken) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let key = account_key(email);
        let pool = self.account_pool(&key);
        let timeout = self.shared.settings.checkout_timeout();
        let capacity = self.capacity();
        let deadline = Instant::now() + timeout;

        let mut state = pool.lock();
        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            if let Some(idle) = state.idle.pop() {
                let generation = state.generation;
                drop(state);
                if let Some(conn) = self.revive(&pool, idle, generation) {
                    return Ok(conn);
                }
                state = pool.lock();
                continue;
            }

            if state.live < capacity {
                // Reserve the slot before releasing the lock
                state.live += 1;
                let generation = state.generation;
                drop(state);

                return match self.open_session(&key, token) {
                    Ok(session) => Ok(PooledConnection::new(
                        session,
                        Arc::clone(&pool),
                        Arc::clone(&self.shared),
                        generation,
                        Instant::now(),
                    )),
                    Err(e) => {
                        pool.release_slot();
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("[POOL] Checkout for {} timed out after {:?}", key, timeout);
                return Err(Error::PoolExhausted {
                    account: key,
                    waited: timeout,
                });
            }

            state = pool
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Probe an idle session; on failure its slot is released
    fn revive(
        &self,
        pool: &Arc<AccountPool>,
        idle: IdleSession,
        generation: u64,
    ) -> Option<PooledConnection> {
        let IdleSession {
            mut session,
            validated_at,
        } = idle;

        match session.noop() {
            Ok(()) => {
                debug!(
                    "[POOL] Reusing session for {} (idle {:?})",
                    pool.account(),
                    validated_at.elapsed()
                );
                Some(PooledConnection::new(
                    session,
                    Arc::clone(pool),
                    Arc::clone(&self.shared),
                    generation,
                    Instant::now(),
                ))
            }
            Err(e) => {
                warn!(
                    "[POOL] Discarding stale idle session for {}: {}",
                    pool.account(),
                    e
                );
                drop(session);
                pool.release_slot();
                None
            }
        }
    }

    /// Open and authenticate a session, retrying network and TLS failures
    fn open_session(&self, key: &str, token: &CachedAccessToken) -> Result<Box<dyn MailSession>> {
        let settings = &self.shared.settings;
        let auth = XOAuth2::from_token(key, token);
        let params = ConnectParams {
            account: key,
            auth: &auth,
            connect_timeout: settings.connect_timeout(),
            socket_timeout: settings.socket_timeout(),
        };

        let attempts = settings.connect_retries + 1;
        let mut attempt = 1;
        loop {
            let err = match self.shared.connector.connect(&params) {
                Ok(session) => {
                    debug!("[POOL] Opened session for {} (attempt {})", key, attempt);
                    return Ok(session);
                }
                Err(e) => e,
            };

            match err {
                TransportError::Timeout(elapsed) => {
                    return Err(Error::Timeout {
                        operation: "connect",
                        elapsed,
                    });
                }
                e if e.kind() == ErrorKind::Transient => {
                    if attempt >= attempts {
                        warn!(
                            "[POOL] Giving up on {} after {} attempts: {}",
                            key, attempts, e
                        );
                        return Err(Error::ConnectionFailed {
                            account: key.to_string(),
                            attempts,
                            message: e.to_string(),
                        });
                    }
                    let delay = backoff_delay(settings.retry_base_delay(), attempt);
                    warn!(
                        "[POOL] Connect attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, attempts, key, e, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                e => return Err(e.into_error(key)),
            }
        }
    }

    /// Log out idle sessions of one account (or every account)
    ///
    /// Idle sessions are removed immediately and logged out in parallel;
    /// whatever has not finished when the drain timeout elapses is
    /// abandoned. Sessions checked out at this moment are discarded when
    /// they come back.
    pub fn drain(&self, email: Option<&str>) -> DrainReport {
        let pools: Vec<Arc<AccountPool>> = {
            let accounts = self
                .shared
                .accounts
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match email {
                Some(email) => accounts.get(&account_key(email)).cloned().into_iter().collect(),
                None => accounts.values().cloned().collect(),
            }
        };

        let mut sessions = Vec::new();
        for pool in &pools {
            let mut state = pool.lock();
            state.generation += 1;
            let idle = std::mem::take(&mut state.idle);
            state.live = state.live.saturating_sub(idle.len());
            drop(state);
            pool.available.notify_all();
            sessions.extend(idle.into_iter().map(|i| (pool.account.clone(), i.session)));
        }

        let report = logout_all(sessions, self.shared.settings.drain_timeout());
        if report.total() > 0 {
            info!(
                "[POOL] Drained {} session(s) across {} account(s): {} graceful, {} aborted",
                report.total(),
                pools.len(),
                report.graceful,
                report.aborted
            );
        }
        report
    }

    /// Close the pool and drain every account
    ///
    /// Blocked checkouts wake up and fail with [`Error::PoolClosed`].
    pub fn shutdown(&self) -> DrainReport {
        self.shared.closed.store(true, Ordering::Release);

        let pools: Vec<Arc<AccountPool>> = self
            .shared
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for pool in &pools {
            // Take the lock so no waiter misses the wakeup
            let _state = pool.lock();
            pool.available.notify_all();
        }

        info!("[POOL] Shutting down ({} account(s))", pools.len());
        self.drain(None)
    }

    /// Snapshot of one account, `None` if it never checked out
    pub fn stats(&self, email: &str) -> Option<PoolStats> {
        let key = account_key(email);
        let pool = self
            .shared
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()?;
        Some(pool.stats(self.capacity()))
    }

    /// Snapshots of every known account, sorted by account
    pub fn all_stats(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<AccountPool>> = self
            .shared
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<PoolStats> = pools.iter().map(|p| p.stats(self.capacity())).collect();
        stats.sort_by(|a, b| a.account.cmp(&b.account));
        stats
    }

    fn account_pool(&self, key: &str) -> Arc<AccountPool> {
        if let Some(pool) = self
            .shared
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(pool);
        }

        let mut accounts = self
            .shared
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            accounts
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AccountPool::new(key.to_string()))),
        )
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.shutdown();
        }
    }
}

/// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// Log out sessions in parallel, abandoning stragglers at the deadline
fn logout_all(sessions: Vec<(String, Box<dyn MailSession>)>, timeout: Duration) -> DrainReport {
    let mut report = DrainReport::default();
    if sessions.is_empty() {
        return report;
    }

    let (tx, rx) = mpsc::channel::<bool>();
    let mut pending = 0;
    for (account, mut session) in sessions {
        let tx = tx.clone();
        let spawned = thread::Builder::new()
            .name("mailpool-logout".to_string())
            .spawn(move || {
                let ok = match session.logout() {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("[POOL] Logout for {} failed: {}", account, e);
                        false
                    }
                };
                let _ = tx.send(ok);
            });
        match spawned {
            Ok(_) => pending += 1,
            Err(e) => {
                warn!("[POOL] Could not spawn logout thread: {}", e);
                report.aborted += 1;
            }
        }
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(true) => report.graceful += 1,
            Ok(false) => report.aborted += 1,
            Err(_) => break,
        }
        pending -= 1;
    }
    report.aborted += pending;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FetchSpec, FetchedMessage, FlagChange, FolderStatus, SessionResult};
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
        logouts: AtomicUsize,
        noop_fails: AtomicBool,
        hang_logout: AtomicBool,
    }

    struct MockSession {
        counters: Arc<Counters>,
    }

    impl Drop for MockSession {
        fn drop(&mut self) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl MailSession for MockSession {
        fn select(&mut self, _folder: &str) -> SessionResult<FolderStatus> {
            Ok(FolderStatus::default())
        }

        fn search(&mut self, _query: &str) -> SessionResult<Vec<u32>> {
            Ok(vec![])
        }

        fn fetch(&mut self, _uids: &[u32], _spec: FetchSpec) -> SessionResult<Vec<FetchedMessage>> {
            Ok(vec![])
        }

        fn store(&mut self, _uids: &[u32], _change: &FlagChange) -> SessionResult<()> {
            Ok(())
        }

        fn expunge(&mut self) -> SessionResult<()> {
            Ok(())
        }

        fn noop(&mut self) -> SessionResult<()> {
            if self.counters.noop_fails.load(Ordering::SeqCst) {
                Err(TransportError::Network("connection reset".into()))
            } else {
                Ok(())
            }
        }

        fn logout(&mut self) -> SessionResult<()> {
            if self.counters.hang_logout.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(500));
            }
            self.counters.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Connector that answers from a script, then succeeds
    struct MockConnector {
        counters: Arc<Counters>,
        script: Mutex<VecDeque<TransportError>>,
    }

    impl MockConnector {
        fn new() -> Self {
            Self::failing(vec![])
        }

        fn failing(errors: Vec<TransportError>) -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                script: Mutex::new(errors.into()),
            }
        }
    }

    impl SessionConnector for MockConnector {
        fn connect(&self, params: &ConnectParams<'_>) -> SessionResult<Box<dyn MailSession>> {
            assert!(params.auth.sasl_string().starts_with("user="));
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.script.lock().unwrap().pop_front() {
                return Err(err);
            }
            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    fn settings(capacity: usize, checkout_timeout_ms: u64) -> PoolSettings {
        PoolSettings {
            capacity_per_account: capacity,
            checkout_timeout_ms,
            retry_base_delay_ms: 1,
            drain_timeout_ms: 200,
            ..PoolSettings::default()
        }
    }

    fn token() -> CachedAccessToken {
        let now = Utc::now();
        CachedAccessToken {
            account: "a@test".into(),
            token_value: "at".into(),
            token_type: "Bearer".into(),
            scope: "scope".into(),
            expires_at: now + chrono::Duration::hours(1),
            issued_at: now,
        }
    }

    fn create_pool(connector: MockConnector, capacity: usize) -> (ConnectionPool, Arc<Counters>) {
        let counters = Arc::clone(&connector.counters);
        (
            ConnectionPool::new(Arc::new(connector), settings(capacity, 5_000)),
            counters,
        )
    }

    #[test]
    fn test_sequential_checkouts_reuse_session() {
        let (pool, counters) = create_pool(MockConnector::new(), 2);

        for _ in 0..5 {
            let mut conn = pool.checkout("a@test", &token()).unwrap();
            conn.select("INBOX").unwrap();
        }

        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        let stats = pool.stats("A@test").unwrap();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.in_use(), 0);
    }

    #[test]
    fn test_concurrent_checkouts_respect_capacity() {
        let (pool, counters) = create_pool(MockConnector::new(), 3);
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let conn = pool.checkout("a@test", &token()).unwrap();
                    thread::sleep(Duration::from_millis(20));
                    drop(conn);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(counters.max_live.load(Ordering::SeqCst) <= 3);
        assert!(pool.stats("a@test").unwrap().live <= 3);
    }

    #[test]
    fn test_checkout_times_out_when_exhausted() {
        let connector = MockConnector::new();
        let pool = ConnectionPool::new(Arc::new(connector), settings(1, 50));

        let _held = pool.checkout("a@test", &token()).unwrap();
        let started = Instant::now();
        let err = pool.checkout("a@test", &token()).unwrap_err();

        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_waiter_gets_returned_session() {
        let (pool, counters) = create_pool(MockConnector::new(), 1);
        let pool = Arc::new(pool);

        let held = pool.checkout("a@test", &token()).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.checkout("a@test", &token()).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(30));
        drop(held);

        waiter.join().unwrap().unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_accounts_are_independent() {
        let connector = MockConnector::new();
        let pool = ConnectionPool::new(Arc::new(connector), settings(1, 50));

        let _a = pool.checkout("a@test", &token()).unwrap();
        let _b = pool.checkout("b@test", &token()).unwrap();
        assert_eq!(pool.all_stats().len(), 2);
    }

    #[test]
    fn test_transient_connect_failures_are_retried() {
        let connector = MockConnector::failing(vec![
            TransportError::Network("refused".into()),
            TransportError::Tls("handshake eof".into()),
        ]);
        let (pool, counters) = create_pool(connector, 1);

        pool.checkout("a@test", &token()).unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_connect_gives_up_after_retries() {
        let connector = MockConnector::failing(vec![
            TransportError::Network("refused".into()),
            TransportError::Network("refused".into()),
            TransportError::Network("refused".into()),
        ]);
        let (pool, counters) = create_pool(connector, 1);

        match pool.checkout("a@test", &token()).unwrap_err() {
            Error::ConnectionFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
        // The reserved slot was given back
        assert_eq!(pool.stats("a@test").unwrap().live, 0);
    }

    #[test]
    fn test_auth_rejection_is_not_retried() {
        let connector =
            MockConnector::failing(vec![TransportError::Auth("AUTHENTICATE failed".into())]);
        let (pool, counters) = create_pool(connector, 1);

        let err = pool.checkout("a@test", &token()).unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_timeout_is_distinct() {
        let connector =
            MockConnector::failing(vec![TransportError::Timeout(Duration::from_secs(15))]);
        let (pool, _counters) = create_pool(connector, 1);

        let err = pool.checkout("a@test", &token()).unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "connect", .. }));
    }

    #[test]
    fn test_broken_connection_is_discarded() {
        let (pool, counters) = create_pool(MockConnector::new(), 1);

        let mut conn = pool.checkout("a@test", &token()).unwrap();
        conn.mark_broken();
        drop(conn);

        assert_eq!(pool.stats("a@test").unwrap().live, 0);
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);

        pool.checkout("a@test", &token()).unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_probe_replaces_idle_session() {
        let (pool, counters) = create_pool(MockConnector::new(), 1);
        drop(pool.checkout("a@test", &token()).unwrap());

        counters.noop_fails.store(true, Ordering::SeqCst);
        let conn = pool.checkout("a@test", &token()).unwrap();
        counters.noop_fails.store(false, Ordering::SeqCst);
        drop(conn);

        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats("a@test").unwrap().live, 1);
    }

    #[test]
    fn test_drain_logs_out_idle_and_discards_checked_out() {
        let (pool, counters) = create_pool(MockConnector::new(), 2);

        let first = pool.checkout("a@test", &token()).unwrap();
        let second = pool.checkout("a@test", &token()).unwrap();
        drop(first);

        let report = pool.drain(Some("a@test"));
        assert_eq!(report.graceful, 1);
        assert_eq!(report.aborted, 0);
        assert_eq!(counters.logouts.load(Ordering::SeqCst), 1);

        // Checked out before the drain: not pooled again
        drop(second);
        let stats = pool.stats("a@test").unwrap();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_drain_abandons_slow_logouts() {
        let (pool, counters) = create_pool(MockConnector::new(), 1);
        drop(pool.checkout("a@test", &token()).unwrap());

        counters.hang_logout.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let report = pool.drain(None);

        assert_eq!(report.aborted, 1);
        assert!(started.elapsed() < Duration::from_millis(450));
    }

    #[test]
    fn test_shutdown_wakes_waiters_and_rejects_checkouts() {
        let (pool, _counters) = create_pool(MockConnector::new(), 1);
        let pool = Arc::new(pool);

        let held = pool.checkout("a@test", &token()).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.checkout("a@test", &token()).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(30));

        pool.shutdown();
        assert!(matches!(waiter.join().unwrap(), Err(Error::PoolClosed)));
        assert!(matches!(
            pool.checkout("a@test", &token()),
            Err(Error::PoolClosed)
        ));

        drop(held);
        assert_eq!(pool.stats("a@test").unwrap().live, 0);
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(1000));
    }
}
