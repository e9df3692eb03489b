//! Checked-out session guard

use log::{debug, warn};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use super::connection::{AccountPool, PoolShared};
use crate::transport::MailSession;

/// A session checked out of the pool
///
/// Dereferences to the session. Dropping the guard checks the session back
/// in: it is probed and returned to the idle set if healthy, otherwise it
/// is discarded and the account's capacity is freed.
pub struct PooledConnection {
    session: Option<Box<dyn MailSession>>,
    pool: Arc<AccountPool>,
    shared: Arc<PoolShared>,
    generation: u64,
    validated_at: Instant,
    broken: bool,
}

impl PooledConnection {
    pub(super) fn new(
        session: Box<dyn MailSession>,
        pool: Arc<AccountPool>,
        shared: Arc<PoolShared>,
        generation: u64,
        validated_at: Instant,
    ) -> Self {
        Self {
            session: Some(session),
            pool,
            shared,
            generation,
            validated_at,
            broken: false,
        }
    }

    /// Account key the session belongs to
    pub fn account(&self) -> &str {
        self.pool.account()
    }

    /// When the session last answered a probe or was opened
    pub fn validated_at(&self) -> Instant {
        self.validated_at
    }

    /// Discard the session on drop instead of returning it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn checkin(&mut self, mut session: Box<dyn MailSession>) {
        if self.broken {
            debug!("[POOL] Discarding session for {} (marked broken)", self.account());
            drop(session);
            self.pool.release_slot();
            return;
        }

        if let Err(e) = session.noop() {
            warn!(
                "[POOL] Session for {} failed checkin probe, discarding: {}",
                self.account(),
                e
            );
            drop(session);
            self.pool.release_slot();
            return;
        }

        if let Some(mut stale) =
            self.pool
                .restore(session, self.generation, self.shared.is_closed())
        {
            // Drained or shut down while checked out
            debug!("[POOL] Retiring session for {} after drain", self.account());
            if let Err(e) = stale.logout() {
                debug!("[POOL] Logout for {} failed: {}", self.account(), e);
            }
            drop(stale);
            self.pool.release_slot();
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("generation", &self.generation)
            .field("validated_at", &self.validated_at)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn MailSession;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .expect("session is present until the guard drops")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .expect("session is present until the guard drops")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.checkin(session);
        }
    }
}
