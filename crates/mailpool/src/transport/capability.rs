//! Per-account API capability detection
//!
//! Some accounts can be served over the Graph API, the rest only over the
//! mailbox protocol. Detection costs a token round trip, so the answer is
//! remembered per account until explicitly reprobed.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::auth::{IdentityProvider, RefreshRequest};
use crate::error::Result;
use crate::models::{AccountIdentity, ApiMethod, account_key};

/// Decides which API an account supports
pub trait CapabilityProbe: Send + Sync {
    /// Errors other than a definite answer are returned and not remembered
    fn probe(&self, account: &AccountIdentity) -> Result<ApiMethod>;
}

/// Probe that asks the identity provider for a Graph-scoped token
///
/// A granted token means Graph works. A rejected grant means the client is
/// not consented for Graph and the account falls back to the mailbox
/// protocol. Anything else (network, 5xx) is not an answer.
pub struct ScopeCapabilityProbe {
    provider: Arc<dyn IdentityProvider>,
    graph_scope: String,
}

impl ScopeCapabilityProbe {
    pub fn new(provider: Arc<dyn IdentityProvider>, graph_scope: impl Into<String>) -> Self {
        Self {
            provider,
            graph_scope: graph_scope.into(),
        }
    }
}

impl CapabilityProbe for ScopeCapabilityProbe {
    fn probe(&self, account: &AccountIdentity) -> Result<ApiMethod> {
        let key = account.key();
        let outcome = self.provider.refresh(&RefreshRequest {
            account: &key,
            client_id: &account.client_id,
            refresh_token: &account.refresh_token,
            scope: &self.graph_scope,
        });

        match outcome {
            Ok(_) => Ok(ApiMethod::Graph),
            Err(e) if e.is_auth_failure() => {
                debug!("[TOKENS] Graph scope refused for {}: {}", key, e);
                Ok(ApiMethod::Imap)
            }
            Err(e) => Err(e),
        }
    }
}

/// Remembered probe results, keyed by account
pub struct CapabilityCache {
    probe: Arc<dyn CapabilityProbe>,
    known: RwLock<HashMap<String, ApiMethod>>,
}

impl CapabilityCache {
    pub fn new(probe: Arc<dyn CapabilityProbe>) -> Self {
        Self {
            probe,
            known: RwLock::new(HashMap::new()),
        }
    }

    /// API method of `account`, probing on first use
    pub fn api_method_for(&self, account: &AccountIdentity) -> Result<ApiMethod> {
        if let Some(method) = self.known(&account.email) {
            return Ok(method);
        }
        self.reprobe(account)
    }

    /// Probe again and replace the remembered answer
    pub fn reprobe(&self, account: &AccountIdentity) -> Result<ApiMethod> {
        let method = self.probe.probe(account)?;
        let key = account.key();
        info!("[TOKENS] {} uses {}", key, method);
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, method);
        Ok(method)
    }

    /// Remembered answer without probing
    pub fn known(&self, email: &str) -> Option<ApiMethod> {
        self.known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account_key(email))
            .copied()
    }

    pub fn forget(&self, email: &str) {
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&account_key(email));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenGrant;
    use crate::error::{Error, ErrorKind};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that answers each call from a script
    struct ScriptedProvider {
        calls: AtomicUsize,
        answers: Mutex<Vec<Result<TokenGrant>>>,
    }

    impl ScriptedProvider {
        fn new(answers: Vec<Result<TokenGrant>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                answers: Mutex::new(answers),
            }
        }
    }

    impl IdentityProvider for ScriptedProvider {
        fn refresh(&self, _request: &RefreshRequest<'_>) -> Result<TokenGrant> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers.lock().unwrap().remove(0)
        }
    }

    fn grant() -> Result<TokenGrant> {
        Ok(TokenGrant {
            access_token: "at".into(),
            expires_in: 3600,
            token_type: "Bearer".into(),
            refresh_token: None,
            scope: None,
        })
    }

    fn rejected() -> Result<TokenGrant> {
        Err(Error::InvalidCredential {
            account: "a@test".into(),
            reason: "invalid_scope".into(),
        })
    }

    fn cache_over(provider: Arc<ScriptedProvider>) -> CapabilityCache {
        CapabilityCache::new(Arc::new(ScopeCapabilityProbe::new(provider, "graph/.default")))
    }

    #[test]
    fn test_probe_result_is_remembered() {
        let provider = Arc::new(ScriptedProvider::new(vec![grant()]));
        let cache = cache_over(provider.clone());
        let account = AccountIdentity::new("A@test", "c", "rt");

        assert_eq!(cache.api_method_for(&account).unwrap(), ApiMethod::Graph);
        assert_eq!(cache.api_method_for(&account).unwrap(), ApiMethod::Graph);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.known("a@test"), Some(ApiMethod::Graph));
    }

    #[test]
    fn test_refused_scope_falls_back_to_imap() {
        let provider = Arc::new(ScriptedProvider::new(vec![rejected()]));
        let cache = cache_over(provider);
        let account = AccountIdentity::new("a@test", "c", "rt");

        assert_eq!(cache.api_method_for(&account).unwrap(), ApiMethod::Imap);
    }

    #[test]
    fn test_transient_failure_is_not_remembered() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(Error::transient("503")),
            grant(),
        ]));
        let cache = cache_over(provider.clone());
        let account = AccountIdentity::new("a@test", "c", "rt");

        let err = cache.api_method_for(&account).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(cache.known("a@test").is_none());

        assert_eq!(cache.api_method_for(&account).unwrap(), ApiMethod::Graph);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reprobe_replaces_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![grant(), rejected()]));
        let cache = cache_over(provider);
        let account = AccountIdentity::new("a@test", "c", "rt");

        assert_eq!(cache.api_method_for(&account).unwrap(), ApiMethod::Graph);
        assert_eq!(cache.reprobe(&account).unwrap(), ApiMethod::Imap);
        assert_eq!(cache.known("a@test"), Some(ApiMethod::Imap));

        cache.forget("a@test");
        assert!(cache.known("a@test").is_none());
    }
}
