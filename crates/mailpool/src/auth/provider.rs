//! Refresh-grant exchange against the OAuth2 token endpoint
//!
//! Uses synchronous HTTP (ureq) to stay executor-agnostic.

use log::debug;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::config::IdentitySettings;
use crate::error::{Error, Result};

/// Inputs of one refresh-grant exchange
#[derive(Clone, Copy)]
pub struct RefreshRequest<'a> {
    /// Account key, used for error attribution only
    pub account: &'a str,
    pub client_id: &'a str,
    pub refresh_token: &'a str,
    pub scope: &'a str,
}

impl fmt::Debug for RefreshRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("account", &self.account)
            .field("client_id", &self.client_id)
            .field("refresh_token", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Successful answer of the token endpoint
#[derive(Clone, PartialEq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime in seconds as reported by the provider
    pub expires_in: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Present when the provider rotated the refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("rotated", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

/// Something that exchanges refresh tokens for access tokens
///
/// Implementations classify failures: a rejected grant is
/// [`Error::InvalidCredential`], provider or network trouble is
/// [`Error::TransientUpstream`], and an elapsed request deadline is
/// [`Error::Timeout`].
pub trait IdentityProvider: Send + Sync {
    fn refresh(&self, request: &RefreshRequest<'_>) -> Result<TokenGrant>;
}

/// Error body of the token endpoint
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// [`IdentityProvider`] talking to an OAuth2 token endpoint over HTTPS
pub struct HttpIdentityProvider {
    agent: ureq::Agent,
    token_url: String,
    timeout: Duration,
}

impl HttpIdentityProvider {
    pub fn new(token_url: impl Into<String>, timeout: Duration) -> Self {
        // Status codes are inspected by hand so the error body can be read
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            token_url: token_url.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &IdentitySettings) -> Self {
        Self::new(settings.token_url.clone(), settings.request_timeout())
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    fn map_transport_error(&self, err: ureq::Error) -> Error {
        match err {
            ureq::Error::Timeout(_) => Error::Timeout {
                operation: "token exchange",
                elapsed: self.timeout,
            },
            ureq::Error::StatusCode(status) => Error::transient(format!(
                "token endpoint answered HTTP {}",
                status
            )),
            other => Error::transient(format!("token endpoint unreachable: {}", other)),
        }
    }
}

impl IdentityProvider for HttpIdentityProvider {
    fn refresh(&self, request: &RefreshRequest<'_>) -> Result<TokenGrant> {
        debug!(
            "[TOKENS] Exchanging refresh token for {} (scope: {})",
            request.account, request.scope
        );

        let mut response = self
            .agent
            .post(&self.token_url)
            .send_form([
                ("client_id", request.client_id),
                ("grant_type", "refresh_token"),
                ("refresh_token", request.refresh_token),
                ("scope", request.scope),
            ])
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(classify_status(request.account, status, &body));
        }

        response
            .body_mut()
            .read_json::<TokenGrant>()
            .map_err(|e| Error::Protocol {
                message: format!("unreadable token response: {}", e),
            })
    }
}

/// Map a non-success status of the token endpoint onto an error
///
/// 429 is a throttle, not a verdict on the grant, so it stays transient.
pub(crate) fn classify_status(account: &str, status: u16, body: &str) -> Error {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let reason = match (parsed.error, parsed.error_description) {
        (Some(code), Some(description)) => format!("{}: {}", code, first_line(&description)),
        (Some(code), None) => code,
        (None, _) => format!("HTTP {}", status),
    };

    match status {
        429 => Error::transient(format!("token endpoint throttled {}: {}", account, reason)),
        400..=499 => Error::InvalidCredential {
            account: account.to_string(),
            reason,
        },
        _ => Error::transient(format!("token endpoint failed for {}: {}", account, reason)),
    }
}

// Provider descriptions carry trace ids and timestamps on later lines
fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s).trim()
}
