//! Cached OAuth2 access token

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An access token obtained through a refresh-grant exchange
///
/// Persisted per account key. `expires_at` is already capped at the
/// configured maximum cache duration, so it can be earlier than the
/// provider's own expiry.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAccessToken {
    /// Account key (normalized email)
    pub account: String,
    /// Bearer value
    pub token_value: String,
    /// Token type reported by the provider (almost always "Bearer")
    pub token_type: String,
    /// Scope the token was requested with
    pub scope: String,
    /// When this layer stops trusting the token
    pub expires_at: DateTime<Utc>,
    /// When the token was obtained
    pub issued_at: DateTime<Utc>,
}

impl CachedAccessToken {
    /// Whether the token may still be handed out with `buffer` to spare
    ///
    /// A token inside its refresh buffer counts as expired.
    pub fn is_usable(&self, buffer: Duration) -> bool {
        self.is_usable_at(Utc::now(), buffer)
    }

    /// [`is_usable`](Self::is_usable) against an explicit clock reading
    pub fn is_usable_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.expires_at >= now + buffer
    }

    /// Time left before `expires_at` (negative once expired)
    pub fn remaining(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Value for an `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token_value)
    }
}

impl fmt::Debug for CachedAccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAccessToken")
            .field("account", &self.account)
            .field("token_value", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
