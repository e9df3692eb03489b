//! Account identity as handed over by the account layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which upstream API an account is served through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMethod {
    /// Legacy mailbox protocol with XOAUTH2
    #[default]
    Imap,
    /// Graph REST API
    Graph,
}

impl ApiMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMethod::Imap => "imap",
            ApiMethod::Graph => "graph",
        }
    }
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imap" => Ok(ApiMethod::Imap),
            "graph" | "graph_api" => Ok(ApiMethod::Graph),
            other => Err(format!("unknown api method: {}", other)),
        }
    }
}

/// Credentials for one mailbox
///
/// Owned by the caller. This layer reads it and never writes it back; a
/// rotated refresh token is reported through
/// [`RefreshTokenSink`](crate::auth::RefreshTokenSink) instead.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountIdentity {
    /// Mailbox address
    pub email: String,
    /// OAuth2 client (application) ID the refresh token was issued to
    pub client_id: String,
    /// Long-lived refresh token
    pub refresh_token: String,
    /// API used to reach the mailbox
    #[serde(default)]
    pub api_method: ApiMethod,
}

impl AccountIdentity {
    pub fn new(
        email: impl Into<String>,
        client_id: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            client_id: client_id.into(),
            refresh_token: refresh_token.into(),
            api_method: ApiMethod::default(),
        }
    }

    /// Set the API method
    pub fn with_api_method(mut self, api_method: ApiMethod) -> Self {
        self.api_method = api_method;
        self
    }

    /// Normalized key used by every cache and pool
    pub fn key(&self) -> String {
        account_key(&self.email)
    }
}

// Never print the refresh token.
impl fmt::Debug for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountIdentity")
            .field("email", &self.email)
            .field("client_id", &self.client_id)
            .field("refresh_token", &"<redacted>")
            .field("api_method", &self.api_method)
            .finish()
    }
}

/// Normalize an email address into an account key
pub fn account_key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_normalized() {
        let account = AccountIdentity::new("  User@Example.COM ", "client", "rt");
        assert_eq!(account.key(), "user@example.com");
    }

    #[test]
    fn test_api_method_parse() {
        assert_eq!("IMAP".parse::<ApiMethod>().unwrap(), ApiMethod::Imap);
        assert_eq!("graph_api".parse::<ApiMethod>().unwrap(), ApiMethod::Graph);
        assert!("pop3".parse::<ApiMethod>().is_err());
    }

    #[test]
    fn test_debug_redacts_refresh_token() {
        let account = AccountIdentity::new("a@test", "client", "super-secret");
        let printed = format!("{:?}", account);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("a@test"));
    }

    #[test]
    fn test_deserialize_defaults_api_method() {
        let json = r#"{"email":"a@test","client_id":"c","refresh_token":"r"}"#;
        let account: AccountIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(account.api_method, ApiMethod::Imap);
    }
}
