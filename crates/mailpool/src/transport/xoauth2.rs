//! XOAUTH2 bearer handshake

use base64::prelude::*;
use std::fmt;

use crate::models::CachedAccessToken;

/// Credentials for the XOAUTH2 SASL mechanism
///
/// The initial client response is
/// `user=<email>\x01auth=Bearer <token>\x01\x01`.
#[derive(Clone, PartialEq, Eq)]
pub struct XOAuth2 {
    user: String,
    access_token: String,
}

impl XOAuth2 {
    pub fn new(user: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            access_token: access_token.into(),
        }
    }

    /// Handshake for `email` using a cached token
    pub fn from_token(email: &str, token: &CachedAccessToken) -> Self {
        Self::new(email.trim(), token.token_value.clone())
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Raw SASL initial response
    pub fn sasl_string(&self) -> String {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.access_token)
    }

    /// Base64 form sent after `AUTHENTICATE XOAUTH2`
    pub fn encoded(&self) -> String {
        BASE64_STANDARD.encode(self.sasl_string())
    }
}

impl fmt::Debug for XOAuth2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XOAuth2")
            .field("user", &self.user)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sasl_string_layout() {
        let auth = XOAuth2::new("someone@example.com", "ya29.token");
        assert_eq!(
            auth.sasl_string(),
            "user=someone@example.com\u{1}auth=Bearer ya29.token\u{1}\u{1}"
        );
    }

    #[test]
    fn test_encoded_decodes_back() {
        let auth = XOAuth2::new("someone@example.com", "ya29.token");
        let decoded = BASE64_STANDARD.decode(auth.encoded()).unwrap();
        assert_eq!(decoded, auth.sasl_string().into_bytes());
    }

    #[test]
    fn test_debug_hides_token() {
        let auth = XOAuth2::new("someone@example.com", "ya29.token");
        assert!(!format!("{:?}", auth).contains("ya29"));
    }
}
