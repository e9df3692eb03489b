//! OAuth2 access tokens for mailbox accounts
//!
//! [`TokenCache`] hands out access tokens obtained through the refresh-grant
//! flow of an [`IdentityProvider`]. Tokens are cached in memory and in a
//! [`TokenStore`](crate::storage::TokenStore) so restarts do not cost a
//! round trip per account.

mod cache;
mod provider;

pub use cache::{RefreshTokenSink, TokenCache};
pub use provider::{HttpIdentityProvider, IdentityProvider, RefreshRequest, TokenGrant};
