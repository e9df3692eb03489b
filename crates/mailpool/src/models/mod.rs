//! Domain models shared across the crate

mod account;
mod batch;
mod cache_key;
mod token;

pub use account::{AccountIdentity, ApiMethod, account_key};
pub use batch::{BatchProgress, BatchState, ItemRecord, ItemStatus};
pub use cache_key::{CacheKey, DetailKey, ListScope};
pub use token::CachedAccessToken;
