//! Storage traits and implementations
//!
//! Tokens, cached mail and batch progress are persisted behind three traits
//! so the SQLite backend can be swapped for the in-memory one in tests.

mod codec;
mod memory;
mod sqlite;
mod traits;

pub use codec::{EncodedPayload, PayloadCodec};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    BatchStore, CacheStore, CacheTable, EntryFilter, EntryMeta, StoredEntry, TierUsage, TokenStore,
};
