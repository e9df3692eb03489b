//! Two-tier cache for retrieved mail data
//!
//! A small memory tier (LRU with a TTL) sits in front of a larger persistent
//! tier whose payloads are zstd-compressed above a size threshold. The
//! persistent tier evicts least-used rows once it nears its row or byte
//! budget.

mod email;
mod memory;
mod tiered;

pub use email::{EmailCache, EmailCacheStats};
pub use memory::MemoryTier;
pub use tiered::{TierStats, TieredCache};
