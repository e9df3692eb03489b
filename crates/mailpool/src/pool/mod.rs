//! Per-account pool of authenticated mail sessions
//!
//! Each account gets at most `capacity_per_account` live sessions. Idle
//! sessions are probed before reuse, and a checkout blocks (up to a
//! deadline) while the account is at capacity.

mod connection;
mod guard;

pub use connection::{ConnectionPool, DrainReport, PoolStats};
pub use guard::PooledConnection;
