//! Mailpool - Access layer for rate-limited mailbox providers
//!
//! This crate sits between an account layer and upstream mailbox providers:
//! - OAuth2 access-token cache with refresh and rotation reporting
//! - Per-account session pool with health checks and bounded capacity
//! - Two-tier (memory + SQLite) cache for folder listings and messages
//! - Bounded-concurrency batch orchestrator with durable progress
//!
//! Everything is blocking and executor-agnostic; the transport itself is
//! supplied by the caller through [`SessionConnector`].

pub mod auth;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod service;
pub mod storage;
pub mod transport;

pub use auth::{HttpIdentityProvider, IdentityProvider, RefreshTokenSink, TokenCache, TokenGrant};
pub use batch::{BatchHandle, BatchItem, BatchOrchestrator};
pub use cache::{EmailCache, EmailCacheStats, TieredCache};
pub use crate::config::{
    BatchSettings, CacheSettings, IdentitySettings, PoolSettings, Settings, TokenSettings,
};
pub use error::{Error, ErrorKind, Result, TransportError};
pub use models::{
    AccountIdentity, ApiMethod, BatchProgress, BatchState, CacheKey, CachedAccessToken, DetailKey,
    ItemRecord, ItemStatus, ListScope, account_key,
};
pub use pool::{ConnectionPool, DrainReport, PoolStats, PooledConnection};
pub use service::{AccountSink, GatewayStats, MailGateway};
pub use storage::{BatchStore, CacheStore, InMemoryStore, SqliteStore, TokenStore};
pub use transport::{
    CapabilityProbe, ConnectParams, FetchSpec, FetchedMessage, FlagChange, FolderStatus,
    MailSession, SessionConnector, SessionResult, XOAuth2,
};
