//! Mail transport seam
//!
//! The wire protocol is not implemented here. A [`SessionConnector`] opens
//! authenticated [`MailSession`]s; the pool only decides when to open,
//! probe, reuse and close them. Failures are reported as
//! [`TransportError`] so retry decisions are made on the variant.

mod capability;
mod xoauth2;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::error::TransportError;
pub use capability::{CapabilityCache, CapabilityProbe, ScopeCapabilityProbe};
pub use xoauth2::XOAuth2;

/// Result of a session operation
pub type SessionResult<T> = std::result::Result<T, TransportError>;

/// Mailbox state reported when a folder is selected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStatus {
    /// Messages in the folder
    pub exists: u32,
    pub recent: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

/// What to fetch for each message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSpec {
    /// Flags and envelope only
    Envelope,
    /// Header block without marking the message seen
    Headers,
    /// Full RFC 822 source without marking the message seen
    Full,
}

impl FetchSpec {
    /// Fetch attribute list requested by this variant
    pub fn items(&self) -> &'static str {
        match self {
            FetchSpec::Envelope => "(UID FLAGS ENVELOPE)",
            FetchSpec::Headers => "(UID FLAGS BODY.PEEK[HEADER])",
            FetchSpec::Full => "(UID FLAGS BODY.PEEK[])",
        }
    }
}

/// One fetched message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    /// Raw bytes for the requested [`FetchSpec`], empty for envelopes
    pub body: Vec<u8>,
    pub envelope: Option<String>,
}

/// How a flag change is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOperation {
    Add,
    Remove,
    Replace,
}

/// A flag change for [`MailSession::store`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChange {
    pub operation: FlagOperation,
    pub flags: Vec<String>,
}

impl FlagChange {
    pub fn add(flags: &[&str]) -> Self {
        Self {
            operation: FlagOperation::Add,
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn remove(flags: &[&str]) -> Self {
        Self {
            operation: FlagOperation::Remove,
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Mark messages for deletion on the next expunge
    pub fn deleted() -> Self {
        Self::add(&["\\Deleted"])
    }
}

/// An authenticated session with the mailbox provider
///
/// Sessions are used by one thread at a time; the pool hands them out
/// exclusively.
pub trait MailSession: Send {
    fn select(&mut self, folder: &str) -> SessionResult<FolderStatus>;

    /// UIDs matching a search query in the selected folder
    fn search(&mut self, query: &str) -> SessionResult<Vec<u32>>;

    fn fetch(&mut self, uids: &[u32], spec: FetchSpec) -> SessionResult<Vec<FetchedMessage>>;

    fn store(&mut self, uids: &[u32], change: &FlagChange) -> SessionResult<()>;

    /// Permanently remove messages flagged as deleted
    fn expunge(&mut self) -> SessionResult<()>;

    /// Cheap round trip used as a health probe
    fn noop(&mut self) -> SessionResult<()>;

    fn logout(&mut self) -> SessionResult<()>;
}

/// Everything a connector needs to open one session
#[derive(Debug, Clone)]
pub struct ConnectParams<'a> {
    /// Account key
    pub account: &'a str,
    pub auth: &'a XOAuth2,
    /// Deadline for connecting and authenticating
    pub connect_timeout: Duration,
    /// Read/write deadline for the session's lifetime
    pub socket_timeout: Duration,
}

/// Opens authenticated sessions
///
/// An authentication rejection must be [`TransportError::Auth`] and an
/// elapsed deadline [`TransportError::Timeout`]; the pool only retries
/// [`TransportError::Network`] and [`TransportError::Tls`].
pub trait SessionConnector: Send + Sync {
    fn connect(&self, params: &ConnectParams<'_>) -> SessionResult<Box<dyn MailSession>>;
}
