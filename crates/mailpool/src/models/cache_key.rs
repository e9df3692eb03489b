//! Natural keys for cached list pages and message details

use serde::{Deserialize, Serialize};

use super::account_key;

/// Separator between key segments; folders may contain '/' and '.'
const SEP: char = '\u{1f}';

/// Key of a cached entry inside one account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Account key (normalized email)
    pub account: String,
    /// Entry key within the account
    pub key: String,
}

impl CacheKey {
    pub fn new(account: &str, key: impl Into<String>) -> Self {
        Self {
            account: account_key(account),
            key: key.into(),
        }
    }
}

/// A page of a folder listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListScope {
    pub folder: String,
    pub page: u32,
    pub page_size: u32,
}

impl ListScope {
    pub fn new(folder: impl Into<String>, page: u32, page_size: u32) -> Self {
        Self {
            folder: folder.into(),
            page,
            page_size,
        }
    }

    /// Key of this page within the account
    pub fn cache_key(&self) -> String {
        format!("{}{SEP}{}{SEP}{}", self.folder, self.page, self.page_size)
    }

    /// Prefix shared by every page of `folder`
    pub fn folder_prefix(folder: &str) -> String {
        format!("{}{SEP}", folder)
    }
}

/// A single message, optionally pinned to the folder it was read from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetailKey {
    pub message_id: String,
    pub folder: Option<String>,
}

impl DetailKey {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            folder: None,
        }
    }

    pub fn in_folder(message_id: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            folder: Some(folder.into()),
        }
    }

    /// Key of this message within the account
    pub fn cache_key(&self) -> String {
        format!(
            "{}{SEP}{}",
            self.folder.as_deref().unwrap_or_default(),
            self.message_id
        )
    }
}
