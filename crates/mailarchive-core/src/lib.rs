//! Domain types and storage backends for the mail archive.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod error;
mod mongo;
mod sqlite;

pub use error::{ArchiveError, Result};
pub use mongo::{MongoArchiveStore, MongoConfig};
pub use sqlite::{SearchHit, SqliteArchiveStore};

pub const MESSAGE_ID_HEADER: &str = "Message-Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    #[serde(rename = "imap-plain")]
    Plain,
    #[serde(rename = "imap-secure")]
    Secure,
}

impl Transport {
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Plain => 143,
            Transport::Secure => 993,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// One configured remote mailbox. Built once from configuration, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub credentials: Option<Credentials>,
    pub skip_tls_verify: bool,
}

/// A folder as reported by the server's listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub flags: Vec<String>,
    pub delimiter: Option<String>,
    pub name: String,
}

impl FolderEntry {
    pub fn is_selectable(&self) -> bool {
        !self.flags.iter().any(|flag| {
            flag.eq_ignore_ascii_case("\\Noselect") || flag.eq_ignore_ascii_case("\\NonExistent")
        })
    }
}

/// Header fields in the order they were received. Names keep their original
/// spelling; lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<(String, String)>> for HeaderList {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }
}

/// The persisted unit: one message archived under (account, folder, message id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub account: String,
    pub folder: String,
    pub message_id: String,
    pub headers: HeaderList,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Duplicate,
}

/// Capability shared by every archive backend.
///
/// `store` must never leave a partial record behind: either the whole record
/// becomes visible to `exists`, or nothing does.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn exists(&self, account: &str, folder: &str, message_id: &str) -> Result<bool>;
    async fn store(&self, record: &MessageRecord) -> Result<StoreOutcome>;
    async fn close(&self);
}
