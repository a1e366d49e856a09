//! Mailbox access for the archiver: the session capability and its IMAP adapter.

use async_trait::async_trait;

use mailarchive_core::Result;

mod imap_session;
mod listing;

pub use imap_session::ImapSession;
pub use listing::FolderListing;

/// Result of selecting a folder: its message count and every UID in it,
/// ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageIdListing {
    pub exists: u32,
    pub uids: Vec<u32>,
}

/// One authenticated connection to one account.
///
/// `fetch` reports a UID the server has no data for as `Ok(None)`: UIDs can go
/// stale between listing and fetching. `close` is idempotent and never fails.
#[async_trait(?Send)]
pub trait MailboxSession {
    async fn open(&mut self) -> Result<()>;
    async fn list_folders(&mut self, reference: &str) -> Result<FolderListing>;
    async fn list_message_ids(&mut self, folder: &str) -> Result<MessageIdListing>;
    async fn fetch(&mut self, uid: u32, folder: &str) -> Result<Option<Vec<u8>>>;
    async fn close(&mut self);
}
