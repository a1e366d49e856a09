use async_trait::async_trait;
use imap::{ClientBuilder, ConnectionMode, TlsKind};
use tokio::task::block_in_place;
use tracing::debug;

use mailarchive_core::{Account, ArchiveError, Result, Transport};

use crate::listing::quote;
use crate::{FolderListing, MailboxSession, MessageIdListing};

type Session = imap::Session<imap::Connection>;

/// A dropped or closed transport ends the account; anything else is scoped
/// to the command that failed.
fn command_error(context: impl std::fmt::Display, err: imap::Error) -> ArchiveError {
    match &err {
        imap::Error::Io(_) | imap::Error::ConnectionLost | imap::Error::Bye(_) => {
            ArchiveError::Connection(format!("{}: {}", context, err))
        }
        _ => ArchiveError::Protocol(format!("{}: {}", context, err)),
    }
}

/// IMAP adapter. The `imap` client is blocking, so every round-trip runs
/// under `block_in_place` and needs a multi-threaded runtime.
pub struct ImapSession {
    account: Account,
    session: Option<Session>,
    examined: Option<String>,
}

impl ImapSession {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            session: None,
            examined: None,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    fn connect(&self) -> Result<Session> {
        let account = &self.account;
        let Some(credentials) = &account.credentials else {
            return Err(ArchiveError::Auth(format!(
                "no credentials configured for {}",
                account.name
            )));
        };
        debug!(
            account = %account.name,
            host = %account.host,
            port = account.port,
            "imap connect start"
        );
        let mode = match account.transport {
            Transport::Plain => ConnectionMode::Plaintext,
            Transport::Secure => ConnectionMode::Tls,
        };
        let client = ClientBuilder::new(account.host.as_str(), account.port)
            .tls_kind(TlsKind::Native)
            .mode(mode)
            .danger_skip_tls_verify(account.skip_tls_verify)
            .connect()
            .map_err(|err| {
                ArchiveError::Connection(format!("{}:{}: {}", account.host, account.port, err))
            })?;
        debug!(account = %account.name, "imap transport connected");

        let session = client
            .login(&credentials.user, &credentials.password)
            .map_err(|(err, _client)| ArchiveError::Auth(err.to_string()))?;
        debug!(account = %account.name, user = %credentials.user, "imap login ok");
        Ok(session)
    }

    fn active(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| ArchiveError::Protocol("session is not open".to_string()))
    }

    fn examine(&mut self, folder: &str) -> Result<u32> {
        let selected = self.active()?.examine(folder);
        match selected {
            Ok(mailbox) => {
                self.examined = Some(folder.to_string());
                Ok(mailbox.exists)
            }
            Err(err) => {
                self.examined = None;
                Err(command_error(format_args!("cannot select {}", folder), err))
            }
        }
    }

    fn list_folders_blocking(&mut self, reference: &str) -> Result<FolderListing> {
        let command = format!("LIST {} \"*\"", quote(reference));
        let raw = self
            .active()?
            .run_command_and_read_response(&command)
            .map_err(|err| command_error("LIST failed", err))?;
        debug!(account = %self.account.name, bytes = raw.len(), "imap list response");
        Ok(FolderListing::new(raw))
    }

    fn list_message_ids_blocking(&mut self, folder: &str) -> Result<MessageIdListing> {
        let exists = self.examine(folder)?;
        let found = self
            .active()?
            .uid_search("ALL")
            .map_err(|err| command_error(format_args!("UID SEARCH in {}", folder), err))?;
        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(MessageIdListing { exists, uids })
    }

    fn fetch_blocking(&mut self, uid: u32, folder: &str) -> Result<Option<Vec<u8>>> {
        if self.examined.as_deref() != Some(folder) {
            self.examine(folder)?;
        }
        let fetches = self
            .active()?
            .uid_fetch(uid.to_string(), "RFC822")
            .map_err(|err| command_error(format_args!("UID FETCH {} in {}", uid, folder), err))?;
        Ok(fetches.iter().find_map(|f| f.body().map(|b| b.to_vec())))
    }

    fn close_blocking(&mut self) {
        self.examined = None;
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.logout() {
                debug!(account = %self.account.name, error = %err, "imap logout failed");
            }
        }
    }
}

#[async_trait(?Send)]
impl MailboxSession for ImapSession {
    async fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = block_in_place(|| self.connect())?;
        self.session = Some(session);
        Ok(())
    }

    async fn list_folders(&mut self, reference: &str) -> Result<FolderListing> {
        block_in_place(|| self.list_folders_blocking(reference))
    }

    async fn list_message_ids(&mut self, folder: &str) -> Result<MessageIdListing> {
        block_in_place(|| self.list_message_ids_blocking(folder))
    }

    async fn fetch(&mut self, uid: u32, folder: &str) -> Result<Option<Vec<u8>>> {
        block_in_place(|| self.fetch_blocking(uid, folder))
    }

    async fn close(&mut self) {
        block_in_place(|| self.close_blocking());
    }
}
