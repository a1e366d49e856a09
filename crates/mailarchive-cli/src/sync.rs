use std::ops::AddAssign;

use tracing::{debug, info, warn};

use mailarchive_content::{DecodedMessage, decode_message};
use mailarchive_core::{
    Account, ArchiveError, ArchiveStore, MESSAGE_ID_HEADER, MessageRecord, Result, StoreOutcome,
};
use mailarchive_mail::MailboxSession;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FolderStats {
    pub(crate) stored: usize,
    pub(crate) duplicates: usize,
    pub(crate) missing: usize,
    pub(crate) failed: usize,
}

impl FolderStats {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Stored => self.stored += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::Missing => self.missing += 1,
            MessageOutcome::Failed => self.failed += 1,
        }
    }
}

impl AddAssign for FolderStats {
    fn add_assign(&mut self, other: Self) {
        self.stored += other.stored;
        self.duplicates += other.duplicates;
        self.missing += other.missing;
        self.failed += other.failed;
    }
}

/// Outcome of one account's run. `error` holds whatever ended the account
/// early; counts gathered before that point are kept.
#[derive(Debug)]
pub(crate) struct SyncReport {
    pub(crate) account: String,
    pub(crate) folders: usize,
    pub(crate) skipped_folders: usize,
    pub(crate) stats: FolderStats,
    pub(crate) error: Option<ArchiveError>,
}

impl SyncReport {
    fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            folders: 0,
            skipped_folders: 0,
            stats: FolderStats::default(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Stored,
    Duplicate,
    Missing,
    Failed,
}

/// Drives accounts one at a time through a fresh mailbox session each.
pub(crate) struct Archiver<'s, F> {
    store: &'s dyn ArchiveStore,
    sessions: F,
}

impl<'s, F> Archiver<'s, F>
where
    F: Fn(&Account) -> Box<dyn MailboxSession>,
{
    pub(crate) fn new(store: &'s dyn ArchiveStore, sessions: F) -> Self {
        Self { store, sessions }
    }

    pub(crate) async fn run(&self, accounts: &[Account]) -> Vec<SyncReport> {
        let mut reports = Vec::with_capacity(accounts.len());
        for account in accounts {
            reports.push(self.archive_account(account).await);
        }
        reports
    }

    pub(crate) async fn archive_account(&self, account: &Account) -> SyncReport {
        let mut report = SyncReport::new(&account.name);
        let mut session = (self.sessions)(account);
        info!(account = %account.name, host = %account.host, "connecting");

        if let Err(err) = self
            .archive_session(account, session.as_mut(), &mut report)
            .await
        {
            warn!(account = %account.name, error = %err, "account aborted");
            report.error = Some(err);
        }
        session.close().await;

        info!(
            account = %account.name,
            folders = report.folders,
            stored = report.stats.stored,
            duplicates = report.stats.duplicates,
            missing = report.stats.missing,
            failed = report.stats.failed,
            "account done"
        );
        report
    }

    async fn archive_session(
        &self,
        account: &Account,
        session: &mut dyn MailboxSession,
        report: &mut SyncReport,
    ) -> Result<()> {
        session.open().await?;
        let listing = session.list_folders("").await?;

        for entry in listing {
            let folder = match entry {
                Ok(folder) => folder,
                Err(err) => {
                    warn!(account = %account.name, error = %err, "skipping folder");
                    report.skipped_folders += 1;
                    continue;
                }
            };
            if !folder.is_selectable() {
                debug!(account = %account.name, folder = %folder.name, "not selectable");
                continue;
            }
            let mut stats = FolderStats::default();
            let result = self
                .archive_folder(account, session, &folder.name, &mut stats)
                .await;
            report.stats += stats;
            match result {
                Ok(()) => report.folders += 1,
                Err(err) if err.is_account_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        account = %account.name,
                        folder = %folder.name,
                        error = %err,
                        "skipping folder"
                    );
                    report.skipped_folders += 1;
                }
            }
        }
        Ok(())
    }

    /// Counts land in `stats` as they happen, so an account-fatal error
    /// keeps whatever was archived before it.
    async fn archive_folder(
        &self,
        account: &Account,
        session: &mut dyn MailboxSession,
        folder: &str,
        stats: &mut FolderStats,
    ) -> Result<()> {
        let listing = session.list_message_ids(folder).await?;
        debug!(
            account = %account.name,
            folder,
            exists = listing.exists,
            uids = listing.uids.len(),
            "folder selected"
        );

        for uid in listing.uids {
            let outcome = self.archive_message(account, session, folder, uid).await?;
            stats.record(outcome);
        }
        info!(
            account = %account.name,
            folder,
            stored = stats.stored,
            duplicates = stats.duplicates,
            missing = stats.missing,
            failed = stats.failed,
            "folder done"
        );
        Ok(())
    }

    async fn archive_message(
        &self,
        account: &Account,
        session: &mut dyn MailboxSession,
        folder: &str,
        uid: u32,
    ) -> Result<MessageOutcome> {
        let raw = match session.fetch(uid, folder).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                warn!(account = %account.name, folder, uid, "no data for uid, skipping");
                return Ok(MessageOutcome::Missing);
            }
            Err(err) if err.is_account_fatal() => return Err(err),
            Err(err) => {
                warn!(account = %account.name, folder, uid, error = %err, "fetch failed");
                return Ok(MessageOutcome::Failed);
            }
        };

        let record = message_record(&account.name, folder, uid, decode_message(&raw));
        Ok(self.archive_record(account, uid, &record).await)
    }

    async fn archive_record(
        &self,
        account: &Account,
        uid: u32,
        record: &MessageRecord,
    ) -> MessageOutcome {
        let folder = record.folder.as_str();
        match self
            .store
            .exists(&record.account, &record.folder, &record.message_id)
            .await
        {
            Ok(true) => {
                debug!(
                    account = %account.name,
                    folder,
                    uid,
                    message_id = %record.message_id,
                    "already archived"
                );
                return MessageOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(
                    account = %account.name,
                    folder,
                    uid,
                    error = %err,
                    "existence check failed"
                );
                return MessageOutcome::Failed;
            }
        }

        match self.store.store(record).await {
            Ok(StoreOutcome::Stored) => {
                debug!(
                    account = %account.name,
                    folder,
                    uid,
                    message_id = %record.message_id,
                    "stored"
                );
                MessageOutcome::Stored
            }
            Ok(StoreOutcome::Duplicate) => MessageOutcome::Duplicate,
            Err(err) => {
                warn!(
                    account = %account.name,
                    folder,
                    uid,
                    message_id = %record.message_id,
                    error = %err,
                    "store failed"
                );
                MessageOutcome::Failed
            }
        }
    }
}

fn message_record(
    account: &str,
    folder: &str,
    uid: u32,
    decoded: DecodedMessage,
) -> MessageRecord {
    let existing = decoded.message_id().map(str::to_string);
    let DecodedMessage { mut headers, body } = decoded;
    let message_id = match existing {
        Some(id) => id,
        None => {
            let id = synthetic_message_id(account, folder, uid);
            headers.push(MESSAGE_ID_HEADER, id.clone());
            id
        }
    };
    MessageRecord {
        account: account.to_string(),
        folder: folder.to_string(),
        message_id,
        headers,
        body,
    }
}

/// Stable key for a message that arrived without a `Message-Id` header.
fn synthetic_message_id(account: &str, folder: &str, uid: u32) -> String {
    format!("<uid-{}.{}.{}@mailarchive.invalid>", uid, folder, account)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::rc::Rc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;

    use mailarchive_core::{
        Account, ArchiveError, ArchiveStore, Result, SqliteArchiveStore, Transport,
    };
    use mailarchive_mail::{FolderListing, MailboxSession, MessageIdListing};

    use super::{Archiver, FolderStats, synthetic_message_id};

    #[derive(Default)]
    struct FakeServer {
        connect_error: bool,
        folder_lines: Vec<String>,
        folders: BTreeMap<String, BTreeMap<u32, Option<Vec<u8>>>>,
        drop_connection_at: Option<(String, u32)>,
        selected: Vec<String>,
        closes: usize,
    }

    impl FakeServer {
        fn with_folders(names: &[&str]) -> Self {
            let mut server = Self::default();
            for name in names {
                server
                    .folder_lines
                    .push(format!("* LIST (\\HasNoChildren) \"/\" \"{}\"", name));
                server.folders.insert(name.to_string(), BTreeMap::new());
            }
            server
        }

        fn put(&mut self, folder: &str, uid: u32, raw: &[u8]) {
            self.folders
                .entry(folder.to_string())
                .or_default()
                .insert(uid, Some(raw.to_vec()));
        }

        /// Listed by UID SEARCH but gone by the time it is fetched.
        fn put_stale(&mut self, folder: &str, uid: u32) {
            self.folders
                .entry(folder.to_string())
                .or_default()
                .insert(uid, None);
        }
    }

    struct FakeSession {
        server: Rc<RefCell<FakeServer>>,
    }

    #[async_trait(?Send)]
    impl MailboxSession for FakeSession {
        async fn open(&mut self) -> Result<()> {
            if self.server.borrow().connect_error {
                return Err(ArchiveError::Connection("refused".to_string()));
            }
            Ok(())
        }

        async fn list_folders(&mut self, _reference: &str) -> Result<FolderListing> {
            Ok(FolderListing::from_lines(
                self.server.borrow().folder_lines.clone(),
            ))
        }

        async fn list_message_ids(&mut self, folder: &str) -> Result<MessageIdListing> {
            self.server.borrow_mut().selected.push(folder.to_string());
            let server = self.server.borrow();
            let messages = server
                .folders
                .get(folder)
                .ok_or_else(|| ArchiveError::Protocol(format!("no folder {}", folder)))?;
            Ok(MessageIdListing {
                exists: messages.len() as u32,
                uids: messages.keys().copied().collect(),
            })
        }

        async fn fetch(&mut self, uid: u32, folder: &str) -> Result<Option<Vec<u8>>> {
            let server = self.server.borrow();
            if let Some((drop_folder, drop_uid)) = &server.drop_connection_at {
                if drop_folder == folder && *drop_uid <= uid {
                    return Err(ArchiveError::Connection("connection reset".to_string()));
                }
            }
            Ok(server
                .folders
                .get(folder)
                .and_then(|messages| messages.get(&uid))
                .cloned()
                .flatten())
        }

        async fn close(&mut self) {
            self.server.borrow_mut().closes += 1;
        }
    }

    fn account(name: &str) -> Account {
        Account {
            name: name.to_string(),
            host: format!("{}.example.com", name),
            port: 993,
            transport: Transport::Secure,
            credentials: None,
            skip_tls_verify: false,
        }
    }

    fn temp_db_path() -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "mailarchive-sync-{}-{}.db",
            std::process::id(),
            ts
        ))
    }

    fn remove_db(path: &PathBuf) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    fn factory(
        servers: BTreeMap<String, Rc<RefCell<FakeServer>>>,
    ) -> impl Fn(&Account) -> Box<dyn MailboxSession> {
        move |account: &Account| {
            let server = servers.get(&account.name).cloned().unwrap_or_default();
            Box::new(FakeSession { server }) as Box<dyn MailboxSession>
        }
    }

    fn single(
        name: &str,
        server: &Rc<RefCell<FakeServer>>,
    ) -> BTreeMap<String, Rc<RefCell<FakeServer>>> {
        BTreeMap::from([(name.to_string(), Rc::clone(server))])
    }

    const MESSAGE_XY: &[u8] =
        b"From: a@example.com\r\nMessage-Id: <x@y>\r\nSubject: first\r\n\r\nfirst body\r\n";
    const MESSAGE_ZW: &[u8] =
        b"From: b@example.com\r\nMessage-ID: <z@w>\r\nSubject: third\r\n\r\nthird body\r\n";

    #[tokio::test]
    async fn resync_only_stores_new_messages() -> anyhow::Result<()> {
        let db_path = temp_db_path();
        let store = SqliteArchiveStore::open(&db_path).await?;
        let server = Rc::new(RefCell::new(FakeServer::with_folders(&["INBOX"])));
        server.borrow_mut().put("INBOX", 1, MESSAGE_XY);
        server.borrow_mut().put_stale("INBOX", 2);
        let archiver = Archiver::new(&store, factory(single("work", &server)));
        let accounts = [account("work")];

        let first = archiver.run(&accounts).await;
        assert_eq!(
            first[0].stats,
            FolderStats {
                stored: 1,
                duplicates: 0,
                missing: 1,
                failed: 0,
            }
        );
        assert!(store.exists("work", "INBOX", "<x@y>").await?);

        let second = archiver.run(&accounts).await;
        assert_eq!(
            second[0].stats,
            FolderStats {
                stored: 0,
                duplicates: 1,
                missing: 1,
                failed: 0,
            }
        );

        server.borrow_mut().put("INBOX", 3, MESSAGE_ZW);
        let third = archiver.run(&accounts).await;
        assert_eq!(third[0].stats.stored, 1);
        assert_eq!(third[0].stats.duplicates, 1);
        assert!(store.exists("work", "INBOX", "<z@w>").await?);
        assert_eq!(server.borrow().closes, 3);

        store.close().await;
        remove_db(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_mime_part_is_archived_with_empty_body() -> anyhow::Result<()> {
        let db_path = temp_db_path();
        let store = SqliteArchiveStore::open(&db_path).await?;
        let server = Rc::new(RefCell::new(FakeServer::with_folders(&["INBOX"])));
        server.borrow_mut().put(
            "INBOX",
            7,
            b"Message-Id: <broken@example.com>\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
!!!! not base64 ****\r\n\
--b--\r\n",
        );
        let archiver = Archiver::new(&store, factory(single("work", &server)));

        let report = archiver.archive_account(&account("work")).await;
        assert!(report.error.is_none());
        assert_eq!(report.stats.stored, 1);
        assert_eq!(report.stats.failed, 0);
        assert!(store.exists("work", "INBOX", "<broken@example.com>").await?);

        store.close().await;
        remove_db(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn failing_account_does_not_stop_the_run() -> anyhow::Result<()> {
        let db_path = temp_db_path();
        let store = SqliteArchiveStore::open(&db_path).await?;
        let broken = Rc::new(RefCell::new(FakeServer {
            connect_error: true,
            ..FakeServer::default()
        }));
        let work = Rc::new(RefCell::new(FakeServer::with_folders(&["INBOX"])));
        work.borrow_mut().put("INBOX", 1, MESSAGE_XY);
        let servers = BTreeMap::from([
            ("broken".to_string(), Rc::clone(&broken)),
            ("work".to_string(), Rc::clone(&work)),
        ]);
        let archiver = Archiver::new(&store, factory(servers));

        let reports = archiver.run(&[account("broken"), account("work")]).await;
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].error, Some(ArchiveError::Connection(_))));
        assert_eq!(reports[0].folders, 0);
        assert_eq!(broken.borrow().closes, 1);
        assert!(reports[1].error.is_none());
        assert_eq!(reports[1].stats.stored, 1);

        store.close().await;
        remove_db(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn unusable_folders_are_skipped() -> anyhow::Result<()> {
        let db_path = temp_db_path();
        let store = SqliteArchiveStore::open(&db_path).await?;
        let server = Rc::new(RefCell::new(FakeServer::with_folders(&["INBOX"])));
        {
            let mut server = server.borrow_mut();
            server.put("INBOX", 1, MESSAGE_XY);
            server
                .folder_lines
                .push("* LIST (\\Noselect) \"/\" \"[Gmail]\"".to_string());
            server.folder_lines.push("* LIST garbage".to_string());
            // Listed but gone by the time it is selected.
            server
                .folder_lines
                .push("* LIST () \"/\" \"Vanished\"".to_string());
        }
        let archiver = Archiver::new(&store, factory(single("work", &server)));

        let report = archiver.archive_account(&account("work")).await;
        assert!(report.error.is_none());
        assert_eq!(report.folders, 1);
        assert_eq!(report.skipped_folders, 2);
        assert_eq!(report.stats.stored, 1);

        store.close().await;
        remove_db(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn dedup_is_scoped_to_folder_and_synthesizes_missing_ids() -> anyhow::Result<()> {
        let db_path = temp_db_path();
        let store = SqliteArchiveStore::open(&db_path).await?;
        let server = Rc::new(RefCell::new(FakeServer::with_folders(&["Archive", "INBOX"])));
        {
            let mut server = server.borrow_mut();
            server.put("INBOX", 1, MESSAGE_XY);
            server.put("Archive", 1, MESSAGE_XY);
            server.put("INBOX", 9, b"Subject: no id\r\n\r\nanonymous\r\n");
        }
        let archiver = Archiver::new(&store, factory(single("work", &server)));

        let first = archiver.archive_account(&account("work")).await;
        assert_eq!(first.stats.stored, 3);
        assert!(store.exists("work", "Archive", "<x@y>").await?);
        assert!(
            store
                .exists("work", "INBOX", &synthetic_message_id("work", "INBOX", 9))
                .await?
        );

        let second = archiver.archive_account(&account("work")).await;
        assert_eq!(second.stats.stored, 0);
        assert_eq!(second.stats.duplicates, 3);

        store.close().await;
        remove_db(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_connection_ends_the_account() -> anyhow::Result<()> {
        let db_path = temp_db_path();
        let store = SqliteArchiveStore::open(&db_path).await?;
        let server = Rc::new(RefCell::new(FakeServer::with_folders(&["INBOX", "Later"])));
        {
            let mut server = server.borrow_mut();
            server.put("INBOX", 1, MESSAGE_XY);
            server.put("INBOX", 2, MESSAGE_ZW);
            server.put("INBOX", 3, MESSAGE_ZW);
            server.put("Later", 1, MESSAGE_XY);
            server.drop_connection_at = Some(("INBOX".to_string(), 2));
        }
        let archiver = Archiver::new(&store, factory(single("work", &server)));

        let report = archiver.archive_account(&account("work")).await;
        assert!(matches!(report.error, Some(ArchiveError::Connection(_))));
        assert_eq!(report.stats.stored, 1);
        assert_eq!(report.stats.failed, 0);
        assert_eq!(report.folders, 0);
        assert_eq!(server.borrow().selected, vec!["INBOX".to_string()]);
        assert_eq!(server.borrow().closes, 1);
        assert!(!store.exists("work", "Later", "<x@y>").await?);

        store.close().await;
        remove_db(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn message_with_unreadable_headers_is_archived_once() -> anyhow::Result<()> {
        let db_path = temp_db_path();
        let store = SqliteArchiveStore::open(&db_path).await?;
        let server = Rc::new(RefCell::new(FakeServer::with_folders(&["INBOX"])));
        server.borrow_mut().put(
            "INBOX",
            5,
            b" orphaned: continuation\r\nSubject: late\r\n\r\nbody\r\n",
        );
        let archiver = Archiver::new(&store, factory(single("work", &server)));

        let first = archiver.archive_account(&account("work")).await;
        assert_eq!(first.stats.stored, 1);
        assert_eq!(first.stats.failed, 0);
        assert!(
            store
                .exists("work", "INBOX", &synthetic_message_id("work", "INBOX", 5))
                .await?
        );

        let second = archiver.archive_account(&account("work")).await;
        assert_eq!(second.stats.stored, 0);
        assert_eq!(second.stats.duplicates, 1);

        store.close().await;
        remove_db(&db_path);
        Ok(())
    }
}
