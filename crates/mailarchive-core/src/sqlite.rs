use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::{ArchiveStore, MESSAGE_ID_HEADER, MessageRecord, Result, StoreOutcome};

// Created only when the database file holds no objects at all. There is no
// migration path: an existing file is used as-is.
const SCHEMA: [&str; 3] = [
    "CREATE TABLE headers (
        account TEXT NOT NULL,
        folder TEXT NOT NULL,
        headername TEXT NOT NULL,
        headervalue TEXT
     )",
    "CREATE INDEX headers_message_id_idx
     ON headers (account, folder, UPPER(headername), TRIM(headervalue))",
    "CREATE VIRTUAL TABLE messages USING fts5(account, folder, msgid, body)",
];

const INSERT_HEADER: &str =
    "INSERT INTO headers (account, folder, headername, headervalue) VALUES (?, ?, ?, ?)";

const COUNT_MESSAGE_ID: &str = "SELECT COUNT(*) FROM headers
     WHERE account = ? AND folder = ? AND UPPER(headername) = ? AND TRIM(headervalue) = ?";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub account: String,
    pub folder: String,
    pub message_id: String,
    pub snippet: String,
}

/// Archive backed by a single SQLite file with an FTS5 body index.
#[derive(Clone)]
pub struct SqliteArchiveStore {
    pool: SqlitePool,
}

impl SqliteArchiveStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        if store.bootstrap().await? {
            info!(path = %path.display(), "created archive schema");
        } else {
            debug!(path = %path.display(), "archive schema already present");
        }
        Ok(store)
    }

    /// Returns true when the schema was created by this call.
    async fn bootstrap(&self) -> Result<bool> {
        let (objects,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sqlite_master")
            .fetch_one(&self.pool)
            .await?;
        if objects > 0 {
            return Ok(false);
        }
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn search(
        &self,
        query: &str,
        account: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SearchHit>> {
        let mut sql = String::from(
            "SELECT account, folder, msgid, snippet(messages, 3, '[', ']', '...', 12)
             FROM messages WHERE messages MATCH ?",
        );
        if account.is_some() {
            sql.push_str(" AND account = ?");
        }
        sql.push_str(" ORDER BY rank LIMIT ?");

        let mut q = sqlx::query_as::<_, (String, String, String, String)>(&sql).bind(query);
        if let Some(account) = account {
            q = q.bind(account);
        }
        let rows = q.bind(limit.max(1)).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                account: row.0,
                folder: row.1,
                message_id: row.2,
                snippet: row.3,
            })
            .collect())
    }
}

async fn count_message_id<'e, E>(
    executor: E,
    account: &str,
    folder: &str,
    message_id: &str,
) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (count,): (i64,) = sqlx::query_as(COUNT_MESSAGE_ID)
        .bind(account)
        .bind(folder)
        .bind(MESSAGE_ID_HEADER.to_ascii_uppercase())
        .bind(message_id)
        .fetch_one(executor)
        .await?;
    Ok(count)
}

#[async_trait]
impl ArchiveStore for SqliteArchiveStore {
    async fn exists(&self, account: &str, folder: &str, message_id: &str) -> Result<bool> {
        Ok(count_message_id(&self.pool, account, folder, message_id).await? > 0)
    }

    async fn store(&self, record: &MessageRecord) -> Result<StoreOutcome> {
        // Dropping the transaction on any early return rolls it back.
        let mut tx = self.pool.begin().await?;
        if count_message_id(
            &mut *tx,
            &record.account,
            &record.folder,
            &record.message_id,
        )
        .await?
            > 0
        {
            tx.rollback().await?;
            return Ok(StoreOutcome::Duplicate);
        }

        for (name, value) in record.headers.iter() {
            sqlx::query(INSERT_HEADER)
                .bind(&record.account)
                .bind(&record.folder)
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        if record.headers.get(MESSAGE_ID_HEADER).is_none() {
            sqlx::query(INSERT_HEADER)
                .bind(&record.account)
                .bind(&record.folder)
                .bind(MESSAGE_ID_HEADER)
                .bind(&record.message_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("INSERT INTO messages (account, folder, msgid, body) VALUES (?, ?, ?, ?)")
            .bind(&record.account)
            .bind(&record.folder)
            .bind(&record.message_id)
            .bind(&record.body)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(StoreOutcome::Stored)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
