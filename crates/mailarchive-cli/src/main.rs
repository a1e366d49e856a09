use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mailarchive_core::{Account, ArchiveStore, MongoArchiveStore, SqliteArchiveStore};
use mailarchive_mail::{ImapSession, MailboxSession};

mod cli;
mod config;
mod sync;

use cli::{Cli, CliCommand, SearchCmd, SyncCmd};
use config::{ArchiveConfig, StorageConfig, load_config, resolve_config_path};
use sync::Archiver;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match resolve_config_path(cli.config.as_deref())
        .and_then(|path| load_config(&path))
    {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.into_command() {
        CliCommand::Sync(cmd) => run_sync(&config, cmd).await,
        CliCommand::Search(cmd) => run_search(&config, cmd).await,
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn open_store(storage: &StorageConfig) -> Result<Box<dyn ArchiveStore>> {
    let store: Box<dyn ArchiveStore> = match storage {
        StorageConfig::Relational { path } => {
            info!(path = %path.display(), "opening relational archive");
            Box::new(SqliteArchiveStore::open(path).await?)
        }
        StorageConfig::Document(mongo) => {
            info!(host = %mongo.host, database = %mongo.database, "opening document archive");
            Box::new(MongoArchiveStore::connect(mongo).await?)
        }
    };
    Ok(store)
}

fn imap_session(account: &Account) -> Box<dyn MailboxSession> {
    Box::new(ImapSession::new(account.clone()))
}

/// Per-account failures are reported here and never change the exit code.
async fn run_sync(config: &ArchiveConfig, cmd: SyncCmd) -> Result<()> {
    let accounts = config.select_accounts(&cmd.accounts)?;
    let store = open_store(&config.storage).await?;

    let reports = Archiver::new(&*store, imap_session)
        .run(&accounts)
        .await;
    store.close().await;

    for report in &reports {
        match &report.error {
            Some(err) => warn!(
                account = %report.account,
                folders = report.folders,
                stored = report.stats.stored,
                error = %err,
                "sync incomplete"
            ),
            None => info!(
                account = %report.account,
                folders = report.folders,
                skipped_folders = report.skipped_folders,
                stored = report.stats.stored,
                duplicates = report.stats.duplicates,
                missing = report.stats.missing,
                failed = report.stats.failed,
                "sync complete"
            ),
        }
    }
    Ok(())
}

async fn run_search(config: &ArchiveConfig, cmd: SearchCmd) -> Result<()> {
    let StorageConfig::Relational { path } = &config.storage else {
        bail!("search needs the relational backend");
    };
    if let Some(account) = &cmd.account {
        config.select_accounts(std::slice::from_ref(account))?;
    }
    let store = SqliteArchiveStore::open(path).await?;
    let hits = store
        .search(&cmd.query, cmd.account.as_deref(), cmd.limit)
        .await;
    store.close().await;
    let hits = hits.context("search failed")?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    for hit in &hits {
        println!("{}\t{}\t{}\t{}", hit.account, hit.folder, hit.message_id, hit.snippet);
    }
    if hits.is_empty() {
        info!(query = %cmd.query, "no matches");
    }
    Ok(())
}
