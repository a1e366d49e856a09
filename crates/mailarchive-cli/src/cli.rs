use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mailarchive", version, about = "Archive IMAP mailboxes into a searchable store")]
pub(crate) struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "cfg", global = true)]
    pub(crate) config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short = 'v', long = "verbose", global = true)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Fetch every folder of the configured accounts and archive new messages
    Sync(SyncCmd),
    /// Full-text search over archived message bodies
    Search(SearchCmd),
}

#[derive(Args, Debug, Default)]
pub(crate) struct SyncCmd {
    /// Restrict the run to this account (repeatable)
    #[arg(long = "account")]
    pub(crate) accounts: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct SearchCmd {
    pub(crate) query: String,
    #[arg(long)]
    pub(crate) account: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub(crate) limit: i64,
    #[arg(long)]
    pub(crate) json: bool,
}

impl Cli {
    pub(crate) fn into_command(self) -> CliCommand {
        self.command
            .unwrap_or_else(|| CliCommand::Sync(SyncCmd::default()))
    }
}
