use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use mailarchive_core::{Account, ArchiveError, Credentials, MongoConfig, Result, Transport};

const CONFIG_FILE: &str = "mailarchive.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StorageConfig {
    Relational { path: PathBuf },
    Document(MongoConfig),
}

/// Validated configuration. Accounts are ordered by name.
#[derive(Debug, Clone)]
pub(crate) struct ArchiveConfig {
    pub(crate) storage: StorageConfig,
    pub(crate) accounts: Vec<Account>,
}

impl ArchiveConfig {
    /// All accounts when `names` is empty, otherwise the named ones in
    /// configuration order.
    pub(crate) fn select_accounts(&self, names: &[String]) -> Result<Vec<Account>> {
        if let Some(unknown) = names
            .iter()
            .find(|name| !self.accounts.iter().any(|account| &account.name == *name))
        {
            return Err(ArchiveError::Config(format!("unknown account: {}", unknown)));
        }
        Ok(self
            .accounts
            .iter()
            .filter(|account| names.is_empty() || names.contains(&account.name))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    general: RawGeneral,
    relational: Option<RawRelational>,
    document: Option<RawDocument>,
    #[serde(default)]
    accounts: BTreeMap<String, RawAccount>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Backend {
    Relational,
    Document,
}

#[derive(Debug, Deserialize)]
struct RawGeneral {
    backend: Backend,
}

#[derive(Debug, Deserialize)]
struct RawRelational {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    host: String,
    #[serde(default = "default_document_port")]
    port: u16,
    user: Option<String>,
    password: Option<String>,
    #[serde(default = "default_auth_database")]
    auth_database: String,
    database: String,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    protocol: Transport,
    host: String,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    #[serde(default)]
    skip_tls_verify: bool,
}

fn default_document_port() -> u16 {
    27017
}

fn default_auth_database() -> String {
    "admin".to_string()
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from(CONFIG_FILE),
        xdg_config_dir().join("mailarchive").join(CONFIG_FILE),
    ]
}

pub(crate) fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let candidates = config_path_candidates();
    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| {
            let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
            ArchiveError::Config(format!(
                "no configuration file found (tried {})",
                tried.join(", ")
            ))
        })
}

pub(crate) fn load_config(path: &Path) -> Result<ArchiveConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| ArchiveError::Config(format!("cannot read {}: {}", path.display(), err)))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&text, base_dir)
}

/// Parses and validates configuration text. Relative database paths resolve
/// against `base_dir`.
pub(crate) fn parse_config(text: &str, base_dir: &Path) -> Result<ArchiveConfig> {
    let raw: RawConfig =
        toml::from_str(text).map_err(|err| ArchiveError::Config(err.to_string()))?;

    let storage = match raw.general.backend {
        Backend::Relational => {
            let section = raw.relational.ok_or_else(|| missing_section("relational"))?;
            let path = if section.path.is_absolute() {
                section.path
            } else {
                base_dir.join(section.path)
            };
            StorageConfig::Relational { path }
        }
        Backend::Document => {
            let section = raw.document.ok_or_else(|| missing_section("document"))?;
            if section.host.trim().is_empty() || section.database.trim().is_empty() {
                return Err(ArchiveError::Config(
                    "[document] needs a host and a database".to_string(),
                ));
            }
            StorageConfig::Document(MongoConfig {
                host: section.host,
                port: section.port,
                user: section.user,
                password: section.password,
                auth_database: section.auth_database,
                database: section.database,
            })
        }
    };

    if raw.accounts.is_empty() {
        return Err(ArchiveError::Config("no accounts configured".to_string()));
    }
    let accounts = raw
        .accounts
        .into_iter()
        .map(|(name, account)| build_account(name, account))
        .collect::<Result<Vec<_>>>()?;

    Ok(ArchiveConfig { storage, accounts })
}

fn missing_section(name: &str) -> ArchiveError {
    ArchiveError::Config(format!("backend {} selected but [{}] is missing", name, name))
}

fn build_account(name: String, raw: RawAccount) -> Result<Account> {
    if raw.host.trim().is_empty() {
        return Err(ArchiveError::Config(format!("account {}: empty host", name)));
    }
    let credentials = match (raw.user, raw.password) {
        (Some(user), Some(password)) => Credentials { user, password },
        (None, None) => {
            return Err(ArchiveError::Config(format!(
                "account {}: user and password are required",
                name
            )));
        }
        _ => {
            return Err(ArchiveError::Config(format!(
                "account {}: user and password must be set together",
                name
            )));
        }
    };
    Ok(Account {
        port: raw.port.unwrap_or_else(|| raw.protocol.default_port()),
        host: raw.host,
        transport: raw.protocol,
        credentials: Some(credentials),
        skip_tls_verify: raw.skip_tls_verify,
        name,
    })
}
