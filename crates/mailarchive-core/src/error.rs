use thiserror::Error;

/// Failure taxonomy shared by every stage of the archive pipeline.
///
/// Where an error is caught decides its blast radius: `Connection` and `Auth`
/// end the current account, `Config` ends the run, everything else is scoped
/// to one folder or one message.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl ArchiveError {
    pub fn is_account_fatal(&self) -> bool {
        matches!(self, ArchiveError::Connection(_) | ArchiveError::Auth(_))
    }
}

impl From<sqlx::Error> for ArchiveError {
    fn from(err: sqlx::Error) -> Self {
        ArchiveError::Storage(err.to_string())
    }
}

impl From<mongodb::error::Error> for ArchiveError {
    fn from(err: mongodb::error::Error) -> Self {
        ArchiveError::Storage(err.to_string())
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
