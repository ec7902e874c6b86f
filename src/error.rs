//! Error types for the bootstrap helper.
//!
//! Every fallible operation returns [`BootstrapError`] via [`BootstrapResult`].

use std::path::PathBuf;

use thiserror::Error;

/// Alias for `Result<T, BootstrapError>`.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A database name or application id is empty or is not a plain file name.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Neither a data directory nor an application id was configured.
    #[error("an application id is required when no data directory is set")]
    MissingAppId,

    /// The platform exposes no writable data directory and none was configured.
    #[error("no application data directory is available")]
    NoDataDirectory,

    /// The bundled template database could not be located.
    #[error("template database not found at {}", path.display())]
    MissingTemplateResource { path: PathBuf },

    /// Copying the template into the data directory failed.
    #[error("failed to copy template database to {}: {source}", path.display())]
    CopyFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a usable database.
    #[error("{} is not a valid database: {reason}", path.display())]
    InvalidDatabaseFile { path: PathBuf, reason: String },

    /// The live database could not be opened.
    #[error("failed to open database at {}: {reason}", path.display())]
    OpenFailure { path: PathBuf, reason: String },

    /// Clearing rows failed part way; the transaction was rolled back.
    #[error("failed to delete data in {}: {reason}", path.display())]
    DeleteFailure { path: PathBuf, reason: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for BootstrapError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
