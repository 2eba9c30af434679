use thiserror::Error;

/// Failures surfaced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No platform data directory could be determined for the default
    /// database location.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Filesystem error while preparing the database location.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A lookup that expected exactly one row found none.
    #[error("Record not found")]
    NotFound,

    /// A schema migration failed to apply.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored id failed to parse back into a UUID.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// A stored timestamp failed to parse back as RFC-3339.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

/// Alias used by every store operation.
pub type Result<T> = std::result::Result<T, StoreError>;
