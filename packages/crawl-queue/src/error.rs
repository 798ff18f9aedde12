use thiserror::Error;

/// Hard failures of the crawl queue.
///
/// Expected business outcomes (skipped pages, duplicate jobs, lost claim
/// races) are not errors and never surface through this type.
#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record lookup failed: {0}")]
    Lookup(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CrawlerError>;
