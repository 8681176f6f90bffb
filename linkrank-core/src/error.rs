use linkrank_scanner::ScanError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Fetch error: {0}")]
    Scan(#[from] ScanError),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("A ranking run is already in progress (lock file {0})")]
    RankInProgress(PathBuf),

    #[error("Could not open store at {path} after {attempts} attempts: {source}")]
    Unavailable {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;
