use broadsheet_scanner::ScanError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Column {column} missing or not {expected}")]
    Column {
        column: String,
        expected: &'static str,
    },

    #[error("Unsupported database URL: {0}")]
    UnsupportedUrl(String),

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("Corrupt stored value in {column}: {value}")]
    Corrupt { column: String, value: String },
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Telemetry store is shut down")]
    Closed,

    #[error("Telemetry write failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("Unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Run deadline reached")]
    DeadlineReached,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type Result<T> = std::result::Result<T, PipelineError>;
