use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header value for {name}: {value}")]
    InvalidHeader { name: String, value: String },

    #[error("Invalid proxy configuration: {0}")]
    InvalidProxy(String),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Session snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;
