use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl ScanError {
    /// Whether the error came from the network or the remote server rather
    /// than from the input we were handed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanError::HttpError(_) | ScanError::HttpStatus { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
