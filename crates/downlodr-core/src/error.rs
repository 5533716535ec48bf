//! Error types for Downlodr

use thiserror::Error;

/// Result type alias using Downlodr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Downlodr error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Download errors (E100-E199)
    #[error("Download '{0}' not found in the queue")]
    DownloadNotFound(String),

    #[error("Failed to fetch metadata for '{url}': {reason}")]
    MetadataFailed { url: String, reason: String },

    #[error("Invalid download URL: {0}")]
    InvalidUrl(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::DownloadNotFound(_) => "E100",
            Self::MetadataFailed { .. } => "E101",
            Self::InvalidUrl(_) => "E102",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::MetadataFailed { .. } => Some("Check the URL and your connection".to_string()),
            Self::ConfigError(_) => Some("downlodr config list".to_string()),
            _ => None,
        }
    }
}
