//! Downlodr Plugin System
//!
//! Third-party plugins extend the host through a narrow, data-only API:
//! - Package validation and a managed install store
//! - A registry of contributed menu, task-bar and notification items
//! - A message bridge between the privileged host and the guest side
//! - WASM sandboxing via wasmtime, with a whitelisted import table
//! - Single-flight UI managers for plugin modals, panels and dialogs

pub mod api;
pub mod bridge;
pub mod confine;
pub mod enabled;
pub mod handlers;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod sandbox;
pub mod store;
pub mod system;
#[cfg(test)]
mod testing;
pub mod ui;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use manifest::PluginManifest;
pub use system::PluginSystem;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin validation failed: {0}")]
    ValidationFailed(String),

    #[error("Plugin '{plugin_id}' failed to load: {reason}")]
    LoadFailed { plugin_id: String, reason: String },

    #[error("Plugin '{plugin_id}' failed to initialize: {reason}")]
    InitializationFailed { plugin_id: String, reason: String },

    #[error("Access denied: '{0}' resolves outside its permitted directory")]
    PathViolation(String),

    #[error("WASM execution error: {0}")]
    WasmError(String),

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("{message}")]
    Remote { code: String, message: String },

    #[error(transparent)]
    Download(#[from] downlodr_core::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plugin IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

impl PluginError {
    /// Get error code for this error type
    pub fn code(&self) -> &str {
        match self {
            Self::NotFound(_) => "E500",
            Self::ValidationFailed(_) => "E501",
            Self::LoadFailed { .. } => "E502",
            Self::InitializationFailed { .. } => "E503",
            Self::PathViolation(_) => "E504",
            Self::WasmError(_) => "E505",
            Self::Bridge(_) => "E506",
            Self::Remote { code, .. } => code,
            Self::Download(err) => err.code(),
            Self::Json(_) => "E598",
            Self::IoError(_) => "E599",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NotFound(_) => Some("downlodr plugins list".to_string()),
            Self::ValidationFailed(_) => Some("downlodr plugins validate <path>".to_string()),
            Self::PathViolation(_) => {
                Some("Plugins may only write inside their own data directory".to_string())
            }
            Self::Download(err) => err.suggestion(),
            _ => None,
        }
    }

    /// Data-only form of this error, suitable for crossing the bridge
    pub fn to_remote(&self) -> RemoteError {
        let detail = match self {
            Self::NotFound(detail) | Self::ValidationFailed(detail) | Self::PathViolation(detail) => {
                detail.clone()
            }
            other => other.to_string(),
        };
        RemoteError {
            code: self.code().to_string(),
            message: self.to_string(),
            detail,
        }
    }
}

/// Error payload carried in a bridge reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    pub detail: String,
}

impl From<RemoteError> for PluginError {
    fn from(remote: RemoteError) -> Self {
        match remote.code.as_str() {
            "E500" => Self::NotFound(remote.detail),
            "E501" => Self::ValidationFailed(remote.detail),
            "E504" => Self::PathViolation(remote.detail),
            _ => Self::Remote {
                code: remote.code,
                message: remote.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(PluginError::NotFound("x".into()).code(), "E500");
        assert_eq!(PluginError::PathViolation("/etc".into()).code(), "E504");
        let download: PluginError = downlodr_core::Error::InvalidUrl("ftp://x".into()).into();
        assert_eq!(download.code(), "E102");
    }

    #[test]
    fn test_remote_roundtrip_keeps_kind() {
        let err = PluginError::PathViolation("../../etc/passwd".into());
        let back: PluginError = err.to_remote().into();
        assert!(matches!(back, PluginError::PathViolation(ref p) if p == "../../etc/passwd"));

        let err = PluginError::WasmError("trap".into());
        let back: PluginError = err.to_remote().into();
        assert_eq!(back.code(), "E505");
        assert!(back.to_string().contains("trap"));
    }
}
