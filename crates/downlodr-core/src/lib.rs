//! Downlodr Core Library
//!
//! This crate provides the pieces of Downlodr that the plugin subsystem and
//! the CLI share:
//! - Configuration (TOML file + environment overrides)
//! - Error types with codes and suggestions
//! - Download collaborator interfaces (queue snapshot, metadata engine)

pub mod config;
pub mod downloads;
pub mod error;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AppPaths, Config};
    pub use crate::downloads::{DownloadQueue, MetadataEngine};
    pub use crate::error::{Error, Result};
}
