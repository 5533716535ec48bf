//! Plugin package validation
//!
//! A plugin package is a directory holding `manifest.json` and the module
//! file named by `main` (default `index.wasm`).

use crate::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DEFAULT_ENTRY: &str = "index.wasm";

const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// Plugin manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl PluginManifest {
    /// Entry file relative to the package directory
    pub fn entry(&self) -> &str {
        self.main
            .as_deref()
            .map(str::trim)
            .filter(|main| !main.is_empty())
            .unwrap_or(DEFAULT_ENTRY)
    }

    /// Parsed version, when the manifest uses semver
    pub fn semver(&self) -> Option<semver::Version> {
        semver::Version::parse(self.version.trim()).ok()
    }
}

/// True if `path` is a plugin package that may be installed and loaded
pub fn validate(path: &Path) -> bool {
    match inspect(path) {
        Ok(_) => true,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Plugin package rejected");
            false
        }
    }
}

/// Validate a package and return its manifest, or the reason it is invalid
pub fn inspect(path: &Path) -> PluginResult<PluginManifest> {
    let manifest = read_manifest(path)?;
    validate_manifest(&manifest)?;
    resolve_entry(path, &manifest)?;
    Ok(manifest)
}

/// Read and parse `manifest.json` from a package directory
pub fn read_manifest(dir: &Path) -> PluginResult<PluginManifest> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let metadata = fs::symlink_metadata(&manifest_path).map_err(|_| {
        PluginError::ValidationFailed(format!("{MANIFEST_FILE} not found in {}", dir.display()))
    })?;

    if !metadata.is_file() {
        return Err(PluginError::ValidationFailed(format!(
            "{MANIFEST_FILE} must be a regular file"
        )));
    }
    if metadata.len() > MAX_MANIFEST_BYTES {
        return Err(PluginError::ValidationFailed(
            "Manifest file too large".to_string(),
        ));
    }

    let data = fs::read_to_string(&manifest_path)?;
    serde_json::from_str(&data)
        .map_err(|e| PluginError::ValidationFailed(format!("Invalid manifest JSON: {e}")))
}

/// Canonical path of the entry file, guaranteed to lie inside the package
pub fn resolve_entry(dir: &Path, manifest: &PluginManifest) -> PluginResult<PathBuf> {
    let root = dir.canonicalize()?;
    let entry = dir.join(manifest.entry());

    let metadata = fs::symlink_metadata(&entry).map_err(|_| {
        PluginError::ValidationFailed(format!("Entry file '{}' not found", manifest.entry()))
    })?;
    if metadata.file_type().is_symlink() {
        return Err(PluginError::ValidationFailed(
            "Entry file must not be a symlink".to_string(),
        ));
    }
    if !metadata.is_file() {
        return Err(PluginError::ValidationFailed(format!(
            "Entry '{}' is not a regular file",
            manifest.entry()
        )));
    }

    let canonical = entry.canonicalize()?;
    if !canonical.starts_with(&root) {
        return Err(PluginError::ValidationFailed(format!(
            "Entry '{}' points outside the plugin package",
            manifest.entry()
        )));
    }

    Ok(canonical)
}

/// Plugin ids name directories and prefix handler ids, so they are kept to
/// a conservative character set.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn validate_manifest(manifest: &PluginManifest) -> PluginResult<()> {
    if manifest.id.trim().is_empty()
        || manifest.name.trim().is_empty()
        || manifest.version.trim().is_empty()
    {
        return Err(PluginError::ValidationFailed(
            "Manifest fields id, name and version must not be empty".to_string(),
        ));
    }

    if !is_valid_id(&manifest.id) {
        return Err(PluginError::ValidationFailed(format!(
            "Invalid plugin id '{}'",
            manifest.id
        )));
    }

    Ok(())
}
