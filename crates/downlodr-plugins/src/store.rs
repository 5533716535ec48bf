//! Managed plugin install root and per-plugin data directories
//!
//! The store is the only component that writes under the plugins root.
//! Installs are staged next to their destination and swapped in with a
//! rename, so a crash leaves either the old or the new package in place.

use crate::{
    PluginError, PluginResult,
    confine::confine,
    enabled::{EnabledStateStore, EnabledStates},
    manifest::{self, PluginManifest},
};
use downlodr_core::config::AppPaths;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InstallOutcome {
    Installed {
        id: String,
        version: String,
        replaced: Option<String>,
    },
    AlreadyInstalled {
        id: String,
        version: String,
    },
    Rejected {
        reason: String,
    },
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// What the store reports for an installed plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub enabled: bool,
    pub location: PathBuf,
}

/// Entry module of an installed plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCode {
    pub manifest: PluginManifest,
    pub code: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteFileOptions {
    pub plugin_id: String,
    pub file_name: String,
    pub content: String,
    pub file_type: Option<String>,
    pub directory: Option<String>,
    pub overwrite: bool,
    pub custom_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WriteFileResult {
    fn written(path: PathBuf) -> Self {
        Self {
            success: true,
            path: Some(path),
            error: None,
        }
    }

    fn refused(path: PathBuf, reason: &str) -> Self {
        Self {
            success: false,
            path: Some(path),
            error: Some(reason.to_string()),
        }
    }
}

/// One async lock per plugin id; install/uninstall and loading each hold
/// one for the whole operation
#[derive(Debug, Default)]
pub struct PluginLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PluginLocks {
    pub async fn acquire(&self, plugin_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(plugin_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug)]
pub struct PluginStore {
    plugins_dir: PathBuf,
    data_dir: PathBuf,
    enabled: EnabledStateStore,
    locks: PluginLocks,
}

impl PluginStore {
    /// Open the store, creating the plugins and data roots if needed
    pub fn open(paths: &AppPaths) -> PluginResult<Self> {
        let plugins_dir = paths.plugins_dir();
        let data_dir = paths.plugin_data_dir();
        fs::create_dir_all(&plugins_dir)?;
        fs::create_dir_all(&data_dir)?;

        let store = Self {
            enabled: EnabledStateStore::open(paths.plugin_config_path()),
            plugins_dir,
            data_dir,
            locks: PluginLocks::default(),
        };
        store.sweep_leftovers();
        Ok(store)
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Install a candidate package directory under the managed root
    pub async fn install(&self, candidate: &Path) -> PluginResult<InstallOutcome> {
        let manifest = match manifest::inspect(candidate) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %candidate.display(), error = %e, "Rejected plugin package");
                return Ok(InstallOutcome::Rejected {
                    reason: e.to_string(),
                });
            }
        };

        let _guard = self.locks.acquire(&manifest.id).await;
        let dest = self.managed_dir(&manifest.id)?;

        let previous = dest
            .exists()
            .then(|| manifest::read_manifest(&dest).ok().map(|m| m.version))
            .flatten();
        if previous.as_deref() == Some(manifest.version.as_str()) {
            debug!(plugin_id = %manifest.id, version = %manifest.version, "Plugin already installed");
            return Ok(InstallOutcome::AlreadyInstalled {
                id: manifest.id,
                version: manifest.version,
            });
        }

        let plugins_dir = self.plugins_dir.clone();
        let source = candidate.to_path_buf();
        tokio::task::spawn_blocking(move || stage_and_swap(&plugins_dir, &source, &dest))
            .await
            .map_err(|e| PluginError::IoError(std::io::Error::other(e)))??;

        self.enabled.ensure_default(&manifest.id)?;
        info!(
            plugin_id = %manifest.id,
            version = %manifest.version,
            replaced = ?previous,
            "Plugin installed"
        );

        Ok(InstallOutcome::Installed {
            id: manifest.id,
            version: manifest.version,
            replaced: previous,
        })
    }

    /// Remove an installed plugin. Returns false when nothing was installed.
    pub async fn uninstall(&self, plugin_id: &str) -> PluginResult<bool> {
        let _guard = self.locks.acquire(plugin_id).await;
        let dir = self.managed_dir(plugin_id)?;
        if !dir.is_dir() {
            return Ok(false);
        }

        tokio::task::spawn_blocking(move || fs::remove_dir_all(dir))
            .await
            .map_err(|e| PluginError::IoError(std::io::Error::other(e)))??;

        info!(plugin_id, "Plugin uninstalled");
        Ok(true)
    }

    /// Every valid installed plugin, sorted by name
    pub fn list(&self) -> PluginResult<Vec<PluginMetadata>> {
        let mut plugins = Vec::new();

        for entry in fs::read_dir(&self.plugins_dir)? {
            let entry = entry?;
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            if dir_name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }

            let path = entry.path();
            let manifest = match manifest::inspect(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid plugin directory");
                    continue;
                }
            };
            if manifest.id != dir_name {
                warn!(
                    path = %path.display(),
                    plugin_id = %manifest.id,
                    "Skipping plugin whose id does not match its directory"
                );
                continue;
            }

            let enabled = self.enabled.ensure_default(&manifest.id)?;
            plugins.push(PluginMetadata {
                id: manifest.id,
                name: manifest.name,
                version: manifest.version,
                description: manifest.description,
                author: manifest.author,
                icon: manifest.icon,
                enabled,
                location: path,
            });
        }

        plugins.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(plugins)
    }

    pub fn set_enabled(&self, plugin_id: &str, enabled: bool) -> PluginResult<()> {
        if !manifest::is_valid_id(plugin_id) {
            return Err(PluginError::ValidationFailed(format!(
                "Invalid plugin id '{plugin_id}'"
            )));
        }
        self.enabled.set(plugin_id, enabled)
    }

    pub fn enabled_states(&self) -> EnabledStates {
        self.enabled.snapshot()
    }

    pub fn is_enabled(&self, plugin_id: &str) -> bool {
        self.enabled.is_enabled(plugin_id)
    }

    /// Install directory of a plugin, if it is installed
    pub fn get_location(&self, plugin_id: &str) -> Option<PathBuf> {
        self.managed_dir(plugin_id).ok().filter(|dir| dir.is_dir())
    }

    /// Read the entry module of an installed plugin
    pub fn get_code(&self, plugin_id: &str) -> PluginResult<PluginCode> {
        let dir = self
            .get_location(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        let manifest = manifest::inspect(&dir)?;
        let entry = manifest::resolve_entry(&dir, &manifest)?;
        let code = fs::read(entry)?;
        Ok(PluginCode { manifest, code })
    }

    /// Private data directory of a plugin, created on demand
    pub fn plugin_data_dir(&self, plugin_id: &str) -> PluginResult<PathBuf> {
        if !manifest::is_valid_id(plugin_id) {
            return Err(PluginError::PathViolation(plugin_id.to_string()));
        }
        let dir = confine(&self.data_dir, Path::new(plugin_id))?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Write a plugin-supplied file into that plugin's data directory
    pub fn write_file(&self, options: &WriteFileOptions) -> PluginResult<WriteFileResult> {
        let root = self.plugin_data_dir(&options.plugin_id)?;

        let target = match options.custom_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(custom) => confine(&root, Path::new(custom))?,
            None => {
                let mut file_name = sanitize_segment(&options.file_name);
                if file_name.is_empty() {
                    return Err(PluginError::ValidationFailed(
                        "fileName must not be empty".to_string(),
                    ));
                }
                if let Some(file_type) = options.file_type.as_deref().map(sanitize_segment) {
                    let extension = file_type.trim_start_matches('.');
                    if !extension.is_empty() && !file_name.ends_with(&format!(".{extension}")) {
                        file_name = format!("{file_name}.{extension}");
                    }
                }

                let mut relative = PathBuf::new();
                if let Some(directory) = options.directory.as_deref().map(sanitize_segment) {
                    if !directory.is_empty() {
                        relative.push(directory);
                    }
                }
                relative.push(file_name);
                confine(&root, &relative)?
            }
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if options.overwrite {
            fs::write(&target, &options.content)?;
        } else {
            let created = OpenOptions::new().write(true).create_new(true).open(&target);
            match created {
                Ok(mut file) => file.write_all(options.content.as_bytes())?,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Ok(WriteFileResult::refused(
                        target,
                        "File already exists and overwrite is not enabled",
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(plugin_id = %options.plugin_id, path = %target.display(), "Plugin file written");
        Ok(WriteFileResult::written(target))
    }

    /// Read a file from a plugin's data directory
    pub fn read_file(&self, plugin_id: &str, path: &str) -> PluginResult<String> {
        let root = self.plugin_data_dir(plugin_id)?;
        let target = confine(&root, Path::new(path))?;
        Ok(fs::read_to_string(target)?)
    }

    /// Write content to a path a human picked in the save dialog.
    ///
    /// The path never comes from plugin code, so it is not confined to the
    /// data directory; it may not point into the managed plugins root.
    pub fn save_user_file(
        &self,
        plugin_id: &str,
        path: &Path,
        content: &str,
    ) -> PluginResult<WriteFileResult> {
        if !path.is_absolute() {
            return Err(PluginError::ValidationFailed(
                "Save dialog paths must be absolute".to_string(),
            ));
        }
        if confine(&self.plugins_dir, path).is_ok() {
            return Err(PluginError::PathViolation(path.display().to_string()));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        info!(plugin_id, path = %path.display(), "Saved file chosen in save dialog");
        Ok(WriteFileResult::written(path.to_path_buf()))
    }

    fn managed_dir(&self, plugin_id: &str) -> PluginResult<PathBuf> {
        if !manifest::is_valid_id(plugin_id) {
            return Err(PluginError::PathViolation(plugin_id.to_string()));
        }
        Ok(self.plugins_dir.join(plugin_id))
    }

    /// Remove staging and trash directories left by an interrupted install
    fn sweep_leftovers(&self) {
        let Ok(entries) = fs::read_dir(&self.plugins_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "Failed to remove leftover");
                }
            }
        }
    }
}

/// `..` removed, path separators replaced by `-`
pub fn sanitize_segment(segment: &str) -> String {
    segment
        .replace("..", "")
        .replace(['/', '\\'], "-")
        .trim()
        .to_string()
}

fn stage_and_swap(plugins_dir: &Path, source: &Path, dest: &Path) -> PluginResult<()> {
    let staging = plugins_dir.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
    if let Err(e) = copy_tree(source, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    let trash = if dest.exists() {
        let trash = plugins_dir.join(format!("{TRASH_PREFIX}{}", Uuid::new_v4()));
        if let Err(e) = fs::rename(dest, &trash) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        Some(trash)
    } else {
        None
    };

    if let Err(e) = fs::rename(&staging, dest) {
        if let Some(trash) = &trash {
            let _ = fs::rename(trash, dest);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(e.into());
    }

    if let Some(trash) = trash {
        if let Err(e) = fs::remove_dir_all(&trash) {
            warn!(path = %trash.display(), error = %e, "Failed to remove replaced plugin");
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> PluginResult<()> {
    fs::create_dir_all(target)?;

    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| PluginError::IoError(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| PluginError::ValidationFailed(e.to_string()))?;
        let dest = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            warn!(path = %entry.path().display(), "Skipping symlink in plugin package");
        } else if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)?;
        }
    }

    Ok(())
}
