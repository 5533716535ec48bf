//! Persisted enabled/disabled state per plugin id

use crate::PluginResult;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Snapshot of the enabled map. Absent ids count as enabled.
pub type EnabledStates = BTreeMap<String, bool>;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginConfigFile {
    #[serde(default)]
    enabled_plugins: EnabledStates,
}

/// Owner of `plugin-config.json`. Every change is flushed before returning.
#[derive(Debug)]
pub struct EnabledStateStore {
    path: PathBuf,
    states: Mutex<EnabledStates>,
}

impl EnabledStateStore {
    /// Load the state file. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let states = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<PluginConfigFile>(&data) {
                Ok(file) => file.enabled_plugins,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt plugin config");
                    EnabledStates::new()
                }
            },
            Err(_) => EnabledStates::new(),
        };

        Self {
            path,
            states: Mutex::new(states),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> EnabledStates {
        self.states().clone()
    }

    pub fn is_enabled(&self, plugin_id: &str) -> bool {
        self.states().get(plugin_id).copied().unwrap_or(true)
    }

    pub fn set(&self, plugin_id: &str, enabled: bool) -> PluginResult<()> {
        let mut states = self.states();
        states.insert(plugin_id.to_string(), enabled);
        self.flush(&states)?;
        debug!(plugin_id, enabled, "Plugin enabled state saved");
        Ok(())
    }

    /// Record the default (enabled) for an id seen for the first time
    pub fn ensure_default(&self, plugin_id: &str) -> PluginResult<bool> {
        let mut states = self.states();
        if let Some(enabled) = states.get(plugin_id) {
            return Ok(*enabled);
        }
        states.insert(plugin_id.to_string(), true);
        self.flush(&states)?;
        Ok(true)
    }

    fn states(&self) -> MutexGuard<'_, EnabledStates> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Temp file in the same directory, fsync, then rename over the target
    fn flush(&self, states: &EnabledStates) -> PluginResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let file = PluginConfigFile {
            enabled_plugins: states.clone(),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(&file)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
