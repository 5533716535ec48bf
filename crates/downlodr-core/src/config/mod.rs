//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Downlodr configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub sandbox: SandboxConfig,
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of all application data. `DOWNLODR_APP_DATA` takes precedence.
    pub app_data_dir: Option<PathBuf>,
}

/// Resource limits applied to every plugin module
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub fuel_limit: u64,
    pub memory_limit_bytes: usize,
    pub execution_timeout_ms: u64,
    pub max_module_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Load enabled plugins when the host starts
    pub auto_load: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 50_000_000,
            memory_limit_bytes: 16 * 1024 * 1024,
            execution_timeout_ms: 5_000,
            max_module_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self { auto_load: true }
    }
}

/// Resolved on-disk layout under the application data root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    app_data_dir: PathBuf,
}

impl AppPaths {
    pub fn new(app_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_data_dir: app_data_dir.into(),
        }
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    /// `<appData>/plugins` - managed install root, one directory per plugin id
    pub fn plugins_dir(&self) -> PathBuf {
        self.app_data_dir.join("plugins")
    }

    /// `<appData>/plugin-data` - per-plugin private write sandbox
    pub fn plugin_data_dir(&self) -> PathBuf {
        self.app_data_dir.join("plugin-data")
    }

    /// `<appData>/plugin-config.json` - persisted enabled-state map
    pub fn plugin_config_path(&self) -> PathBuf {
        self.app_data_dir.join("plugin-config.json")
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("DOWNLODR_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("downlodr")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or use defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            // Return default config without creating file
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sandbox.fuel_limit == 0 {
            return Err(anyhow!("sandbox.fuel_limit must be greater than zero"));
        }
        if self.sandbox.memory_limit_bytes == 0 {
            return Err(anyhow!("sandbox.memory_limit_bytes must be greater than zero"));
        }
        if self.sandbox.execution_timeout_ms == 0 {
            return Err(anyhow!("sandbox.execution_timeout_ms must be greater than zero"));
        }
        if self.sandbox.max_module_bytes == 0 {
            return Err(anyhow!("sandbox.max_module_bytes must be greater than zero"));
        }
        Ok(())
    }

    /// Resolve the application data layout
    pub fn paths(&self) -> anyhow::Result<AppPaths> {
        if let Ok(dir) = env::var("DOWNLODR_APP_DATA") {
            return Ok(AppPaths::new(dir));
        }
        if let Some(dir) = &self.paths.app_data_dir {
            return Ok(AppPaths::new(dir.clone()));
        }
        let dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine application data directory"))?
            .join("downlodr");
        Ok(AppPaths::new(dir))
    }

    /// Every settable key
    pub const KEYS: [&'static str; 6] = [
        "paths.app_data_dir",
        "sandbox.fuel_limit",
        "sandbox.memory_limit_bytes",
        "sandbox.execution_timeout_ms",
        "sandbox.max_module_bytes",
        "plugins.auto_load",
    ];

    /// All key/value pairs
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        Self::KEYS
            .iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "paths.app_data_dir" => Ok(self
                .paths
                .app_data_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(default)".to_string())),
            "sandbox.fuel_limit" => Ok(self.sandbox.fuel_limit.to_string()),
            "sandbox.memory_limit_bytes" => Ok(self.sandbox.memory_limit_bytes.to_string()),
            "sandbox.execution_timeout_ms" => Ok(self.sandbox.execution_timeout_ms.to_string()),
            "sandbox.max_module_bytes" => Ok(self.sandbox.max_module_bytes.to_string()),
            "plugins.auto_load" => Ok(self.plugins.auto_load.to_string()),
            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `downlodr config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "paths.app_data_dir" => {
                self.paths.app_data_dir = Some(PathBuf::from(value));
            }
            "sandbox.fuel_limit" => {
                self.sandbox.fuel_limit = value
                    .parse()
                    .with_context(|| format!("Invalid fuel_limit value: {}", value))?;
            }
            "sandbox.memory_limit_bytes" => {
                self.sandbox.memory_limit_bytes = value
                    .parse()
                    .with_context(|| format!("Invalid memory_limit_bytes value: {}", value))?;
            }
            "sandbox.execution_timeout_ms" => {
                self.sandbox.execution_timeout_ms = value
                    .parse()
                    .with_context(|| format!("Invalid execution_timeout_ms value: {}", value))?;
            }
            "sandbox.max_module_bytes" => {
                self.sandbox.max_module_bytes = value
                    .parse()
                    .with_context(|| format!("Invalid max_module_bytes value: {}", value))?;
            }
            "plugins.auto_load" => {
                self.plugins.auto_load = value
                    .parse()
                    .with_context(|| format!("Invalid auto_load value: {}", value))?;
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `downlodr config list` to see available keys.",
                    key
                ));
            }
        }
        self.validate()
    }
}
