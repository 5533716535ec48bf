//! Downlodr CLI - manage and run download plugins

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use downlodr_core::prelude::Config;
use downlodr_plugins::{
    PluginError, PluginSystem, manifest,
    registry::{ExtensionItem, ExtensionKind, ItemContext},
    store::{InstallOutcome, PluginMetadata},
    system::Collaborators,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Parser)]
#[command(name = "downlodr")]
#[command(author, version, about = "Plugin host for the Downlodr download manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage installed plugins
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Load every enabled plugin (unless plugins.auto_load is off) and show what they contribute
    Run {
        /// Which items to show
        #[arg(long, default_value = "menu")]
        kind: ItemKindArg,
        /// Only items shown in this context
        #[arg(long)]
        context: Option<ContextArg>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List installed plugins
    List,
    /// Install a plugin package directory
    Install { path: PathBuf },
    /// Remove an installed plugin
    Uninstall { id: String },
    /// Enable a plugin
    Enable { id: String },
    /// Disable a plugin
    Disable { id: String },
    /// Check a package directory without installing it
    Validate { path: PathBuf },
    /// Print where a plugin is installed
    Location { id: String },
    /// Open a plugin's folder in the file manager
    Open { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Show config file path
    Path,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ItemKindArg {
    Menu,
    Taskbar,
    Notification,
}

impl From<ItemKindArg> for ExtensionKind {
    fn from(kind: ItemKindArg) -> Self {
        match kind {
            ItemKindArg::Menu => ExtensionKind::MenuItem,
            ItemKindArg::Taskbar => ExtensionKind::TaskBarItem,
            ItemKindArg::Notification => ExtensionKind::Notification,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ContextArg {
    Main,
    Download,
    All,
}

impl From<ContextArg> for ItemContext {
    fn from(context: ContextArg) -> Self {
        match context {
            ContextArg::Main => ItemContext::Main,
            ContextArg::Download => ItemContext::Download,
            ContextArg::All => ItemContext::All,
        }
    }
}

struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn emit(&self, value: serde_json::Value) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    }

    fn say(&self, message: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", message.as_ref());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let directive = if cli.verbose { "downlodr=debug" } else { "downlodr=warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Plugins { action } => cmd_plugins(action, &out).await,
        Commands::Run { kind, context } => cmd_run(kind.into(), context.map(Into::into), &out).await,
        Commands::Config { action } => cmd_config(action, &out),
    }
}

async fn start_system() -> anyhow::Result<PluginSystem> {
    let config = Config::load()?;
    let paths = config.paths()?;
    debug!(app_data = %paths.app_data_dir().display(), "Starting plugin system");
    PluginSystem::start(&paths, &config, Collaborators::default())
        .await
        .map_err(plugin_error)
}

/// Attach the error code and suggestion to a plugin error
fn plugin_error(e: PluginError) -> anyhow::Error {
    match e.suggestion() {
        Some(hint) => anyhow!("[{}] {e}\n  hint: {hint}", e.code()),
        None => anyhow!("[{}] {e}", e.code()),
    }
}

async fn cmd_plugins(action: PluginAction, out: &Output) -> anyhow::Result<()> {
    if let PluginAction::Validate { path } = &action {
        return cmd_validate(path, out);
    }

    let system = start_system().await?;
    let client = system.client.clone();

    let result = match action {
        PluginAction::List => {
            let plugins = client.list_plugins().await.map_err(plugin_error)?;
            print_plugins(&plugins, out)
        }
        PluginAction::Install { path } => {
            let path = path
                .canonicalize()
                .with_context(|| format!("Package not found: {}", path.display()))?;
            let outcome = client.install(&path).await.map_err(plugin_error)?;
            print_install(&outcome, out)?;
            if outcome.is_success() {
                Ok(())
            } else {
                Err(anyhow!("Install rejected"))
            }
        }
        PluginAction::Uninstall { id } => {
            let removed = client.uninstall(&id).await.map_err(plugin_error)?;
            if !removed {
                return Err(anyhow!("Plugin '{id}' is not installed"));
            }
            if out.json() {
                out.emit(json!({"id": id, "uninstalled": true}))
            } else {
                out.say(format!("Uninstalled {id}"));
                Ok(())
            }
        }
        PluginAction::Enable { id } => set_enabled(&system, &id, true, out).await,
        PluginAction::Disable { id } => set_enabled(&system, &id, false, out).await,
        PluginAction::Location { id } => {
            let location = client
                .location(&id)
                .await
                .map_err(plugin_error)?
                .ok_or_else(|| anyhow!("Plugin '{id}' is not installed"))?;
            if out.json() {
                out.emit(json!({"id": id, "location": location}))
            } else {
                println!("{}", location.display());
                Ok(())
            }
        }
        PluginAction::Open { id } => {
            if !client.open_folder(&id).await.map_err(plugin_error)? {
                return Err(anyhow!("Plugin '{id}' is not installed"));
            }
            out.say(format!("Opened folder of {id}"));
            Ok(())
        }
        PluginAction::Validate { .. } => Ok(()),
    };

    system.shutdown().await;
    result
}

fn cmd_validate(path: &Path, out: &Output) -> anyhow::Result<()> {
    match manifest::inspect(path) {
        Ok(manifest) => {
            if out.json() {
                out.emit(json!({"valid": true, "manifest": manifest}))
            } else {
                out.say(format!(
                    "Valid plugin package: {} {} ({})",
                    manifest.name, manifest.version, manifest.id
                ));
                Ok(())
            }
        }
        Err(e) => {
            if out.json() {
                out.emit(json!({"valid": false, "error": e.to_remote()}))?;
            }
            Err(plugin_error(e))
        }
    }
}

async fn set_enabled(
    system: &PluginSystem,
    id: &str,
    enabled: bool,
    out: &Output,
) -> anyhow::Result<()> {
    system
        .client
        .set_enabled(id, enabled)
        .await
        .map_err(plugin_error)?;
    if out.json() {
        out.emit(json!({"id": id, "enabled": enabled}))
    } else {
        out.say(format!(
            "{} {id}",
            if enabled { "Enabled" } else { "Disabled" }
        ));
        Ok(())
    }
}

fn print_plugins(plugins: &[PluginMetadata], out: &Output) -> anyhow::Result<()> {
    if out.json() {
        return out.emit(serde_json::to_value(plugins)?);
    }
    if plugins.is_empty() {
        out.say("No plugins installed.");
        return Ok(());
    }
    for plugin in plugins {
        println!(
            "{:<24} {:<10} {:<8} {}",
            plugin.id,
            plugin.version,
            if plugin.enabled { "enabled" } else { "disabled" },
            plugin.name
        );
    }
    Ok(())
}

fn print_install(outcome: &InstallOutcome, out: &Output) -> anyhow::Result<()> {
    if out.json() {
        return out.emit(serde_json::to_value(outcome)?);
    }
    match outcome {
        InstallOutcome::Installed {
            id,
            version,
            replaced: Some(previous),
        } => out.say(format!("Installed {id} {version} (replaced {previous})")),
        InstallOutcome::Installed { id, version, .. } => {
            out.say(format!("Installed {id} {version}"))
        }
        InstallOutcome::AlreadyInstalled { id, version } => {
            out.say(format!("{id} {version} is already installed"))
        }
        InstallOutcome::Rejected { reason } => eprintln!("Rejected: {reason}"),
    }
    Ok(())
}

async fn cmd_run(
    kind: ExtensionKind,
    context: Option<ItemContext>,
    out: &Output,
) -> anyhow::Result<()> {
    let system = start_system().await?;
    let auto_loaded = system.auto_load().await.map_err(plugin_error)?;
    let auto_load = auto_loaded.is_some();
    let outcomes = auto_loaded.unwrap_or_default();
    let items = system
        .client
        .items(kind, context)
        .await
        .map_err(plugin_error)?;

    if out.json() {
        let loaded: Vec<_> = outcomes
            .iter()
            .map(|(id, outcome)| json!({"id": id, "outcome": format!("{outcome:?}")}))
            .collect();
        out.emit(json!({"autoLoad": auto_load, "plugins": loaded, "items": items}))?;
    } else {
        if !auto_load {
            out.say("Plugin loading is off (plugins.auto_load = false); no plugins loaded.");
        }
        for (id, outcome) in &outcomes {
            out.say(format!("{id}: {outcome:?}"));
        }
        print_items(&items, out);
    }

    system.shutdown().await;
    Ok(())
}

fn print_items(items: &[ExtensionItem], out: &Output) {
    if items.is_empty() {
        out.say("No items contributed.");
        return;
    }
    for item in items {
        println!("{:<40} {:<20} {}", item.id, item.plugin_id, item.label);
    }
}

fn cmd_config(action: ConfigAction, out: &Output) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            if out.json() {
                out.emit(json!({"key": key, "value": value}))?;
            } else {
                println!("{}", value);
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            out.say(format!("Set {} = {}", key, value));
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            if out.json() {
                let map: serde_json::Map<_, _> = items
                    .into_iter()
                    .map(|(key, value)| (key, json!(value)))
                    .collect();
                out.emit(serde_json::Value::Object(map))?;
            } else {
                for (key, value) in items {
                    println!("{} = {}", key, value);
                }
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_filters() {
        let cli = Cli::try_parse_from([
            "downlodr", "run", "--kind", "taskbar", "--context", "main", "--format", "json",
        ])
        .unwrap();
        assert!(cli.format == OutputFormat::Json);
        match cli.command {
            Commands::Run { kind, context } => {
                assert_eq!(ExtensionKind::from(kind), ExtensionKind::TaskBarItem);
                assert_eq!(context.map(ItemContext::from), Some(ItemContext::Main));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_plugin_error_carries_code_and_hint() {
        let message = plugin_error(PluginError::PathViolation("../x".into())).to_string();
        assert!(message.starts_with("[E504]"));
    }
}
