//! Wiring of the host and guest halves

use crate::{
    PluginResult,
    api::{GuestContext, LogNotifier, Notifier},
    bridge::{BridgeClient, PluginHost, ShellOpener, SystemShell, connect_guest},
    handlers::HandlerTable,
    loader::{Evaluator, LoadOutcome, PluginLoader},
    registry::ExtensionRegistry,
    sandbox::{SandboxLimits, WasmEvaluator},
    store::PluginStore,
    ui::UiManagers,
};
use downlodr_core::{
    downloads::{InMemoryDownloadQueue, UnavailableMetadataEngine},
    prelude::{AppPaths, Config, DownloadQueue, MetadataEngine},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Services the plugin system borrows from the rest of the application
pub struct Collaborators {
    pub downloads: Arc<dyn DownloadQueue>,
    pub metadata: Arc<dyn MetadataEngine>,
    pub notifier: Arc<dyn Notifier>,
    pub opener: Arc<dyn ShellOpener>,
    /// Overrides the wasmtime evaluator
    pub evaluator: Option<Arc<dyn Evaluator>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            downloads: Arc::new(InMemoryDownloadQueue::new()),
            metadata: Arc::new(UnavailableMetadataEngine),
            notifier: Arc::new(LogNotifier),
            opener: Arc::new(SystemShell),
            evaluator: None,
        }
    }
}

/// A running plugin system: host, bridge, guest-side loader and UI state
pub struct PluginSystem {
    pub client: BridgeClient,
    pub loader: Arc<PluginLoader>,
    pub ui: Arc<UiManagers>,
    pub registry: Arc<ExtensionRegistry>,
    pub handlers: HandlerTable,
    auto_load: bool,
    listener: JoinHandle<()>,
}

impl PluginSystem {
    /// Start the host, connect the guest side and follow host events.
    /// Plugins are not loaded until [`PluginSystem::auto_load`] or
    /// [`PluginSystem::load_all`].
    pub async fn start(
        paths: &AppPaths,
        config: &Config,
        collaborators: Collaborators,
    ) -> PluginResult<Self> {
        let store = Arc::new(PluginStore::open(paths)?);
        let registry = Arc::new(ExtensionRegistry::new());
        let handlers = HandlerTable::new();
        registry
            .attach_invoker(Arc::new(connect_guest(handlers.clone())))
            .await;

        let client = PluginHost::new(store, registry.clone())
            .with_opener(collaborators.opener)
            .spawn()
            .await;

        let ui = Arc::new(UiManagers::new());
        let context = GuestContext {
            bridge: client.clone(),
            handlers: handlers.clone(),
            ui: ui.clone(),
            downloads: collaborators.downloads,
            metadata: collaborators.metadata,
            notifier: collaborators.notifier,
        };

        let evaluator = collaborators
            .evaluator
            .unwrap_or_else(|| Arc::new(WasmEvaluator::new(SandboxLimits::from(&config.sandbox))));
        let loader = Arc::new(PluginLoader::new(context, evaluator));
        let listener = loader.spawn_event_listener();

        info!(plugins_dir = %paths.plugins_dir().display(), "Plugin system started");

        Ok(Self {
            client,
            loader,
            ui,
            registry,
            handlers,
            auto_load: config.plugins.auto_load,
            listener,
        })
    }

    pub async fn load_all(&self) -> PluginResult<Vec<(String, LoadOutcome)>> {
        self.loader.load_all().await
    }

    /// Startup load, honoring `plugins.auto_load`. `None` when it is off.
    pub async fn auto_load(&self) -> PluginResult<Option<Vec<(String, LoadOutcome)>>> {
        if !self.auto_load {
            info!("Automatic plugin loading is disabled");
            return Ok(None);
        }
        self.load_all().await.map(Some)
    }

    /// Unload every plugin and stop following host events
    pub async fn shutdown(self) {
        self.listener.abort();
        self.ui.close_all();
        self.loader.unload_all().await;
    }
}
