//! Guest-side plugin loader
//!
//! Fetches each enabled plugin's code over the bridge, evaluates it in a
//! sandbox and calls its `initialize` with a [`PluginApi`] scoped to the
//! plugin. Every plugin is loaded independently; one failing never stops
//! the others.

use crate::{
    PluginError, PluginResult,
    api::{GuestContext, PluginApi},
    bridge::HostEvent,
    store::{PluginCode, PluginLocks},
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{RwLock, broadcast::error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// What a successfully evaluated plugin exposes
#[async_trait]
pub trait PluginExports: Send + Sync {
    async fn initialize(&self, api: PluginApi) -> PluginResult<()>;

    async fn on_unload(&self) -> PluginResult<()> {
        Ok(())
    }
}

/// Turns plugin code into exports. `Ok(None)` means the code evaluated but
/// exposes no `initialize` entry point.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        plugin_id: &str,
        code: PluginCode,
    ) -> PluginResult<Option<Arc<dyn PluginExports>>>;
}

#[derive(Debug)]
pub enum LoadOutcome {
    Initialized,
    /// `initialize` failed or panicked
    InitializationFailed(String),
    /// No `initialize` export
    NonConforming,
    /// Code could not be fetched or evaluated
    Failed(PluginError),
}

impl LoadOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Initialized)
    }
}

pub struct PluginLoader {
    context: GuestContext,
    evaluator: Arc<dyn Evaluator>,
    loaded: RwLock<HashMap<String, Arc<dyn PluginExports>>>,
    locks: PluginLocks,
}

impl PluginLoader {
    pub fn new(context: GuestContext, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            context,
            evaluator,
            loaded: RwLock::new(HashMap::new()),
            locks: PluginLocks::default(),
        }
    }

    pub fn context(&self) -> &GuestContext {
        &self.context
    }

    /// Load one plugin, replacing it if it is already loaded
    pub async fn load(&self, plugin_id: &str) -> LoadOutcome {
        let _guard = self.locks.acquire(plugin_id).await;
        self.unload_locked(plugin_id).await;
        self.load_locked(plugin_id).await
    }

    /// Load a plugin unless it is already loaded. Returns `None` when it was.
    pub async fn load_if_absent(&self, plugin_id: &str) -> Option<LoadOutcome> {
        let _guard = self.locks.acquire(plugin_id).await;
        if self.is_loaded(plugin_id).await {
            return None;
        }
        Some(self.load_locked(plugin_id).await)
    }

    async fn load_locked(&self, plugin_id: &str) -> LoadOutcome {
        let code = match self.context.bridge.get_code(plugin_id).await {
            Ok(code) => code,
            Err(e) => {
                warn!(plugin_id, error = %e, "Failed to fetch plugin code");
                return LoadOutcome::Failed(e);
            }
        };

        let exports = match self.evaluator.evaluate(plugin_id, code).await {
            Ok(Some(exports)) => exports,
            Ok(None) => {
                warn!(plugin_id, "Plugin does not export initialize; skipping");
                return LoadOutcome::NonConforming;
            }
            Err(e) => {
                error!(plugin_id, error = %e, "Failed to evaluate plugin");
                return LoadOutcome::Failed(e);
            }
        };

        let api = PluginApi::new(plugin_id, &self.context);
        let initializing = exports.clone();
        let initialized = tokio::spawn(async move { initializing.initialize(api).await }).await;

        let reason = match initialized {
            Ok(Ok(())) => {
                self.loaded
                    .write()
                    .await
                    .insert(plugin_id.to_string(), exports);
                info!(plugin_id, "Plugin initialized");
                return LoadOutcome::Initialized;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("initialize panicked: {e}"),
        };

        error!(plugin_id, reason = %reason, "Plugin initialization failed");
        self.discard(plugin_id).await;
        LoadOutcome::InitializationFailed(reason)
    }

    /// Load every enabled plugin concurrently
    pub async fn load_all(&self) -> PluginResult<Vec<(String, LoadOutcome)>> {
        let enabled: Vec<String> = self
            .context
            .bridge
            .list_plugins()
            .await?
            .into_iter()
            .filter(|plugin| plugin.enabled)
            .map(|plugin| plugin.id)
            .collect();

        let outcomes = join_all(enabled.iter().map(|id| self.load(id))).await;
        let loaded = outcomes.iter().filter(|o| o.is_loaded()).count();
        info!(loaded, total = enabled.len(), "Plugins loaded");

        Ok(enabled.into_iter().zip(outcomes).collect())
    }

    /// Unload a plugin: `on_unload`, then drop its handlers and registrations
    pub async fn unload(&self, plugin_id: &str) -> bool {
        let _guard = self.locks.acquire(plugin_id).await;
        self.unload_locked(plugin_id).await
    }

    async fn unload_locked(&self, plugin_id: &str) -> bool {
        let Some(exports) = self.loaded.write().await.remove(plugin_id) else {
            return false;
        };

        if let Err(e) = exports.on_unload().await {
            warn!(plugin_id, error = %e, "Plugin on_unload failed");
        }
        self.discard(plugin_id).await;
        debug!(plugin_id, "Plugin unloaded");
        true
    }

    pub async fn unload_all(&self) {
        for plugin_id in self.loaded().await {
            self.unload(&plugin_id).await;
        }
    }

    pub async fn reload(&self) -> PluginResult<Vec<(String, LoadOutcome)>> {
        self.unload_all().await;
        self.load_all().await
    }

    pub async fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.read().await.contains_key(plugin_id)
    }

    pub async fn loaded(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn discard(&self, plugin_id: &str) {
        self.context.handlers.purge(plugin_id).await;
        if let Err(e) = self.context.bridge.clear_registrations(Some(plugin_id)).await {
            warn!(plugin_id, error = %e, "Failed to clear plugin registrations");
        }
    }

    /// Follow host events: load on enable, unload on uninstall, reload on
    /// reload. Disabling only hides items, so a disabled plugin stays loaded.
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let loader = self.clone();
        let mut events = self.context.bridge.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => loader.on_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Plugin loader missed host events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn on_event(&self, event: HostEvent) {
        match event {
            HostEvent::StateChanged {
                plugin_id,
                enabled: true,
            } => {
                self.load_if_absent(&plugin_id).await;
            }
            HostEvent::StateChanged { enabled: false, .. } => {}
            HostEvent::Uninstalled { plugin_id } => {
                self.unload(&plugin_id).await;
            }
            HostEvent::Reloaded => {
                if let Err(e) = self.reload().await {
                    error!(error = %e, "Plugin reload failed");
                }
            }
        }
    }
}
