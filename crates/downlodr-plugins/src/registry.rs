//! Host-side registry of items contributed by plugins
//!
//! Items are pure data. The callable behind an item lives on the guest
//! side and is referenced by `handler_id`; executing an item forwards the
//! id to the guest through a [`HandlerInvoker`].

use crate::{PluginError, PluginResult, enabled::EnabledStates};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtensionKind {
    MenuItem,
    TaskBarItem,
    Notification,
}

impl ExtensionKind {
    pub const ALL: [ExtensionKind; 3] = [Self::MenuItem, Self::TaskBarItem, Self::Notification];

    /// Segment used in generated item and handler ids
    pub fn id_segment(self) -> &'static str {
        match self {
            Self::MenuItem => "menu",
            Self::TaskBarItem => "taskbar",
            Self::Notification => "notification",
        }
    }
}

/// Where an item is shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemContext {
    Main,
    Download,
    #[default]
    All,
}

/// A contributed menu, task-bar or notification item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionItem {
    /// Generated on registration when empty
    #[serde(default)]
    pub id: String,
    pub plugin_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ItemContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<String>,
}

impl ExtensionItem {
    fn dedup_key(&self) -> (String, String) {
        (
            self.plugin_id.trim().to_string(),
            self.label.trim().to_string(),
        )
    }

    fn matches_context(&self, query: Option<ItemContext>) -> bool {
        match (query, self.context) {
            (None, _) => true,
            (Some(_), None | Some(ItemContext::All)) => true,
            (Some(query), Some(context)) => query == context,
        }
    }
}

/// Entry contributed to a named extension point such as `formats.handlers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionEntry {
    #[serde(default)]
    pub id: String,
    pub plugin_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionOutcome {
    Executed,
    /// The item referenced a handler the guest no longer has
    StaleHandler,
    UnknownItem,
    /// The owning plugin is disabled
    Disabled,
}

/// Reaches the guest-side handler table
#[async_trait]
pub trait HandlerInvoker: Send + Sync {
    async fn invoke(&self, handler_id: &str, context: Option<Value>) -> PluginResult<ActionOutcome>;
}

/// Scope an id chosen by a plugin to that plugin: `<pluginId>:<id>`.
/// Ids already carrying the prefix are returned unchanged.
pub fn qualify_id(plugin_id: &str, id: &str) -> String {
    let id = id.trim();
    match id.strip_prefix(plugin_id) {
        Some(rest) if rest.starts_with(':') => id.to_string(),
        _ => format!("{plugin_id}:{id}"),
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    items: HashMap<ExtensionKind, Vec<ExtensionItem>>,
    extensions: HashMap<String, Vec<ExtensionEntry>>,
    enabled: EnabledStates,
}

impl RegistryState {
    fn is_enabled(&self, plugin_id: &str) -> bool {
        self.enabled.get(plugin_id) != Some(&false)
    }
}

#[derive(Default)]
pub struct ExtensionRegistry {
    state: RwLock<RegistryState>,
    invoker: RwLock<Option<Arc<dyn HandlerInvoker>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the registry to the guest that owns the handlers
    pub async fn attach_invoker(&self, invoker: Arc<dyn HandlerInvoker>) {
        *self.invoker.write().await = Some(invoker);
    }

    /// Register an item, replacing the same plugin's item with the same id
    /// or the same label. Returns the item id, always prefixed with the
    /// plugin id.
    pub async fn register(&self, kind: ExtensionKind, mut item: ExtensionItem) -> PluginResult<String> {
        if item.plugin_id.trim().is_empty() || item.label.trim().is_empty() {
            return Err(PluginError::ValidationFailed(
                "Items need a pluginId and a label".to_string(),
            ));
        }
        if let Some(handler_id) = &item.handler_id {
            if !handler_id.starts_with(&format!("{}:", item.plugin_id)) {
                return Err(PluginError::ValidationFailed(format!(
                    "Handler '{handler_id}' does not belong to plugin '{}'",
                    item.plugin_id
                )));
            }
        }
        item.id = if item.id.trim().is_empty() {
            format!("{}:{}:{}", item.plugin_id, kind.id_segment(), Uuid::new_v4())
        } else {
            qualify_id(&item.plugin_id, &item.id)
        };

        let id = item.id.clone();
        let key = item.dedup_key();
        let mut state = self.state.write().await;
        let items = state.items.entry(kind).or_default();
        items.retain(|existing| {
            existing.plugin_id != item.plugin_id || (existing.id != id && existing.dedup_key() != key)
        });
        items.push(item);

        debug!(kind = ?kind, id = %id, "Registered extension item");
        Ok(id)
    }

    pub async fn unregister(&self, kind: ExtensionKind, id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(items) = state.items.get_mut(&kind) else {
            return false;
        };
        let before = items.len();
        items.retain(|item| item.id != id);
        before != items.len()
    }

    /// Items of one kind visible in `context`, from enabled plugins only,
    /// sorted by `order` (unordered items last, then registration order)
    pub async fn list(&self, kind: ExtensionKind, context: Option<ItemContext>) -> Vec<ExtensionItem> {
        let state = self.state.read().await;
        let Some(items) = state.items.get(&kind) else {
            return Vec::new();
        };

        let mut visible: Vec<ExtensionItem> = Vec::new();
        for item in items
            .iter()
            .filter(|item| item.matches_context(context))
            .filter(|item| state.is_enabled(&item.plugin_id))
        {
            let key = item.dedup_key();
            visible.retain(|seen| seen.dedup_key() != key);
            visible.push(item.clone());
        }

        visible.sort_by_key(|item| (item.order.is_none(), item.order.unwrap_or_default()));
        visible
    }

    /// Look up an item and run its handler on the guest side
    pub async fn execute_action(
        &self,
        kind: ExtensionKind,
        id: &str,
        context: Option<Value>,
    ) -> PluginResult<ActionOutcome> {
        let handler_id = {
            let state = self.state.read().await;
            let Some(item) = state
                .items
                .get(&kind)
                .and_then(|items| items.iter().find(|item| item.id == id))
            else {
                warn!(kind = ?kind, id, "Action requested for unknown item");
                return Ok(ActionOutcome::UnknownItem);
            };
            if !state.is_enabled(&item.plugin_id) {
                return Ok(ActionOutcome::Disabled);
            }
            match &item.handler_id {
                Some(handler_id) => handler_id.clone(),
                None => return Ok(ActionOutcome::StaleHandler),
            }
        };

        let invoker = self.invoker.read().await.clone();
        let Some(invoker) = invoker else {
            warn!(handler_id = %handler_id, "No guest attached to run handler");
            return Ok(ActionOutcome::StaleHandler);
        };

        let outcome = invoker.invoke(&handler_id, context).await?;
        if outcome == ActionOutcome::StaleHandler {
            warn!(handler_id = %handler_id, "Item references a handler that no longer exists");
        }
        Ok(outcome)
    }

    pub async fn update_enabled_states(&self, states: EnabledStates) {
        self.state.write().await.enabled = states;
    }

    pub async fn enabled_states(&self) -> EnabledStates {
        self.state.read().await.enabled.clone()
    }

    /// Drop every item and extension entry, or only those of one plugin.
    /// Returns how many were removed.
    pub async fn clear_all(&self, plugin_id: Option<&str>) -> usize {
        let mut state = self.state.write().await;
        let owned = |owner: &str| plugin_id.is_none_or(|id| id == owner);

        let mut removed = 0;
        for items in state.items.values_mut() {
            let before = items.len();
            items.retain(|item| !owned(&item.plugin_id));
            removed += before - items.len();
        }
        for entries in state.extensions.values_mut() {
            let before = entries.len();
            entries.retain(|entry| !owned(&entry.plugin_id));
            removed += before - entries.len();
        }

        debug!(plugin_id = ?plugin_id, removed, "Cleared registrations");
        removed
    }

    pub async fn register_extension(&self, point: &str, mut entry: ExtensionEntry) -> PluginResult<String> {
        if point.trim().is_empty() || entry.plugin_id.trim().is_empty() {
            return Err(PluginError::ValidationFailed(
                "Extensions need a point and a pluginId".to_string(),
            ));
        }
        entry.id = if entry.id.trim().is_empty() {
            format!("{}:{}:{}", entry.plugin_id, point, Uuid::new_v4())
        } else {
            qualify_id(&entry.plugin_id, &entry.id)
        };

        let id = entry.id.clone();
        let mut state = self.state.write().await;
        let entries = state.extensions.entry(point.to_string()).or_default();
        entries.retain(|existing| existing.plugin_id != entry.plugin_id || existing.id != id);
        entries.push(entry);
        Ok(id)
    }

    pub async fn unregister_extension(&self, point: &str, id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entries) = state.extensions.get_mut(point) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        before != entries.len()
    }

    /// Entries of an extension point from enabled plugins
    pub async fn extensions(&self, point: &str) -> Vec<ExtensionEntry> {
        let state = self.state.read().await;
        state
            .extensions
            .get(point)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| state.is_enabled(&entry.plugin_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
