//! Guest-side table of plugin callables
//!
//! Only the guest can hold closures. The host refers to them by handler id,
//! `<pluginId>:<kind>:<uuid>`, so a plugin's handlers can be purged by prefix.

use crate::{
    PluginResult,
    registry::{ActionOutcome, HandlerInvoker},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

/// A plugin callback, invoked with the optional context of the action
pub type Handler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |context| Box::pin(f(context)))
}

#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_handler_id(plugin_id: &str, kind: &str) -> String {
        format!("{plugin_id}:{kind}:{}", Uuid::new_v4())
    }

    pub async fn insert(&self, handler_id: String, handler: Handler) {
        self.handlers.write().await.insert(handler_id, handler);
    }

    pub async fn remove(&self, handler_id: &str) -> bool {
        self.handlers.write().await.remove(handler_id).is_some()
    }

    pub async fn contains(&self, handler_id: &str) -> bool {
        self.handlers.read().await.contains_key(handler_id)
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every handler owned by `plugin_id`
    pub async fn purge(&self, plugin_id: &str) -> usize {
        let prefix = format!("{plugin_id}:");
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|id, _| !id.starts_with(&prefix));
        before - handlers.len()
    }

    pub async fn clear(&self) {
        self.handlers.write().await.clear();
    }

    /// Run a handler to completion. A panicking handler is contained and
    /// logged; it still counts as executed.
    pub async fn run(&self, handler_id: &str, context: Option<Value>) -> ActionOutcome {
        let Some(handler) = self.handlers.read().await.get(handler_id).cloned() else {
            debug!(handler_id, "No handler registered under this id");
            return ActionOutcome::StaleHandler;
        };

        if let Err(e) = tokio::spawn(handler(context)).await {
            error!(handler_id, error = %e, "Plugin handler failed");
        }
        ActionOutcome::Executed
    }
}

#[async_trait]
impl HandlerInvoker for HandlerTable {
    async fn invoke(&self, handler_id: &str, context: Option<Value>) -> PluginResult<ActionOutcome> {
        Ok(self.run(handler_id, context).await)
    }
}
