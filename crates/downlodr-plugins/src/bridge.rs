//! Message bridge between the privileged host and the guest
//!
//! The host owns the store and the registry. The guest (facade, loader,
//! handler table, sandboxes) reaches them only through [`BridgeClient`].
//! Every request and reply is converted to `serde_json::Value` on the way
//! through, so nothing but data can cross.

use crate::{
    PluginError, PluginResult, RemoteError,
    enabled::EnabledStates,
    handlers::HandlerTable,
    registry::{
        ActionOutcome, ExtensionEntry, ExtensionItem, ExtensionKind, ExtensionRegistry,
        HandlerInvoker, ItemContext,
    },
    store::{InstallOutcome, PluginCode, PluginMetadata, PluginStore, WriteFileOptions, WriteFileResult},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 128;
const EVENT_CAPACITY: usize = 64;

/// Requests the guest may send, tagged with their boundary operation name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all_fields = "camelCase")]
pub enum BridgeRequest {
    #[serde(rename = "plugins:list")]
    List,
    #[serde(rename = "plugins:get-code")]
    GetCode { plugin_id: String },
    #[serde(rename = "plugins:install")]
    Install { path: PathBuf },
    #[serde(rename = "plugins:uninstall")]
    Uninstall { plugin_id: String },
    #[serde(rename = "plugins:getEnabled")]
    GetEnabled,
    #[serde(rename = "plugins:setEnabled")]
    SetEnabled { plugin_id: String, enabled: bool },

    #[serde(rename = "plugins:register-menu-item")]
    RegisterMenuItem { item: ExtensionItem },
    #[serde(rename = "plugins:unregister-menu-item")]
    UnregisterMenuItem { id: String },
    #[serde(rename = "plugins:menu-items")]
    MenuItems { context: Option<ItemContext> },
    #[serde(rename = "plugins:execute-menu-item")]
    ExecuteMenuItem { id: String, context: Option<Value> },

    #[serde(rename = "plugins:register-taskbar-item")]
    RegisterTaskBarItem { item: ExtensionItem },
    #[serde(rename = "plugins:unregister-taskbar-item")]
    UnregisterTaskBarItem { id: String },
    #[serde(rename = "plugins:taskbar-items")]
    TaskBarItems { context: Option<ItemContext> },
    #[serde(rename = "plugins:execute-taskbar-item")]
    ExecuteTaskBarItem { id: String, context: Option<Value> },

    #[serde(rename = "plugins:register-notification-item")]
    RegisterNotificationItem { item: ExtensionItem },
    #[serde(rename = "plugins:unregister-notification-item")]
    UnregisterNotificationItem { id: String },
    #[serde(rename = "plugins:notification-items")]
    NotificationItems { context: Option<ItemContext> },
    #[serde(rename = "plugins:execute-notification-item")]
    ExecuteNotificationItem { id: String, context: Option<Value> },

    #[serde(rename = "plugins:register-extension")]
    RegisterExtension { point: String, entry: ExtensionEntry },
    #[serde(rename = "plugins:unregister-extension")]
    UnregisterExtension { point: String, id: String },
    #[serde(rename = "plugins:extensions")]
    Extensions { point: String },
    #[serde(rename = "plugins:clear-registrations")]
    ClearRegistrations { plugin_id: Option<String> },

    #[serde(rename = "plugins:writeFile")]
    WriteFile { options: WriteFileOptions },
    #[serde(rename = "plugins:read-file")]
    ReadFile { plugin_id: String, path: String },
    #[serde(rename = "plugins:save-file-dialog")]
    SaveFileDialog {
        plugin_id: String,
        file_path: PathBuf,
        content: String,
    },
    #[serde(rename = "plugins:get-data-path")]
    GetDataPath { plugin_id: String },
    #[serde(rename = "plugins:get-location")]
    GetLocation { plugin_id: String },
    #[serde(rename = "plugins:open-folder")]
    OpenFolder { plugin_id: String },
    #[serde(rename = "plugins:open-external-link")]
    OpenExternalLink { url: String },
    #[serde(rename = "plugins:reload")]
    Reload,
}

impl BridgeRequest {
    pub fn register_item(kind: ExtensionKind, item: ExtensionItem) -> Self {
        match kind {
            ExtensionKind::MenuItem => Self::RegisterMenuItem { item },
            ExtensionKind::TaskBarItem => Self::RegisterTaskBarItem { item },
            ExtensionKind::Notification => Self::RegisterNotificationItem { item },
        }
    }

    pub fn unregister_item(kind: ExtensionKind, id: String) -> Self {
        match kind {
            ExtensionKind::MenuItem => Self::UnregisterMenuItem { id },
            ExtensionKind::TaskBarItem => Self::UnregisterTaskBarItem { id },
            ExtensionKind::Notification => Self::UnregisterNotificationItem { id },
        }
    }

    pub fn list_items(kind: ExtensionKind, context: Option<ItemContext>) -> Self {
        match kind {
            ExtensionKind::MenuItem => Self::MenuItems { context },
            ExtensionKind::TaskBarItem => Self::TaskBarItems { context },
            ExtensionKind::Notification => Self::NotificationItems { context },
        }
    }

    pub fn execute_item(kind: ExtensionKind, id: String, context: Option<Value>) -> Self {
        match kind {
            ExtensionKind::MenuItem => Self::ExecuteMenuItem { id, context },
            ExtensionKind::TaskBarItem => Self::ExecuteTaskBarItem { id, context },
            ExtensionKind::Notification => Self::ExecuteNotificationItem { id, context },
        }
    }
}

/// Fire-and-forget notifications from host to guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum HostEvent {
    #[serde(rename = "plugins:stateChanged")]
    StateChanged { plugin_id: String, enabled: bool },
    #[serde(rename = "plugins:reloaded")]
    Reloaded,
    #[serde(rename = "plugins:uninstalled")]
    Uninstalled { plugin_id: String },
}

/// Hands folders and links to the desktop
pub trait ShellOpener: Send + Sync {
    fn open(&self, path: &Path) -> PluginResult<()>;

    fn open_link(&self, url: &str) -> PluginResult<()>;
}

/// Opens folders in the file manager and links in the default browser
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

impl ShellOpener for SystemShell {
    fn open(&self, path: &Path) -> PluginResult<()> {
        open::that_detached(path)?;
        Ok(())
    }

    fn open_link(&self, url: &str) -> PluginResult<()> {
        open::that_detached(url)?;
        Ok(())
    }
}

const LINK_SCHEMES: [&str; 3] = ["https://", "http://", "mailto:"];

/// Only web and mail links may be handed to the shell
fn check_link(url: &str) -> PluginResult<&str> {
    let url = url.trim();
    let lower = url.to_ascii_lowercase();
    let allowed = LINK_SCHEMES
        .iter()
        .any(|scheme| lower.starts_with(scheme) && lower.len() > scheme.len());
    if allowed && !url.chars().any(char::is_whitespace) {
        Ok(url)
    } else {
        Err(PluginError::ValidationFailed(format!(
            "Only http, https and mailto links can be opened: '{url}'"
        )))
    }
}

struct Envelope {
    payload: Value,
    reply: oneshot::Sender<Result<Value, RemoteError>>,
}

/// Privileged side of the bridge
pub struct PluginHost {
    store: Arc<PluginStore>,
    registry: Arc<ExtensionRegistry>,
    events: broadcast::Sender<HostEvent>,
    opener: Arc<dyn ShellOpener>,
}

impl PluginHost {
    pub fn new(store: Arc<PluginStore>, registry: Arc<ExtensionRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            registry,
            events,
            opener: Arc::new(SystemShell),
        }
    }

    pub fn with_opener(mut self, opener: Arc<dyn ShellOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Start serving requests and hand out the guest's end of the bridge
    pub async fn spawn(self) -> BridgeClient {
        self.registry
            .update_enabled_states(self.store.enabled_states())
            .await;

        let (requests, mut rx) = mpsc::channel::<Envelope>(REQUEST_CAPACITY);
        let events = self.events.clone();
        let host = Arc::new(self);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let host = host.clone();
                tokio::spawn(async move { host.dispatch(envelope).await });
            }
            debug!("Plugin bridge closed");
        });

        BridgeClient { requests, events }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let op = envelope
            .payload
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("<missing>")
            .to_string();

        let reply = match serde_json::from_value::<BridgeRequest>(envelope.payload) {
            Ok(request) => self.handle(request).await.map_err(|e| {
                warn!(op = %op, error = %e, "Bridge request failed");
                e.to_remote()
            }),
            Err(e) => Err(PluginError::Bridge(format!("Malformed request '{op}': {e}")).to_remote()),
        };

        let _ = envelope.reply.send(reply);
    }

    /// Execute one request against the store and registry
    pub async fn handle(&self, request: BridgeRequest) -> PluginResult<Value> {
        use BridgeRequest as R;

        let value = match request {
            R::List => to_value(self.store.list()?)?,
            R::GetCode { plugin_id } => to_value(self.store.get_code(&plugin_id)?)?,
            R::Install { path } => {
                let outcome = self.store.install(&path).await?;
                self.sync_enabled_states().await;
                to_value(outcome)?
            }
            R::Uninstall { plugin_id } => {
                let removed = self.store.uninstall(&plugin_id).await?;
                if removed {
                    self.registry.clear_all(Some(&plugin_id)).await;
                    self.emit(HostEvent::Uninstalled { plugin_id });
                }
                Value::Bool(removed)
            }
            R::GetEnabled => to_value(self.store.enabled_states())?,
            R::SetEnabled { plugin_id, enabled } => {
                self.store.set_enabled(&plugin_id, enabled)?;
                self.sync_enabled_states().await;
                info!(plugin_id = %plugin_id, enabled, "Plugin enabled state changed");
                self.emit(HostEvent::StateChanged { plugin_id, enabled });
                Value::Bool(true)
            }

            R::RegisterMenuItem { item } => self.register_item(ExtensionKind::MenuItem, item).await?,
            R::RegisterTaskBarItem { item } => {
                self.register_item(ExtensionKind::TaskBarItem, item).await?
            }
            R::RegisterNotificationItem { item } => {
                self.register_item(ExtensionKind::Notification, item).await?
            }
            R::UnregisterMenuItem { id } => self.unregister_item(ExtensionKind::MenuItem, &id).await,
            R::UnregisterTaskBarItem { id } => {
                self.unregister_item(ExtensionKind::TaskBarItem, &id).await
            }
            R::UnregisterNotificationItem { id } => {
                self.unregister_item(ExtensionKind::Notification, &id).await
            }
            R::MenuItems { context } => {
                to_value(self.registry.list(ExtensionKind::MenuItem, context).await)?
            }
            R::TaskBarItems { context } => {
                to_value(self.registry.list(ExtensionKind::TaskBarItem, context).await)?
            }
            R::NotificationItems { context } => {
                to_value(self.registry.list(ExtensionKind::Notification, context).await)?
            }
            R::ExecuteMenuItem { id, context } => {
                self.execute(ExtensionKind::MenuItem, &id, context).await?
            }
            R::ExecuteTaskBarItem { id, context } => {
                self.execute(ExtensionKind::TaskBarItem, &id, context).await?
            }
            R::ExecuteNotificationItem { id, context } => {
                self.execute(ExtensionKind::Notification, &id, context).await?
            }

            R::RegisterExtension { point, entry } => {
                Value::String(self.registry.register_extension(&point, entry).await?)
            }
            R::UnregisterExtension { point, id } => {
                Value::Bool(self.registry.unregister_extension(&point, &id).await)
            }
            R::Extensions { point } => to_value(self.registry.extensions(&point).await)?,
            R::ClearRegistrations { plugin_id } => {
                to_value(self.registry.clear_all(plugin_id.as_deref()).await)?
            }

            R::WriteFile { options } => to_value(self.store.write_file(&options)?)?,
            R::ReadFile { plugin_id, path } => Value::String(self.store.read_file(&plugin_id, &path)?),
            R::SaveFileDialog {
                plugin_id,
                file_path,
                content,
            } => to_value(self.store.save_user_file(&plugin_id, &file_path, &content)?)?,
            R::GetDataPath { plugin_id } => to_value(self.store.plugin_data_dir(&plugin_id)?)?,
            R::GetLocation { plugin_id } => to_value(self.store.get_location(&plugin_id))?,
            R::OpenFolder { plugin_id } => match self.store.get_location(&plugin_id) {
                Some(dir) => {
                    self.opener.open(&dir)?;
                    Value::Bool(true)
                }
                None => Value::Bool(false),
            },
            R::OpenExternalLink { url } => {
                self.opener.open_link(check_link(&url)?)?;
                Value::Null
            }
            R::Reload => {
                self.emit(HostEvent::Reloaded);
                Value::Null
            }
        };

        Ok(value)
    }

    async fn register_item(&self, kind: ExtensionKind, item: ExtensionItem) -> PluginResult<Value> {
        Ok(Value::String(self.registry.register(kind, item).await?))
    }

    async fn unregister_item(&self, kind: ExtensionKind, id: &str) -> Value {
        Value::Bool(self.registry.unregister(kind, id).await)
    }

    async fn execute(&self, kind: ExtensionKind, id: &str, context: Option<Value>) -> PluginResult<Value> {
        to_value(self.registry.execute_action(kind, id, context).await?)
    }

    async fn sync_enabled_states(&self) {
        self.registry
            .update_enabled_states(self.store.enabled_states())
            .await;
    }

    fn emit(&self, event: HostEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn to_value<T: Serialize>(value: T) -> PluginResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Guest side of the bridge
#[derive(Clone)]
pub struct BridgeClient {
    requests: mpsc::Sender<Envelope>,
    events: broadcast::Sender<HostEvent>,
}

impl BridgeClient {
    /// Send a request and wait for the host's reply
    pub async fn request(&self, request: BridgeRequest) -> PluginResult<Value> {
        let payload = serde_json::to_value(&request)?;
        let (reply, rx) = oneshot::channel();

        self.requests
            .send(Envelope { payload, reply })
            .await
            .map_err(|_| PluginError::Bridge("host is not running".to_string()))?;

        rx.await
            .map_err(|_| PluginError::Bridge("host dropped the request".to_string()))?
            .map_err(PluginError::from)
    }

    async fn call<T: DeserializeOwned>(&self, request: BridgeRequest) -> PluginResult<T> {
        Ok(serde_json::from_value(self.request(request).await?)?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub async fn list_plugins(&self) -> PluginResult<Vec<PluginMetadata>> {
        self.call(BridgeRequest::List).await
    }

    pub async fn get_code(&self, plugin_id: &str) -> PluginResult<PluginCode> {
        self.call(BridgeRequest::GetCode {
            plugin_id: plugin_id.to_string(),
        })
        .await
    }

    pub async fn install(&self, path: &Path) -> PluginResult<InstallOutcome> {
        self.call(BridgeRequest::Install {
            path: path.to_path_buf(),
        })
        .await
    }

    pub async fn uninstall(&self, plugin_id: &str) -> PluginResult<bool> {
        self.call(BridgeRequest::Uninstall {
            plugin_id: plugin_id.to_string(),
        })
        .await
    }

    pub async fn enabled_states(&self) -> PluginResult<EnabledStates> {
        self.call(BridgeRequest::GetEnabled).await
    }

    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> PluginResult<bool> {
        self.call(BridgeRequest::SetEnabled {
            plugin_id: plugin_id.to_string(),
            enabled,
        })
        .await
    }

    pub async fn register_item(&self, kind: ExtensionKind, item: ExtensionItem) -> PluginResult<String> {
        self.call(BridgeRequest::register_item(kind, item)).await
    }

    pub async fn unregister_item(&self, kind: ExtensionKind, id: &str) -> PluginResult<bool> {
        self.call(BridgeRequest::unregister_item(kind, id.to_string()))
            .await
    }

    pub async fn items(
        &self,
        kind: ExtensionKind,
        context: Option<ItemContext>,
    ) -> PluginResult<Vec<ExtensionItem>> {
        self.call(BridgeRequest::list_items(kind, context)).await
    }

    pub async fn execute_item(
        &self,
        kind: ExtensionKind,
        id: &str,
        context: Option<Value>,
    ) -> PluginResult<ActionOutcome> {
        self.call(BridgeRequest::execute_item(kind, id.to_string(), context))
            .await
    }

    pub async fn register_extension(&self, point: &str, entry: ExtensionEntry) -> PluginResult<String> {
        self.call(BridgeRequest::RegisterExtension {
            point: point.to_string(),
            entry,
        })
        .await
    }

    pub async fn unregister_extension(&self, point: &str, id: &str) -> PluginResult<bool> {
        self.call(BridgeRequest::UnregisterExtension {
            point: point.to_string(),
            id: id.to_string(),
        })
        .await
    }

    pub async fn extensions(&self, point: &str) -> PluginResult<Vec<ExtensionEntry>> {
        self.call(BridgeRequest::Extensions {
            point: point.to_string(),
        })
        .await
    }

    pub async fn clear_registrations(&self, plugin_id: Option<&str>) -> PluginResult<usize> {
        self.call(BridgeRequest::ClearRegistrations {
            plugin_id: plugin_id.map(str::to_string),
        })
        .await
    }

    pub async fn write_file(&self, options: WriteFileOptions) -> PluginResult<WriteFileResult> {
        self.call(BridgeRequest::WriteFile { options }).await
    }

    pub async fn read_file(&self, plugin_id: &str, path: &str) -> PluginResult<String> {
        self.call(BridgeRequest::ReadFile {
            plugin_id: plugin_id.to_string(),
            path: path.to_string(),
        })
        .await
    }

    pub async fn save_file_dialog(
        &self,
        plugin_id: &str,
        file_path: &Path,
        content: &str,
    ) -> PluginResult<WriteFileResult> {
        self.call(BridgeRequest::SaveFileDialog {
            plugin_id: plugin_id.to_string(),
            file_path: file_path.to_path_buf(),
            content: content.to_string(),
        })
        .await
    }

    pub async fn data_path(&self, plugin_id: &str) -> PluginResult<PathBuf> {
        self.call(BridgeRequest::GetDataPath {
            plugin_id: plugin_id.to_string(),
        })
        .await
    }

    pub async fn location(&self, plugin_id: &str) -> PluginResult<Option<PathBuf>> {
        self.call(BridgeRequest::GetLocation {
            plugin_id: plugin_id.to_string(),
        })
        .await
    }

    pub async fn open_folder(&self, plugin_id: &str) -> PluginResult<bool> {
        self.call(BridgeRequest::OpenFolder {
            plugin_id: plugin_id.to_string(),
        })
        .await
    }

    pub async fn open_external_link(&self, url: &str) -> PluginResult<()> {
        self.request(BridgeRequest::OpenExternalLink {
            url: url.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn reload(&self) -> PluginResult<()> {
        self.request(BridgeRequest::Reload).await.map(|_| ())
    }
}

/// Host-to-guest request to run a handler
pub struct GuestCall {
    pub handler_id: String,
    pub context: Option<Value>,
    reply: oneshot::Sender<ActionOutcome>,
}

/// Host's end of the guest link; plugged into the registry as its invoker
#[derive(Clone)]
pub struct GuestLink {
    calls: mpsc::Sender<GuestCall>,
}

/// Serve handler invocations from the host out of `handlers`
pub fn connect_guest(handlers: HandlerTable) -> GuestLink {
    let (calls, mut rx) = mpsc::channel::<GuestCall>(REQUEST_CAPACITY);

    tokio::spawn(async move {
        while let Some(call) = rx.recv().await {
            let handlers = handlers.clone();
            tokio::spawn(async move {
                let outcome = handlers.run(&call.handler_id, call.context).await;
                let _ = call.reply.send(outcome);
            });
        }
    });

    GuestLink { calls }
}

#[async_trait]
impl HandlerInvoker for GuestLink {
    async fn invoke(&self, handler_id: &str, context: Option<Value>) -> PluginResult<ActionOutcome> {
        let (reply, rx) = oneshot::channel();
        self.calls
            .send(GuestCall {
                handler_id: handler_id.to_string(),
                context,
                reply,
            })
            .await
            .map_err(|_| PluginError::Bridge("guest is not connected".to_string()))?;

        rx.await
            .map_err(|_| PluginError::Bridge("guest dropped the handler call".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::handler;
    use downlodr_core::config::AppPaths;
    use serde_json::json;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingOpener {
        opened: Mutex<Vec<PathBuf>>,
        links: Mutex<Vec<String>>,
    }

    impl ShellOpener for RecordingOpener {
        fn open(&self, path: &Path) -> PluginResult<()> {
            self.opened.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn open_link(&self, url: &str) -> PluginResult<()> {
            self.links.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    async fn start(root: &TempDir) -> (BridgeClient, Arc<ExtensionRegistry>, Arc<RecordingOpener>) {
        let store = Arc::new(PluginStore::open(&AppPaths::new(root.path().join("app"))).unwrap());
        let registry = Arc::new(ExtensionRegistry::new());
        let opener = Arc::new(RecordingOpener::default());
        let client = PluginHost::new(store, registry.clone())
            .with_opener(opener.clone())
            .spawn()
            .await;
        (client, registry, opener)
    }

    fn package(root: &TempDir, id: &str) -> PathBuf {
        let dir = root.path().join("pkg").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            format!(r#"{{"id":"{id}","name":"{id}","version":"1.0.0"}}"#),
        )
        .unwrap();
        std::fs::write(dir.join("index.wasm"), "(module)").unwrap();
        dir
    }

    #[test]
    fn test_request_wire_names() {
        let value = serde_json::to_value(BridgeRequest::SetEnabled {
            plugin_id: "p1".into(),
            enabled: false,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"op": "plugins:setEnabled", "args": {"pluginId": "p1", "enabled": false}})
        );
        assert_eq!(
            serde_json::to_value(BridgeRequest::List).unwrap(),
            json!({"op": "plugins:list"})
        );
        assert_eq!(
            serde_json::to_value(HostEvent::Reloaded).unwrap(),
            json!({"event": "plugins:reloaded"})
        );
    }

    #[tokio::test]
    async fn test_install_list_uninstall_through_bridge() {
        let root = TempDir::new().unwrap();
        let (client, _, _) = start(&root).await;
        let mut events = client.subscribe();

        let outcome = client.install(&package(&root, "p1")).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(client.list_plugins().await.unwrap().len(), 1);
        assert_eq!(client.get_code("p1").await.unwrap().code, b"(module)");

        assert!(client.uninstall("p1").await.unwrap());
        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::Uninstalled {
                plugin_id: "p1".into()
            }
        );
        assert!(!client.uninstall("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_enabled_updates_registry_and_broadcasts() {
        let root = TempDir::new().unwrap();
        let (client, registry, _) = start(&root).await;
        let mut events = client.subscribe();

        let item = ExtensionItem {
            plugin_id: "p1".into(),
            label: "Hello".into(),
            ..Default::default()
        };
        client.register_item(ExtensionKind::MenuItem, item).await.unwrap();

        client.set_enabled("p1", false).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::StateChanged {
                plugin_id: "p1".into(),
                enabled: false
            }
        );
        assert!(client.items(ExtensionKind::MenuItem, None).await.unwrap().is_empty());
        assert_eq!(registry.enabled_states().await.get("p1"), Some(&false));
        assert_eq!(client.enabled_states().await.unwrap().get("p1"), Some(&false));
    }

    #[tokio::test]
    async fn test_execute_reaches_guest_handler() {
        let root = TempDir::new().unwrap();
        let (client, registry, _) = start(&root).await;
        let handlers = HandlerTable::new();
        registry
            .attach_invoker(Arc::new(connect_guest(handlers.clone())))
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler_id = HandlerTable::new_handler_id("p1", "menu");
        handlers
            .insert(
                handler_id.clone(),
                handler(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await;

        let id = client
            .register_item(
                ExtensionKind::MenuItem,
                ExtensionItem {
                    plugin_id: "p1".into(),
                    label: "Run".into(),
                    handler_id: Some(handler_id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = client
            .execute_item(ExtensionKind::MenuItem, &id, Some(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handlers.remove(&handler_id).await;
        let outcome = client
            .execute_item(ExtensionKind::MenuItem, &id, None)
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::StaleHandler);
    }

    #[tokio::test]
    async fn test_path_violation_crosses_bridge() {
        let root = TempDir::new().unwrap();
        let (client, _, _) = start(&root).await;

        let err = client
            .write_file(WriteFileOptions {
                plugin_id: "p1".into(),
                file_name: "x".into(),
                content: "x".into(),
                custom_path: Some("../../escape.txt".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::PathViolation(_)));
    }

    #[tokio::test]
    async fn test_open_folder_uses_opener() {
        let root = TempDir::new().unwrap();
        let (client, _, opener) = start(&root).await;

        assert!(!client.open_folder("p1").await.unwrap());
        client.install(&package(&root, "p1")).await.unwrap();
        assert!(client.open_folder("p1").await.unwrap());
        assert_eq!(opener.opened.lock().unwrap().len(), 1);
        assert!(client.location("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_external_links_are_scheme_checked() {
        let root = TempDir::new().unwrap();
        let (client, _, opener) = start(&root).await;

        client.open_external_link(" https://downlodr.com/ ").await.unwrap();
        client.open_external_link("mailto:team@downlodr.com").await.unwrap();
        for rejected in ["file:///etc/passwd", "calc.exe", "https://", "javascript:alert(1)"] {
            let err = client.open_external_link(rejected).await.unwrap_err();
            assert!(matches!(err, PluginError::ValidationFailed(_)), "{rejected}");
        }
        assert_eq!(
            opener.links.lock().unwrap().as_slice(),
            &["https://downlodr.com/", "mailto:team@downlodr.com"]
        );
    }

    #[tokio::test]
    async fn test_reload_broadcasts() {
        let root = TempDir::new().unwrap();
        let (client, _, _) = start(&root).await;
        let mut events = client.subscribe();
        client.reload().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), HostEvent::Reloaded);
    }
}
