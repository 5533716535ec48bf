//! The API object handed to each plugin
//!
//! A [`PluginApi`] is scoped to one plugin id: every registration, file
//! write and UI request it makes is attributed to that id, whatever the
//! plugin passes in.

use crate::{
    PluginResult,
    bridge::BridgeClient,
    handlers::{Handler, HandlerTable},
    registry::{ExtensionEntry, ExtensionItem, ExtensionKind, ItemContext, qualify_id},
    store::{WriteFileOptions, WriteFileResult},
    ui::{
        DirectoryPickerOptions, FileFilter, FormatSelection, FormatSelectorOptions, ModalOptions,
        ModalResult, SaveDialogRequest, SidePanelOptions, SidePanelResult, UiManagers, UiOutcome,
        UiRequest,
    },
};
use downlodr_core::downloads::{Download, DownloadInfo, DownloadOptions, DownloadQueue, MetadataEngine};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{info, warn};

pub const FORMAT_PROVIDERS_POINT: &str = "ui.formatProviders";
pub const SETTINGS_PAGES_POINT: &str = "ui.settingsPages";
pub const FORMAT_HANDLERS_POINT: &str = "formats.handlers";

const SUPPORTED_FORMATS: [&str; 3] = ["mp4", "webm", "mp3"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationOptions {
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub duration: Option<u64>,
}

/// Displays transient notifications on behalf of plugins
pub trait Notifier: Send + Sync {
    fn notify(&self, plugin_id: &str, notification: &NotificationOptions);
}

/// Notifier that writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, plugin_id: &str, notification: &NotificationOptions) {
        info!(
            plugin_id,
            kind = ?notification.kind,
            title = %notification.title,
            "{}",
            notification.message
        );
    }
}

/// Everything the guest side shares between plugins
#[derive(Clone)]
pub struct GuestContext {
    pub bridge: BridgeClient,
    pub handlers: HandlerTable,
    pub ui: Arc<UiManagers>,
    pub downloads: Arc<dyn DownloadQueue>,
    pub metadata: Arc<dyn MetadataEngine>,
    pub notifier: Arc<dyn Notifier>,
}

/// Menu or task-bar item as a plugin describes it, callable included
#[derive(Clone, Default)]
pub struct ActionItem {
    pub id: Option<String>,
    pub label: String,
    pub icon: Option<String>,
    pub tooltip: Option<String>,
    pub context: Option<ItemContext>,
    pub order: Option<i32>,
    pub disabled: bool,
    pub on_click: Option<Handler>,
}

impl ActionItem {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn context(mut self, context: ItemContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn on_click(mut self, handler: Handler) -> Self {
        self.on_click = Some(handler);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveDialogOptions {
    pub title: Option<String>,
    pub default_path: Option<String>,
    pub filters: Vec<FileFilter>,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDialogResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a plugin may write; the owning plugin id is filled in by the facade
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteFileRequest {
    pub file_name: String,
    pub content: String,
    pub file_type: Option<String>,
    pub directory: Option<String>,
    pub overwrite: bool,
    pub custom_path: Option<String>,
}

/// Human-readable byte count: `bytes`, `KB`, `MB` or `GB` (1024-based)
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} bytes"),
    }
}

#[derive(Clone)]
pub struct PluginApi {
    pub downloads: DownloadsApi,
    pub ui: UiApi,
    pub formats: FormatsApi,
    pub utilities: UtilitiesApi,
}

impl PluginApi {
    pub fn new(plugin_id: &str, ctx: &GuestContext) -> Self {
        let plugin_id: Arc<str> = Arc::from(plugin_id);
        let ui = UiApi {
            plugin_id: plugin_id.clone(),
            bridge: ctx.bridge.clone(),
            handlers: ctx.handlers.clone(),
            managers: ctx.ui.clone(),
            notifier: ctx.notifier.clone(),
            owned_handlers: Arc::default(),
        };

        Self {
            downloads: DownloadsApi {
                queue: ctx.downloads.clone(),
                metadata: ctx.metadata.clone(),
            },
            formats: FormatsApi {
                plugin_id: plugin_id.clone(),
                bridge: ctx.bridge.clone(),
            },
            utilities: UtilitiesApi {
                plugin_id,
                bridge: ctx.bridge.clone(),
                ui: ui.clone(),
            },
            ui,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.ui.plugin_id
    }
}

#[derive(Clone)]
pub struct DownloadsApi {
    queue: Arc<dyn DownloadQueue>,
    metadata: Arc<dyn MetadataEngine>,
}

impl DownloadsApi {
    pub async fn get_active_downloads(&self) -> Vec<Download> {
        self.queue.active_downloads().await
    }

    pub async fn add_download(&self, url: &str, options: DownloadOptions) -> PluginResult<String> {
        Ok(self.queue.add(url, options).await?)
    }

    pub async fn get_info(&self, url: &str) -> PluginResult<DownloadInfo> {
        Ok(self.metadata.get_info(url).await?)
    }

    pub async fn cancel_download(&self, id: &str) -> PluginResult<bool> {
        Ok(self.queue.cancel(id).await?)
    }

    pub async fn pause_download(&self, id: &str) -> PluginResult<bool> {
        Ok(self.queue.pause(id).await?)
    }
}

/// Handler behind an item registered through the facade
struct OwnedHandler {
    label: String,
    handler_id: String,
}

#[derive(Clone)]
pub struct UiApi {
    plugin_id: Arc<str>,
    bridge: BridgeClient,
    handlers: HandlerTable,
    managers: Arc<UiManagers>,
    notifier: Arc<dyn Notifier>,
    owned_handlers: Arc<Mutex<HashMap<(ExtensionKind, String), OwnedHandler>>>,
}

impl UiApi {
    pub async fn register_menu_item(&self, item: ActionItem) -> PluginResult<String> {
        self.register_action(ExtensionKind::MenuItem, item).await
    }

    pub async fn unregister_menu_item(&self, id: &str) -> PluginResult<bool> {
        self.unregister_action(ExtensionKind::MenuItem, id).await
    }

    pub async fn register_task_bar_item(&self, item: ActionItem) -> PluginResult<String> {
        self.register_action(ExtensionKind::TaskBarItem, item).await
    }

    pub async fn unregister_task_bar_item(&self, id: &str) -> PluginResult<bool> {
        self.unregister_action(ExtensionKind::TaskBarItem, id).await
    }

    /// Fire-and-forget
    pub fn show_notification(&self, notification: NotificationOptions) {
        self.notifier.notify(&self.plugin_id, &notification);
    }

    pub fn show_format_selector(&self, options: FormatSelectorOptions) -> UiRequest<FormatSelection> {
        self.managers.format_selector.show(&self.plugin_id, options)
    }

    pub fn show_plugin_modal(&self, options: ModalOptions) -> UiRequest<ModalResult> {
        self.managers.modal.show(&self.plugin_id, options)
    }

    pub fn show_plugin_side_panel(&self, options: SidePanelOptions) -> UiRequest<SidePanelResult> {
        self.managers.side_panel.show(&self.plugin_id, options)
    }

    /// Ask the user for a destination, then write `content` there.
    /// Never fails: errors and cancellation are reported in the result.
    pub async fn show_save_file_dialog(&self, options: SaveDialogOptions) -> SaveDialogResult {
        let request = SaveDialogRequest {
            title: options.title,
            default_path: options.default_path,
            filters: options.filters,
        };

        let choice = match self.managers.save_dialog.show(&self.plugin_id, request).await {
            UiOutcome::Submitted(choice) => choice,
            UiOutcome::Closed | UiOutcome::Superseded => {
                return SaveDialogResult {
                    canceled: true,
                    ..Default::default()
                };
            }
        };

        match self
            .bridge
            .save_file_dialog(&self.plugin_id, &choice.file_path, &options.content)
            .await
        {
            Ok(result) => SaveDialogResult {
                success: result.success,
                file_path: result.path.or(Some(choice.file_path)),
                canceled: false,
                error: result.error,
            },
            Err(e) => {
                warn!(plugin_id = %self.plugin_id, error = %e, "Save dialog write failed");
                SaveDialogResult {
                    file_path: Some(choice.file_path),
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    pub async fn register_format_provider(&self, id: &str, name: &str) -> PluginResult<String> {
        self.register_point(FORMAT_PROVIDERS_POINT, id, json!({"id": id, "name": name}))
            .await
    }

    pub async fn register_settings_page(&self, id: &str, title: &str) -> PluginResult<String> {
        self.register_point(SETTINGS_PAGES_POINT, id, json!({"id": id, "title": title}))
            .await
    }

    async fn register_point(&self, point: &str, id: &str, payload: Value) -> PluginResult<String> {
        let entry = ExtensionEntry {
            id: format!("{}:{id}", self.plugin_id),
            plugin_id: self.plugin_id.to_string(),
            payload,
        };
        self.bridge.register_extension(point, entry).await
    }

    async fn register_action(&self, kind: ExtensionKind, item: ActionItem) -> PluginResult<String> {
        let handler_id = match item.on_click {
            Some(on_click) => {
                let handler_id = HandlerTable::new_handler_id(&self.plugin_id, kind.id_segment());
                self.handlers.insert(handler_id.clone(), on_click).await;
                Some(handler_id)
            }
            None => None,
        };

        let label = item.label.trim().to_string();
        let descriptor = ExtensionItem {
            id: item
                .id
                .filter(|id| !id.trim().is_empty())
                .map(|id| qualify_id(&self.plugin_id, &id))
                .unwrap_or_default(),
            plugin_id: self.plugin_id.to_string(),
            label: item.label,
            icon: item.icon,
            tooltip: item.tooltip,
            message: None,
            context: item.context,
            order: item.order,
            disabled: item.disabled,
            handler_id: handler_id.clone(),
        };

        let id = match self.bridge.register_item(kind, descriptor).await {
            Ok(id) => id,
            Err(e) => {
                if let Some(handler_id) = handler_id {
                    self.handlers.remove(&handler_id).await;
                }
                return Err(e);
            }
        };

        // The registry dropped our earlier item with this id or label
        let replaced: Vec<String> = {
            let mut owned = self
                .owned_handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut replaced = Vec::new();
            owned.retain(|(owned_kind, owned_id), previous| {
                let superseded = *owned_kind == kind && (*owned_id == id || previous.label == label);
                if superseded {
                    replaced.push(previous.handler_id.clone());
                }
                !superseded
            });
            if let Some(handler_id) = handler_id {
                owned.insert((kind, id.clone()), OwnedHandler { label, handler_id });
            }
            replaced
        };
        for handler_id in replaced {
            self.handlers.remove(&handler_id).await;
        }
        Ok(id)
    }

    /// Ids are resolved in this plugin's namespace, so another plugin's
    /// item is never found
    async fn unregister_action(&self, kind: ExtensionKind, id: &str) -> PluginResult<bool> {
        let id = qualify_id(&self.plugin_id, id);
        let removed = self.bridge.unregister_item(kind, &id).await?;
        let owned = self
            .owned_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, id));
        if let Some(owned) = owned {
            self.handlers.remove(&owned.handler_id).await;
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatHandlerSpec {
    pub id: String,
    pub name: String,
    pub extensions: Vec<String>,
}

#[derive(Clone)]
pub struct FormatsApi {
    plugin_id: Arc<str>,
    bridge: BridgeClient,
}

impl FormatsApi {
    pub fn get_supported_formats(&self) -> Vec<String> {
        SUPPORTED_FORMATS.iter().map(|f| f.to_string()).collect()
    }

    pub async fn register_format_handler(&self, spec: FormatHandlerSpec) -> PluginResult<String> {
        let entry = ExtensionEntry {
            id: format!("{}:{}", self.plugin_id, spec.id),
            plugin_id: self.plugin_id.to_string(),
            payload: serde_json::to_value(&spec)?,
        };
        self.bridge.register_extension(FORMAT_HANDLERS_POINT, entry).await
    }
}

#[derive(Clone)]
pub struct UtilitiesApi {
    plugin_id: Arc<str>,
    bridge: BridgeClient,
    ui: UiApi,
}

impl UtilitiesApi {
    pub fn format_file_size(&self, bytes: u64) -> String {
        format_file_size(bytes)
    }

    pub async fn write_file(&self, request: WriteFileRequest) -> PluginResult<WriteFileResult> {
        self.bridge
            .write_file(WriteFileOptions {
                plugin_id: self.plugin_id.to_string(),
                file_name: request.file_name,
                content: request.content,
                file_type: request.file_type,
                directory: request.directory,
                overwrite: request.overwrite,
                custom_path: request.custom_path,
            })
            .await
    }

    pub async fn read_file(&self, path: &str) -> PluginResult<String> {
        self.bridge.read_file(&self.plugin_id, path).await
    }

    pub async fn data_path(&self) -> PluginResult<PathBuf> {
        self.bridge.data_path(&self.plugin_id).await
    }

    pub async fn save_file_with_dialog(&self, options: SaveDialogOptions) -> SaveDialogResult {
        self.ui.show_save_file_dialog(options).await
    }

    /// Open an http(s) or mailto link in the user's browser or mail client
    pub async fn open_external_link(&self, url: &str) -> PluginResult<()> {
        self.bridge.open_external_link(url).await
    }

    /// Ask the user for a directory; `None` if they close the picker
    pub async fn select_directory(&self, options: DirectoryPickerOptions) -> Option<PathBuf> {
        self.ui
            .managers
            .directory_picker
            .show(&self.plugin_id, options)
            .await
            .into_value()
            .map(|choice| choice.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handlers::handler, testing};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn context(root: &TempDir) -> GuestContext {
        testing::guest_context(root).await
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 bytes");
        assert_eq!(format_file_size(512), "512 bytes");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[tokio::test]
    async fn test_menu_item_click_runs_handler() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);

        let clicks = Arc::new(AtomicUsize::new(0));
        let counter = clicks.clone();
        let id = api
            .ui
            .register_menu_item(ActionItem::new("Hello").on_click(handler(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })))
            .await
            .unwrap();

        let items = ctx.bridge.items(ExtensionKind::MenuItem, None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].plugin_id, "p1");
        assert!(items[0].handler_id.as_deref().unwrap().starts_with("p1:menu:"));

        ctx.bridge
            .execute_item(ExtensionKind::MenuItem, &id, None)
            .await
            .unwrap();
        assert_eq!(clicks.load(Ordering::SeqCst), 1);

        assert!(api.ui.unregister_menu_item(&id).await.unwrap());
        assert!(ctx.handlers.is_empty().await);
    }

    #[tokio::test]
    async fn test_cannot_unregister_foreign_item() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let p1 = PluginApi::new("p1", &ctx);
        let p2 = PluginApi::new("p2", &ctx);

        let id = p1.ui.register_task_bar_item(ActionItem::new("Mine")).await.unwrap();
        assert!(!p2.ui.unregister_task_bar_item(&id).await.unwrap());
        assert_eq!(
            ctx.bridge
                .items(ExtensionKind::TaskBarItem, None)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_same_custom_id_in_two_plugins() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let p1 = PluginApi::new("p1", &ctx);
        let p2 = PluginApi::new("p2", &ctx);

        let settings = |label: &str| ActionItem {
            id: Some("settings".into()),
            ..ActionItem::new(label)
        };
        let p1_id = p1.ui.register_menu_item(settings("A settings")).await.unwrap();
        let p2_id = p2.ui.register_menu_item(settings("B settings")).await.unwrap();
        assert_eq!(p1_id, "p1:settings");
        assert_eq!(p2_id, "p2:settings");
        assert_eq!(ctx.bridge.items(ExtensionKind::MenuItem, None).await.unwrap().len(), 2);

        // Both the bare and the returned id work for the owner
        assert!(p1.ui.unregister_menu_item("settings").await.unwrap());
        assert!(!p1.ui.unregister_menu_item(&p1_id).await.unwrap());

        let items = ctx.bridge.items(ExtensionKind::MenuItem, None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "B settings");
    }

    #[tokio::test]
    async fn test_reregistering_label_replaces_handler() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);

        let clicks = Arc::new(AtomicUsize::new(0));
        let mut last_id = String::new();
        for _ in 0..3 {
            let counter = clicks.clone();
            last_id = api
                .ui
                .register_menu_item(ActionItem::new("Same").on_click(handler(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })))
                .await
                .unwrap();
        }

        assert_eq!(ctx.bridge.items(ExtensionKind::MenuItem, None).await.unwrap().len(), 1);
        assert_eq!(ctx.handlers.len().await, 1);

        ctx.bridge
            .execute_item(ExtensionKind::MenuItem, &last_id, None)
            .await
            .unwrap();
        assert_eq!(clicks.load(Ordering::SeqCst), 1);

        // Replacing with a handler-less item drops the last handler too
        api.ui.register_menu_item(ActionItem::new("Same")).await.unwrap();
        assert!(ctx.handlers.is_empty().await);
    }

    #[tokio::test]
    async fn test_write_file_is_attributed_to_caller() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);

        let result = api
            .utilities
            .write_file(WriteFileRequest {
                file_name: "report".into(),
                content: "done".into(),
                file_type: Some("txt".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.path.unwrap().ends_with("plugin-data/p1/report.txt"));
        assert_eq!(api.utilities.read_file("report.txt").await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_save_dialog_flow() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);
        let target = root.path().join("chosen/out.txt");

        let ui = ctx.ui.clone();
        let chooser = target.clone();
        let pending = tokio::spawn(async move {
            api.utilities
                .save_file_with_dialog(SaveDialogOptions {
                    content: "saved".into(),
                    ..Default::default()
                })
                .await
        });

        while !ui.save_dialog.is_pending() {
            tokio::task::yield_now().await;
        }
        ui.save_dialog
            .resolve(crate::ui::SaveDialogChoice { file_path: chooser });

        let result = pending.await.unwrap();
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "saved");
    }

    #[tokio::test]
    async fn test_save_dialog_cancelled() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);

        let ui = ctx.ui.clone();
        let pending = tokio::spawn(async move {
            api.ui.show_save_file_dialog(SaveDialogOptions::default()).await
        });
        while !ui.save_dialog.is_pending() {
            tokio::task::yield_now().await;
        }
        ui.save_dialog.close();

        let result = pending.await.unwrap();
        assert!(result.canceled);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_select_directory() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);

        let ui = ctx.ui.clone();
        let utilities = api.utilities.clone();
        let picked = tokio::spawn(async move {
            utilities
                .select_directory(DirectoryPickerOptions::default())
                .await
        });
        while !ui.directory_picker.is_pending() {
            tokio::task::yield_now().await;
        }
        assert_eq!(ui.directory_picker.current().unwrap().0, "p1");
        ui.directory_picker.resolve(crate::ui::DirectoryChoice {
            path: root.path().join("videos"),
        });
        assert_eq!(picked.await.unwrap(), Some(root.path().join("videos")));

        let closed = tokio::spawn(async move {
            api.utilities
                .select_directory(DirectoryPickerOptions::default())
                .await
        });
        while !ui.directory_picker.is_pending() {
            tokio::task::yield_now().await;
        }
        ui.directory_picker.close();
        assert_eq!(closed.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_external_link_rejects_files() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);

        let err = api
            .utilities
            .open_external_link("file:///etc/passwd")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E501");
    }

    #[tokio::test]
    async fn test_downloads_delegate_to_queue() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);

        let id = api
            .downloads
            .add_download(
                "https://example.com/v",
                DownloadOptions {
                    name: "video".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(api.downloads.get_active_downloads().await[0].id, id);
        assert!(api.downloads.pause_download(&id).await.unwrap());

        let err = api.downloads.get_info("https://example.com/v").await.unwrap_err();
        assert_eq!(err.code(), "E101");
    }

    #[tokio::test]
    async fn test_format_handler_registered_as_extension() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root).await;
        let api = PluginApi::new("p1", &ctx);

        assert_eq!(api.formats.get_supported_formats(), vec!["mp4", "webm", "mp3"]);
        api.formats
            .register_format_handler(FormatHandlerSpec {
                id: "flac".into(),
                name: "FLAC".into(),
                extensions: vec!["flac".into()],
            })
            .await
            .unwrap();
        api.ui.register_settings_page("prefs", "Preferences").await.unwrap();

        let handlers = ctx.bridge.extensions(FORMAT_HANDLERS_POINT).await.unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].id, "p1:flac");
        assert_eq!(ctx.bridge.extensions(SETTINGS_PAGES_POINT).await.unwrap().len(), 1);
    }
}
