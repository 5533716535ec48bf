//! Single-flight UI request managers
//!
//! Each kind of plugin UI (modal, side panel, format selector, save dialog,
//! directory picker) shows at most one request at a time. A new request supersedes the
//! pending one, whose awaiting future resolves instead of hanging.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use tracing::debug;

/// How a UI request ended
#[derive(Debug, Clone, PartialEq)]
pub enum UiOutcome<T> {
    Submitted(T),
    /// Closed or cancelled by the user
    Closed,
    /// Replaced by a newer request of the same kind
    Superseded,
}

impl<T> UiOutcome<T> {
    pub fn is_closed(&self) -> bool {
        !matches!(self, Self::Submitted(_))
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Submitted(value) => Some(value),
            _ => None,
        }
    }
}

impl<T: Serialize> UiOutcome<T> {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Submitted(value) => json!({"closed": false, "value": value}),
            Self::Closed => json!({"closed": true}),
            Self::Superseded => json!({"closed": true, "superseded": true}),
        }
    }
}

/// Future returned by [`SingleRequestManager::show`]. Always resolves.
pub struct UiRequest<T> {
    rx: oneshot::Receiver<UiOutcome<T>>,
}

impl<T> Future for UiRequest<T> {
    type Output = UiOutcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(UiOutcome::Closed),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Pending<O, T> {
    plugin_id: String,
    options: O,
    resolve: oneshot::Sender<UiOutcome<T>>,
}

pub struct SingleRequestManager<O, T> {
    kind: &'static str,
    current: Mutex<Option<Pending<O, T>>>,
}

impl<O: Clone, T> SingleRequestManager<O, T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            current: Mutex::new(None),
        }
    }

    /// Show a request, superseding any pending one
    pub fn show(&self, plugin_id: &str, options: O) -> UiRequest<T> {
        let (tx, rx) = oneshot::channel();
        let previous = self.slot().replace(Pending {
            plugin_id: plugin_id.to_string(),
            options,
            resolve: tx,
        });

        if let Some(previous) = previous {
            debug!(kind = self.kind, plugin_id = %previous.plugin_id, "UI request superseded");
            let _ = previous.resolve.send(UiOutcome::Superseded);
        }
        UiRequest { rx }
    }

    /// The request to render: requesting plugin and its options
    pub fn current(&self) -> Option<(String, O)> {
        self.slot()
            .as_ref()
            .map(|p| (p.plugin_id.clone(), p.options.clone()))
    }

    pub fn is_pending(&self) -> bool {
        self.slot().is_some()
    }

    /// Complete the pending request with a value
    pub fn resolve(&self, value: T) -> bool {
        self.finish(UiOutcome::Submitted(value))
    }

    /// Close the pending request without a value
    pub fn close(&self) -> bool {
        self.finish(UiOutcome::Closed)
    }

    fn finish(&self, outcome: UiOutcome<T>) -> bool {
        match self.slot().take() {
            Some(pending) => {
                let _ = pending.resolve.send(outcome);
                true
            }
            None => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Pending<O, T>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModalOptions {
    pub title: Option<String>,
    pub content: String,
    pub ok_text: Option<String>,
    pub cancel_text: Option<String>,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModalResult {
    pub confirmed: bool,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidePanelOptions {
    pub title: Option<String>,
    pub content: String,
    pub width: Option<u32>,
    pub closable: bool,
}

impl Default for SidePanelOptions {
    fn default() -> Self {
        Self {
            title: None,
            content: String::new(),
            width: None,
            closable: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidePanelResult {
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatOption {
    pub id: String,
    pub label: String,
    pub value: String,
    pub default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatSelectorOptions {
    pub title: Option<String>,
    pub formats: Vec<FormatOption>,
    pub show_keep_original: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatSelection {
    pub selected_format: String,
    pub keep_original: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileFilter {
    pub name: String,
    pub extensions: Vec<String>,
}

/// What the save dialog shows; the content to save stays with the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveDialogRequest {
    pub title: Option<String>,
    pub default_path: Option<String>,
    pub filters: Vec<FileFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDialogChoice {
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectoryPickerOptions {
    pub title: Option<String>,
    pub default_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryChoice {
    pub path: PathBuf,
}

pub type ModalManager = SingleRequestManager<ModalOptions, ModalResult>;
pub type SidePanelManager = SingleRequestManager<SidePanelOptions, SidePanelResult>;
pub type FormatSelectorManager = SingleRequestManager<FormatSelectorOptions, FormatSelection>;
pub type SaveDialogManager = SingleRequestManager<SaveDialogRequest, SaveDialogChoice>;
pub type DirectoryPickerManager = SingleRequestManager<DirectoryPickerOptions, DirectoryChoice>;

/// UI managers shared by every plugin on the guest side
pub struct UiManagers {
    pub modal: ModalManager,
    pub side_panel: SidePanelManager,
    pub format_selector: FormatSelectorManager,
    pub save_dialog: SaveDialogManager,
    pub directory_picker: DirectoryPickerManager,
}

impl UiManagers {
    pub fn new() -> Self {
        Self {
            modal: SingleRequestManager::new("modal"),
            side_panel: SingleRequestManager::new("side-panel"),
            format_selector: SingleRequestManager::new("format-selector"),
            save_dialog: SingleRequestManager::new("save-dialog"),
            directory_picker: SingleRequestManager::new("directory-picker"),
        }
    }

    /// Close every pending request, e.g. when the UI goes away
    pub fn close_all(&self) {
        self.modal.close();
        self.side_panel.close();
        self.format_selector.close();
        self.save_dialog.close();
        self.directory_picker.close();
    }
}

impl Default for UiManagers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_value() {
        let manager = ModalManager::new("modal");
        let request = manager.show(
            "p1",
            ModalOptions {
                content: "Proceed?".into(),
                ..Default::default()
            },
        );

        let (plugin_id, options) = manager.current().unwrap();
        assert_eq!(plugin_id, "p1");
        assert_eq!(options.content, "Proceed?");

        assert!(manager.resolve(ModalResult {
            confirmed: true,
            data: None,
        }));
        let outcome = request.await;
        assert!(matches!(outcome, UiOutcome::Submitted(ModalResult { confirmed: true, .. })));
        assert!(!manager.is_pending());
    }

    #[tokio::test]
    async fn test_second_request_supersedes_first() {
        let manager = ModalManager::new("modal");
        let first = manager.show("p1", ModalOptions::default());
        let second = manager.show("p2", ModalOptions::default());

        assert_eq!(first.await, UiOutcome::Superseded);
        assert_eq!(manager.current().unwrap().0, "p2");

        manager.close();
        assert_eq!(second.await, UiOutcome::Closed);
        assert!(!manager.close());
    }

    #[tokio::test]
    async fn test_dropped_manager_resolves_closed() {
        let manager = SidePanelManager::new("side-panel");
        let request = manager.show("p1", SidePanelOptions::default());
        drop(manager);
        assert!(request.await.is_closed());
    }

    #[test]
    fn test_outcome_json() {
        let submitted = UiOutcome::Submitted(FormatSelection {
            selected_format: "mp3".into(),
            keep_original: true,
        });
        assert_eq!(
            submitted.to_json(),
            json!({"closed": false, "value": {"selectedFormat": "mp3", "keepOriginal": true}})
        );
        assert_eq!(UiOutcome::<()>::Closed.to_json(), json!({"closed": true}));
        assert_eq!(
            UiOutcome::<()>::Superseded.to_json(),
            json!({"closed": true, "superseded": true})
        );
    }

    #[tokio::test]
    async fn test_close_all() {
        let managers = UiManagers::new();
        let modal = managers.modal.show("p1", ModalOptions::default());
        let dialog = managers
            .save_dialog
            .show("p1", SaveDialogRequest::default());
        let picker = managers
            .directory_picker
            .show("p1", DirectoryPickerOptions::default());
        managers.close_all();
        assert!(modal.await.is_closed());
        assert!(dialog.await.is_closed());
        assert!(picker.await.is_closed());
    }
}
