//! Shared fixtures for unit tests

use crate::{
    api::{GuestContext, LogNotifier},
    bridge::{PluginHost, connect_guest},
    handlers::HandlerTable,
    manifest::{DEFAULT_ENTRY, MANIFEST_FILE},
    registry::ExtensionRegistry,
    store::PluginStore,
    ui::UiManagers,
};
use downlodr_core::{
    config::AppPaths,
    downloads::{InMemoryDownloadQueue, UnavailableMetadataEngine},
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;

/// A fully wired guest side over a store rooted in `root`
pub async fn guest_context(root: &TempDir) -> GuestContext {
    let store = Arc::new(PluginStore::open(&AppPaths::new(root.path().join("app"))).unwrap());
    let registry = Arc::new(ExtensionRegistry::new());
    let handlers = HandlerTable::new();
    registry
        .attach_invoker(Arc::new(connect_guest(handlers.clone())))
        .await;

    GuestContext {
        bridge: PluginHost::new(store, registry).spawn().await,
        handlers,
        ui: Arc::new(UiManagers::new()),
        downloads: Arc::new(InMemoryDownloadQueue::new()),
        metadata: Arc::new(UnavailableMetadataEngine),
        notifier: Arc::new(LogNotifier),
    }
}

/// Write an installable package for `id` under `parent`
pub fn write_package(parent: &Path, id: &str, version: &str, code: &str) -> PathBuf {
    let dir = parent.join(format!("{id}-{version}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join(MANIFEST_FILE),
        serde_json::json!({"id": id, "name": id.to_uppercase(), "version": version}).to_string(),
    )
    .unwrap();
    fs::write(dir.join(DEFAULT_ENTRY), code).unwrap();
    dir
}
