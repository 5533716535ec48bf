//! Download collaborators
//!
//! The download engine and the persisted queue live outside the plugin
//! subsystem. Plugins only ever see them through these traits, and only
//! through the snapshot and submission methods declared here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}

/// Read-only view of a queued or running download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: String,
    pub url: String,
    pub name: String,
    /// Fraction in `0.0..=1.0`
    pub progress: f64,
    pub status: DownloadStatus,
    pub size: u64,
    pub downloaded: u64,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// What a plugin may ask the queue to download
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadOptions {
    pub name: String,
    pub download_name: Option<String>,
    pub size: Option<u64>,
    pub location: Option<String>,
    pub ext: Option<String>,
    pub format_id: Option<String>,
    pub audio_ext: Option<String>,
    pub audio_format_id: Option<String>,
    pub extractor_key: Option<String>,
    pub limit_rate: Option<String>,
    pub get_transcript: bool,
    pub get_thumbnail: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    pub id: String,
    pub name: String,
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

/// Metadata extracted for a URL by the download engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub title: String,
    pub formats: Vec<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
}

/// The persisted download queue
#[async_trait]
pub trait DownloadQueue: Send + Sync {
    /// Snapshot of downloads that are not yet finished
    async fn active_downloads(&self) -> Vec<Download>;

    /// Enqueue a download, returning its id
    async fn add(&self, url: &str, options: DownloadOptions) -> Result<String>;

    async fn cancel(&self, id: &str) -> Result<bool>;

    async fn pause(&self, id: &str) -> Result<bool>;
}

/// The external metadata/format extraction engine
#[async_trait]
pub trait MetadataEngine: Send + Sync {
    async fn get_info(&self, url: &str) -> Result<DownloadInfo>;
}

/// Queue kept in memory; used by the headless host and tests
#[derive(Debug, Default)]
pub struct InMemoryDownloadQueue {
    downloads: RwLock<Vec<Download>>,
}

impl InMemoryDownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn set_status(&self, id: &str, status: DownloadStatus) -> Result<bool> {
        let mut downloads = self.downloads.write().await;
        let download = downloads
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::DownloadNotFound(id.to_string()))?;
        if download.status == DownloadStatus::Completed {
            return Ok(false);
        }
        download.status = status;
        Ok(true)
    }
}

#[async_trait]
impl DownloadQueue for InMemoryDownloadQueue {
    async fn active_downloads(&self) -> Vec<Download> {
        self.downloads
            .read()
            .await
            .iter()
            .filter(|d| !matches!(d.status, DownloadStatus::Completed | DownloadStatus::Error))
            .cloned()
            .collect()
    }

    async fn add(&self, url: &str, options: DownloadOptions) -> Result<String> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::InvalidUrl(url.to_string()));
        }
        if options.name.trim().is_empty() {
            return Err(Error::InvalidInput("download name cannot be empty".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        self.downloads.write().await.push(Download {
            id: id.clone(),
            url: url.to_string(),
            name: options.name,
            progress: 0.0,
            status: DownloadStatus::Queued,
            size: options.size.unwrap_or(0),
            downloaded: 0,
            location: options.location.unwrap_or_default(),
            format: options.format_id,
            added_at: Utc::now(),
        });
        Ok(id)
    }

    async fn cancel(&self, id: &str) -> Result<bool> {
        self.set_status(id, DownloadStatus::Error).await
    }

    async fn pause(&self, id: &str) -> Result<bool> {
        self.set_status(id, DownloadStatus::Paused).await
    }
}

/// Engine used when no extractor is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableMetadataEngine;

#[async_trait]
impl MetadataEngine for UnavailableMetadataEngine {
    async fn get_info(&self, url: &str) -> Result<DownloadInfo> {
        Err(Error::MetadataFailed {
            url: url.to_string(),
            reason: "no metadata engine configured".to_string(),
        })
    }
}
