use async_trait::async_trait;
use log::{info, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessError;
use crate::types::CameraRecord;

/// Source of camera descriptors for a run.
#[async_trait]
pub trait CameraInventory: Send + Sync {
    /// Returns every known camera; eligibility filtering is the caller's job.
    async fn fetch_cameras(&self) -> Result<Vec<CameraRecord>, HarnessError>;
}

/// Camera list served by the inventory HTTP API.
pub struct HttpInventory {
    client: Client,
    api_url: String,
}

impl HttpInventory {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, HarnessError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HarnessError::Client)?;
        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }
}

#[async_trait]
impl CameraInventory for HttpInventory {
    async fn fetch_cameras(&self) -> Result<Vec<CameraRecord>, HarnessError> {
        info!("📡 Fetching cameras from {}", self.api_url);

        let response = self.client.get(&self.api_url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(HarnessError::InventoryStatus(response.status()));
        }

        let entries: Vec<Value> = response.json().await?;
        Ok(decode_cameras(entries))
    }
}

/// Camera list read from a JSON file with the same schema as the API.
pub struct FileInventory {
    path: PathBuf,
}

impl FileInventory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CameraInventory for FileInventory {
    async fn fetch_cameras(&self) -> Result<Vec<CameraRecord>, HarnessError> {
        info!("📂 Loading cameras from {}", self.path.display());
        let raw = tokio::fs::read(&self.path).await?;
        let entries: Vec<Value> = serde_json::from_slice(&raw)?;
        Ok(decode_cameras(entries))
    }
}

/// Entries without an integer `id` are skipped with a warning; the rest of the
/// inventory is still usable.
fn decode_cameras(entries: Vec<Value>) -> Vec<CameraRecord> {
    let total = entries.len();
    let cameras: Vec<CameraRecord> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(camera) => Some(camera),
            Err(e) => {
                warn!("Skipping camera entry #{}: {}", index, e);
                None
            }
        })
        .collect();
    if cameras.len() < total {
        warn!("⚠️ Skipped {} of {} camera entries", total - cameras.len(), total);
    }
    cameras
}

/// Fixed camera list.
pub struct StaticInventory {
    cameras: Vec<CameraRecord>,
}

impl StaticInventory {
    pub fn new(cameras: Vec<CameraRecord>) -> Self {
        Self { cameras }
    }
}

#[async_trait]
impl CameraInventory for StaticInventory {
    async fn fetch_cameras(&self) -> Result<Vec<CameraRecord>, HarnessError> {
        Ok(self.cameras.clone())
    }
}
