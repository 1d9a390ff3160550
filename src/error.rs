use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Failures local to one stream connection. These are logged, counted and
/// retried; they never leave the connection task.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connection error: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("Stream error: HTTP {0}")]
    HttpStatus(StatusCode),
    #[error("Stream error: no data received for {0:?}")]
    ReadTimeout(Duration),
    #[error("Connection error: {0}")]
    Read(#[source] reqwest::Error),
    #[error("Stream error: connection limiter closed")]
    LimiterClosed,
}

/// Setup failures that abort a run before any stream is opened.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Failed to fetch cameras: {0}")]
    Inventory(#[from] reqwest::Error),
    #[error("Camera API returned status {0}")]
    InventoryStatus(StatusCode),
    #[error("Failed to read camera inventory: {0}")]
    InventoryFile(#[from] std::io::Error),
    #[error("Invalid camera inventory: {0}")]
    InventoryFormat(#[from] serde_json::Error),
    #[error("No active cameras found")]
    NoEligibleCameras,
    #[error("Insufficient cameras: {available} < {required}")]
    InsufficientCameras { available: usize, required: usize },
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}
