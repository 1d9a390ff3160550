use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1/camera/";

/// Process-wide settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: String,
    pub reports_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub inventory_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            reports_dir: PathBuf::from("reports"),
            logs_dir: PathBuf::from("logs"),
            read_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            inventory_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => {
                    let value: u64 = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("{} must be a whole number of seconds, got {:?}", key, raw))?;
                    Ok(Duration::from_secs(value))
                }
                None => Ok(default),
            }
        };

        Ok(Self {
            api_url: lookup("CAMERA_API_URL").unwrap_or(defaults.api_url),
            reports_dir: lookup("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            logs_dir: lookup("LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.logs_dir),
            read_timeout: secs("STREAM_READ_TIMEOUT_SECS", defaults.read_timeout)?,
            connect_timeout: secs("STREAM_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            inventory_timeout: secs("INVENTORY_TIMEOUT_SECS", defaults.inventory_timeout)?,
            shutdown_grace: secs("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
        })
    }
}
