use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Per-connection error log capacity; older entries are dropped and counted.
pub const MAX_ERROR_LOG: usize = 50;

/// Upper bound for recorded inter-frame intervals, in milliseconds.
pub const MAX_FRAME_INTERVAL_MS: u64 = 60_000;

/// One descriptor as returned by the camera inventory API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraRecord {
    pub id: i64,
    #[serde(default, deserialize_with = "integer_or_none")]
    pub status: Option<i64>,
    #[serde(rename = "fr_url", default, deserialize_with = "string_or_none")]
    pub stream_url: Option<String>,
}

/// Reads any JSON value, keeping it only when it is an integer.
fn integer_or_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(serde_json::Value::deserialize(deserializer)?.as_i64())
}

fn string_or_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(value) => Some(value),
        _ => None,
    })
}

impl CameraRecord {
    pub fn is_eligible(&self) -> bool {
        self.status == Some(1)
            && self
                .stream_url
                .as_deref()
                .is_some_and(|url| !url.trim().is_empty())
    }
}

/// A single connection to open: one camera, one viewer slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub connection_id: String,
    pub camera_id: i64,
    pub connection_number: u32,
    pub url: String,
}

impl StreamTarget {
    pub fn new(camera_id: i64, connection_number: u32, url: impl Into<String>) -> Self {
        Self {
            connection_id: format!("camera_{}_conn_{}", camera_id, connection_number),
            camera_id,
            connection_number,
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Starting,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamStatus::Starting => "starting",
            StreamStatus::Connecting => "connecting",
            StreamStatus::Connected => "connected",
            StreamStatus::Error => "error",
            StreamStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Live record of one stream connection.
///
/// Mutated only by the owning connection task; the sampler reads it while the
/// run is in progress and the aggregator reads it after every task has joined.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub connection_id: String,
    pub camera_id: i64,
    pub connection_number: u32,
    pub url: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub first_connected_at: Option<DateTime<Utc>>,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub reconnections: u32,
    pub errors: VecDeque<String>,
    pub errors_dropped: u64,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub avg_fps: f64,
    pub status: StreamStatus,
    /// Absent only if the histogram could not be allocated.
    pub frame_intervals: Option<Histogram<u64>>,
}

impl StreamStats {
    pub fn new(target: &StreamTarget, start_time: DateTime<Utc>) -> Self {
        Self {
            connection_id: target.connection_id.clone(),
            camera_id: target.camera_id,
            connection_number: target.connection_number,
            url: target.url.clone(),
            start_time,
            end_time: None,
            first_connected_at: None,
            total_frames: 0,
            total_bytes: 0,
            reconnections: 0,
            errors: VecDeque::new(),
            errors_dropped: 0,
            last_frame_time: None,
            avg_fps: 0.0,
            status: StreamStatus::Starting,
            frame_intervals: frame_interval_histogram(),
        }
    }

    /// Status changes are ignored once the record is finished.
    pub fn set_status(&mut self, status: StreamStatus) {
        if self.end_time.is_none() {
            self.status = status;
        }
    }

    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        self.set_status(StreamStatus::Connected);
        self.first_connected_at.get_or_insert(now);
        self.last_frame_time = Some(now);
    }

    pub fn record_bytes(&mut self, bytes: u64) {
        self.total_bytes += bytes;
    }

    pub fn record_frames(&mut self, frames: u64, now: DateTime<Utc>) {
        if frames == 0 {
            return;
        }
        self.total_frames += frames;

        if let (Some(last), Some(intervals)) = (self.last_frame_time, self.frame_intervals.as_mut()) {
            let gap_ms = (now - last).num_milliseconds().max(0) as u64;
            intervals.saturating_record_n(gap_ms / frames, frames);
        }
        self.last_frame_time = Some(now);

        let elapsed = seconds_between(self.start_time, now);
        if elapsed > 0.0 {
            self.avg_fps = self.total_frames as f64 / elapsed;
        }
    }

    pub fn record_error(&mut self, message: String) {
        if self.errors.len() == MAX_ERROR_LOG {
            self.errors.pop_front();
            self.errors_dropped += 1;
        }
        self.errors.push_back(message);
    }

    pub fn record_reconnection(&mut self) {
        self.reconnections += 1;
    }

    /// Moves the record to its terminal state. The first call wins.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        if self.end_time.is_none() {
            self.status = StreamStatus::Disconnected;
            self.end_time = Some(now);
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors.len() as u64 + self.errors_dropped
    }

    pub fn duration_seconds(&self, run_end: DateTime<Utc>) -> f64 {
        seconds_between(self.start_time, self.end_time.unwrap_or(run_end))
    }
}

/// Connection record shared between its task, the sampler and the harness.
pub type SharedStats = Arc<Mutex<StreamStats>>;

pub fn lock_stats(stats: &SharedStats) -> MutexGuard<'_, StreamStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One tick of the resource sampler.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_gb: f64,
    pub network_bytes_sent: u64,
    pub network_bytes_recv: u64,
    pub active_streams: usize,
    pub total_frames: u64,
    pub total_bytes: u64,
}

pub fn frame_interval_histogram() -> Option<Histogram<u64>> {
    match Histogram::<u64>::new_with_bounds(1, MAX_FRAME_INTERVAL_MS, 3) {
        Ok(histogram) => Some(histogram),
        Err(e) => {
            warn!("Frame intervals will not be recorded: {}", e);
            None
        }
    }
}

pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}
