use chrono::Utc;
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::frame_parser::{FrameParser, MAX_BUFFER_BYTES};
use crate::stats::GlobalCounters;
use crate::types::{lock_stats, SharedStats, StreamStats, StreamStatus, StreamTarget};

pub const MULTIPART_ACCEPT: &str = "multipart/x-mixed-replace; boundary=frame";

/// Exponential reconnect delay: 1s, x1.5 per consecutive failure, capped at 30s.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
            current: initial,
        }
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1.5, Duration::from_secs(30))
    }
}

/// Resources every connection of a run shares.
#[derive(Clone)]
pub struct StreamContext {
    pub client: Client,
    pub counters: Arc<GlobalCounters>,
    pub limiter: Arc<Semaphore>,
    pub stop: CancellationToken,
    pub read_timeout: Duration,
}

/// Drives one stream target from `starting` to `disconnected`.
pub struct StreamConnection {
    target: StreamTarget,
    stats: SharedStats,
    ctx: StreamContext,
    backoff: Backoff,
}

impl StreamConnection {
    pub fn new(target: StreamTarget, stats: SharedStats, ctx: StreamContext) -> Self {
        Self {
            target,
            stats,
            ctx,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(mut self) {
        let stop = self.ctx.stop.clone();
        let id = self.target.connection_id.clone();

        while !stop.is_cancelled() {
            self.update(|s| s.set_status(StreamStatus::Connecting));
            info!("📹 {}: Connecting to {}", id, self.target.url);

            let outcome = tokio::select! {
                _ = stop.cancelled() => break,
                outcome = self.stream_once() => outcome,
            };

            let err = match outcome {
                // Clean end of stream or stop requested mid-read.
                Ok(()) => break,
                Err(err) => err,
            };

            let message = err.to_string();
            warn!("⚠️ {}: {}", id, message);
            self.ctx.counters.record_error();
            self.update(|s| {
                s.record_error(message);
                s.set_status(StreamStatus::Error);
            });

            if stop.is_cancelled() {
                break;
            }

            let attempt = self.update(|s| {
                s.record_reconnection();
                s.reconnections
            });
            self.ctx.counters.record_reconnection();

            let delay = self.backoff.advance();
            info!(
                "🔄 {}: Reconnecting in {:.1}s (attempt #{})",
                id,
                delay.as_secs_f64(),
                attempt
            );

            tokio::select! {
                _ = stop.cancelled() => {
                    info!("{}: Reconnection cancelled", id);
                    break;
                }
                _ = sleep(delay) => {}
            }
        }

        let (frames, reconnections) = self.update(|s| {
            s.finish(Utc::now());
            (s.total_frames, s.reconnections)
        });
        info!(
            "🏁 {}: Stream ended. Frames: {}, Reconnections: {}",
            id, frames, reconnections
        );
    }

    async fn stream_once(&mut self) -> Result<(), StreamError> {
        // Held for as long as this attempt owns a socket.
        let _permit = self
            .ctx
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StreamError::LimiterClosed)?;

        let request = self
            .ctx
            .client
            .get(&self.target.url)
            .header(ACCEPT, MULTIPART_ACCEPT)
            .send();
        // The read timeout also bounds the wait for response headers.
        let response = timeout(self.ctx.read_timeout, request)
            .await
            .map_err(|_| StreamError::ReadTimeout(self.ctx.read_timeout))?
            .map_err(StreamError::Connect)?;

        if response.status() != StatusCode::OK {
            return Err(StreamError::HttpStatus(response.status()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.contains("multipart/x-mixed-replace") {
            warn!(
                "{}: Unexpected content-type: {:?}",
                self.target.connection_id, content_type
            );
        }

        self.update(|s| s.mark_connected(Utc::now()));
        self.backoff.reset();

        let mut parser = FrameParser::new();
        let mut body = response.bytes_stream();

        loop {
            let next = timeout(self.ctx.read_timeout, body.next())
                .await
                .map_err(|_| StreamError::ReadTimeout(self.ctx.read_timeout))?;

            let Some(chunk) = next else {
                debug!("{}: Server closed the stream", self.target.connection_id);
                return Ok(());
            };
            let chunk = chunk.map_err(StreamError::Read)?;

            let truncations = parser.truncations();
            let frames = parser.feed(&chunk);
            if parser.truncations() > truncations {
                debug!(
                    "{}: No boundary within {} bytes, kept the last {}",
                    self.target.connection_id,
                    MAX_BUFFER_BYTES,
                    parser.buffered()
                );
            }
            let now = Utc::now();
            self.update(|s| {
                s.record_bytes(chunk.len() as u64);
                s.record_frames(frames, now);
            });

            if self.ctx.stop.is_cancelled() {
                return Ok(());
            }
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut StreamStats) -> R) -> R {
        let mut stats = lock_stats(&self.stats);
        f(&mut stats)
    }
}
