//! Host resource sampling correlated with live stream counts.

use anyhow::{bail, Result};
use chrono::Utc;
use log::{error, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Networks, System};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::stats::GlobalCounters;
use crate::types::{lock_stats, SharedStats, StreamStatus, SystemSample};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Samples between progress log lines.
pub const PROGRESS_EVERY: usize = 30;

/// Delay after a failed sample before trying again.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub network_bytes_sent: u64,
    pub network_bytes_recv: u64,
}

/// Reads host-wide CPU, memory and network counters.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Result<HostMetrics>;
}

pub struct SysinfoProbe {
    system: System,
    networks: Networks,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first reading.
        system.refresh_cpu_usage();
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> Result<HostMetrics> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.networks.refresh(true);

        let total_memory = self.system.total_memory();
        if total_memory == 0 {
            bail!("memory statistics unavailable");
        }
        let used_memory = self.system.used_memory();

        let (sent, recv) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(sent, recv), (_, data)| {
                (
                    sent + data.total_transmitted(),
                    recv + data.total_received(),
                )
            });

        Ok(HostMetrics {
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            memory_percent: used_memory as f64 / total_memory as f64 * 100.0,
            memory_used_bytes: used_memory,
            network_bytes_sent: sent,
            network_bytes_recv: recv,
        })
    }
}

/// Produces one `SystemSample` per interval until the stop token fires.
pub struct ResourceSampler {
    probe: Box<dyn ResourceProbe>,
    streams: Arc<[SharedStats]>,
    counters: Arc<GlobalCounters>,
    stop: CancellationToken,
    target: usize,
    interval: Duration,
    started: Instant,
}

impl ResourceSampler {
    pub fn new(
        probe: Box<dyn ResourceProbe>,
        streams: Arc<[SharedStats]>,
        counters: Arc<GlobalCounters>,
        stop: CancellationToken,
        target: usize,
    ) -> Self {
        Self {
            probe,
            streams,
            counters,
            stop,
            target,
            interval: Duration::from_secs(1),
            started: Instant::now(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(mut self) -> Vec<SystemSample> {
        let mut samples = Vec::new();

        while !self.stop.is_cancelled() {
            let wait = match self.probe.sample() {
                Ok(metrics) => {
                    let sample = self.record(metrics);
                    samples.push(sample);
                    if samples.len() % PROGRESS_EVERY == 0 {
                        self.log_progress(samples.last());
                    }
                    self.interval
                }
                Err(e) => {
                    error!("❌ Error monitoring system: {:#}", e);
                    FAILURE_BACKOFF
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        samples
    }

    fn record(&self, metrics: HostMetrics) -> SystemSample {
        let (active, frames, bytes) = stream_totals(&self.streams);
        self.counters.observe_concurrency(active);

        SystemSample {
            timestamp: Utc::now(),
            cpu_percent: metrics.cpu_percent,
            memory_percent: metrics.memory_percent,
            memory_used_gb: metrics.memory_used_bytes as f64 / BYTES_PER_GB,
            network_bytes_sent: metrics.network_bytes_sent,
            network_bytes_recv: metrics.network_bytes_recv,
            active_streams: active,
            total_frames: frames,
            total_bytes: bytes,
        }
    }

    fn log_progress(&self, sample: Option<&SystemSample>) {
        let Some(sample) = sample else { return };
        let elapsed = self.started.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            sample.total_frames as f64 / elapsed
        } else {
            0.0
        };
        info!(
            "📊 Progress: {:.0}s | Active: {}/{} | CPU: {:.1}% | RAM: {:.1}% | Total Frames: {} | Avg FPS: {:.1}",
            elapsed,
            sample.active_streams,
            self.target,
            sample.cpu_percent,
            sample.memory_percent,
            sample.total_frames,
            fps
        );
    }
}

/// Connected count plus frame and byte totals across all streams.
pub fn stream_totals(streams: &[SharedStats]) -> (usize, u64, u64) {
    streams.iter().fold((0, 0, 0), |(active, frames, bytes), stats| {
        let s = lock_stats(stats);
        let connected = usize::from(s.status == StreamStatus::Connected);
        (active + connected, frames + s.total_frames, bytes + s.total_bytes)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StreamStats, StreamTarget};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProbe {
        script: VecDeque<Result<HostMetrics>>,
    }

    impl ResourceProbe for ScriptedProbe {
        fn sample(&mut self) -> Result<HostMetrics> {
            self.script.pop_front().unwrap_or_else(|| {
                Ok(HostMetrics {
                    cpu_percent: 10.0,
                    memory_percent: 40.0,
                    memory_used_bytes: 1 << 30,
                    ..Default::default()
                })
            })
        }
    }

    fn streams(statuses: &[StreamStatus]) -> Arc<[SharedStats]> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let target = StreamTarget::new(i as i64, 1, "http://x");
                let mut stats = StreamStats::new(&target, Utc::now());
                stats.status = *status;
                stats.total_frames = 10;
                stats.total_bytes = 100;
                Arc::new(Mutex::new(stats))
            })
            .collect()
    }

    #[test]
    fn only_connected_streams_count_as_active() {
        let streams = streams(&[
            StreamStatus::Connected,
            StreamStatus::Error,
            StreamStatus::Connected,
            StreamStatus::Connecting,
        ]);
        assert_eq!(stream_totals(&streams), (2, 40, 400));
    }

    #[tokio::test]
    async fn samples_until_stopped_and_tracks_peak() {
        let streams = streams(&[StreamStatus::Connected, StreamStatus::Connected]);
        let counters = Arc::new(GlobalCounters::new());
        let stop = CancellationToken::new();
        let probe = ScriptedProbe {
            script: VecDeque::new(),
        };

        let sampler = ResourceSampler::new(Box::new(probe), streams, counters.clone(), stop.clone(), 2)
            .with_interval(Duration::from_millis(20));
        let handle = tokio::spawn(sampler.run());

        sleep(Duration::from_millis(150)).await;
        stop.cancel();
        let samples = handle.await.unwrap();

        assert!(samples.len() >= 3);
        assert!(samples.iter().all(|s| s.active_streams == 2));
        assert!((samples[0].memory_used_gb - 1.0).abs() < 1e-9);
        assert_eq!(counters.snapshot().max_concurrent_achieved, 2);
    }

    #[tokio::test]
    async fn probe_failure_backs_off_without_ending() {
        let streams = streams(&[StreamStatus::Connected]);
        let stop = CancellationToken::new();
        let probe = ScriptedProbe {
            script: VecDeque::from([Err(anyhow::anyhow!("probe offline"))]),
        };

        let sampler = ResourceSampler::new(
            Box::new(probe),
            streams,
            Arc::new(GlobalCounters::new()),
            stop.clone(),
            1,
        );
        let handle = tokio::spawn(sampler.run());

        sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        stop.cancel();
        // The failure backoff sleep is cancellable.
        let samples = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn sysinfo_probe_reports_memory() {
        let mut probe = SysinfoProbe::new();
        let metrics = probe.sample().unwrap();
        assert!(metrics.memory_percent > 0.0 && metrics.memory_percent <= 100.0);
        assert!(metrics.memory_used_bytes > 0);
    }
}
