//! Reduction of a finished run into its report, plus persistence.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::stats::{mean, median, peak, ratio, round2, FrameIntervalStats, IntervalAggregator};
use crate::types::{StreamStats, StreamStatus, SystemSample};

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub test_info: TestInfo,
    pub stream_performance: StreamPerformance,
    pub stream_status: BTreeMap<StreamStatus, usize>,
    pub system_resources: SystemResources,
    pub individual_streams: Vec<StreamSummary>,
    pub analysis: Analysis,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestInfo {
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub max_concurrent_target: usize,
    pub max_concurrent_achieved: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamPerformance {
    pub total_streams_attempted: usize,
    pub total_frames_received: u64,
    pub total_bytes_received: u64,
    pub total_reconnections: u64,
    pub total_errors: u64,
    pub average_fps: f64,
    pub median_fps: f64,
    pub bytes_per_second: f64,
    pub frames_per_second_global: f64,
    pub frame_interval_ms: FrameIntervalStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemResources {
    pub samples: usize,
    pub average_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub average_memory_percent: f64,
    pub peak_memory_percent: f64,
    pub peak_memory_used_gb: f64,
    pub network_bytes_sent: u64,
    pub network_bytes_recv: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub connection_id: String,
    pub camera_id: i64,
    pub connection_number: u32,
    pub fr_url: String,
    pub status: StreamStatus,
    pub ever_connected: bool,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub reconnections: u32,
    pub avg_fps: f64,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
    pub errors_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Excellent,
    Good,
    Moderate,
    Poor,
}

impl PerformanceTier {
    pub fn from_achievement(ratio: f64) -> Self {
        if ratio >= 0.9 {
            PerformanceTier::Excellent
        } else if ratio >= 0.7 {
            PerformanceTier::Good
        } else if ratio >= 0.5 {
            PerformanceTier::Moderate
        } else {
            PerformanceTier::Poor
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub tier: PerformanceTier,
    pub achievement_rate: f64,
    pub summary: String,
    pub capacity_assessment: String,
    pub issues_found: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Result of one harness invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RunReport {
    Completed(Box<Report>),
    Failed { error: String },
}

impl RunReport {
    pub fn failed(error: impl ToString) -> Self {
        RunReport::Failed {
            error: error.to_string(),
        }
    }

    pub fn completed(&self) -> Option<&Report> {
        match self {
            RunReport::Completed(report) => Some(report),
            RunReport::Failed { .. } => None,
        }
    }
}

/// Everything the aggregator needs from a finished run.
pub struct ReportInput<'a> {
    pub run_id: Uuid,
    pub target_concurrency: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub streams: &'a [StreamStats],
    pub samples: &'a [SystemSample],
}

pub fn build_report(input: &ReportInput<'_>) -> Report {
    let duration = (input.ended_at - input.started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let streams = input.streams;

    let total_frames: u64 = streams.iter().map(|s| s.total_frames).sum();
    let total_bytes: u64 = streams.iter().map(|s| s.total_bytes).sum();
    let total_reconnections: u64 = streams.iter().map(|s| u64::from(s.reconnections)).sum();
    let total_errors: u64 = streams.iter().map(StreamStats::error_count).sum();

    // Streams that never produced a frame stay in the totals but not the FPS figures.
    let fps_values: Vec<f64> = streams
        .iter()
        .map(|s| s.avg_fps)
        .filter(|fps| *fps > 0.0)
        .collect();
    let average_fps = mean(&fps_values);

    let mut intervals = IntervalAggregator::new();
    for histogram in streams.iter().filter_map(|s| s.frame_intervals.as_ref()) {
        intervals.merge(histogram);
    }

    let mut stream_status = BTreeMap::new();
    for stream in streams {
        *stream_status.entry(stream.status).or_insert(0) += 1;
    }

    let max_concurrent_achieved = input
        .samples
        .iter()
        .map(|s| s.active_streams)
        .max()
        .unwrap_or(0)
        .min(input.target_concurrency);

    let analysis = analyze(
        input.target_concurrency,
        max_concurrent_achieved,
        average_fps,
        total_errors,
        total_reconnections,
    );

    Report {
        test_info: TestInfo {
            run_id: input.run_id,
            start_time: input.started_at,
            end_time: input.ended_at,
            duration_seconds: round2(duration),
            max_concurrent_target: input.target_concurrency,
            max_concurrent_achieved,
        },
        stream_performance: StreamPerformance {
            total_streams_attempted: streams.len(),
            total_frames_received: total_frames,
            total_bytes_received: total_bytes,
            total_reconnections,
            total_errors,
            average_fps: round2(average_fps),
            median_fps: round2(median(&fps_values)),
            bytes_per_second: round2(ratio(total_bytes as f64, duration)),
            frames_per_second_global: round2(ratio(total_frames as f64, duration)),
            frame_interval_ms: intervals.summary(),
        },
        stream_status,
        system_resources: summarize_resources(input.samples),
        individual_streams: streams
            .iter()
            .map(|s| StreamSummary {
                connection_id: s.connection_id.clone(),
                camera_id: s.camera_id,
                connection_number: s.connection_number,
                fr_url: s.url.clone(),
                status: s.status,
                ever_connected: s.first_connected_at.is_some(),
                total_frames: s.total_frames,
                total_bytes: s.total_bytes,
                reconnections: s.reconnections,
                avg_fps: round2(s.avg_fps),
                duration_seconds: round2(s.duration_seconds(input.ended_at)),
                errors: s.errors.iter().cloned().collect(),
                errors_dropped: s.errors_dropped,
            })
            .collect(),
        analysis,
    }
}

fn summarize_resources(samples: &[SystemSample]) -> SystemResources {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return SystemResources::default();
    };
    let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_percent).collect();
    let memory: Vec<f64> = samples.iter().map(|s| s.memory_percent).collect();

    SystemResources {
        samples: samples.len(),
        average_cpu_percent: round2(mean(&cpu)),
        peak_cpu_percent: round2(peak(cpu.iter().copied())),
        average_memory_percent: round2(mean(&memory)),
        peak_memory_percent: round2(peak(memory.iter().copied())),
        peak_memory_used_gb: round2(peak(samples.iter().map(|s| s.memory_used_gb))),
        network_bytes_sent: last.network_bytes_sent.saturating_sub(first.network_bytes_sent),
        network_bytes_recv: last.network_bytes_recv.saturating_sub(first.network_bytes_recv),
    }
}

pub fn analyze(
    target: usize,
    achieved: usize,
    average_fps: f64,
    total_errors: u64,
    total_reconnections: u64,
) -> Analysis {
    let achievement_rate = ratio(achieved as f64, target as f64);
    let tier = PerformanceTier::from_achievement(achievement_rate);

    let summary = match tier {
        PerformanceTier::Excellent => format!(
            "EXCELLENT: Successfully handled {}/{} concurrent streams",
            achieved, target
        ),
        PerformanceTier::Good => format!(
            "GOOD: Handled {}/{} concurrent streams with some limitations",
            achieved, target
        ),
        PerformanceTier::Moderate => {
            format!("MODERATE: Only {}/{} streams successful", achieved, target)
        }
        PerformanceTier::Poor => format!("POOR: Only {}/{} streams successful", achieved, target),
    };

    let capacity_assessment = if average_fps >= 20.0 {
        "High performance - suitable for real-time monitoring"
    } else if average_fps >= 10.0 {
        "Moderate performance - acceptable for most use cases"
    } else if average_fps >= 5.0 {
        "Low performance - may impact monitoring quality"
    } else {
        "Very low performance - not suitable for production"
    };

    let mut issues_found = Vec::new();
    let mut recommendations = Vec::new();
    let target_f = target as f64;

    if total_errors as f64 > target_f * 0.1 {
        issues_found.push(format!("High error rate: {} errors across streams", total_errors));
        recommendations.push("Investigate network stability and server capacity".to_string());
    }
    if total_reconnections as f64 > target_f {
        issues_found.push(format!("Frequent reconnections: {} total", total_reconnections));
        recommendations.push("Check stream server stability and network conditions".to_string());
    }
    if (achieved as f64) < target_f * 0.8 {
        issues_found.push("Could not achieve target concurrent stream count".to_string());
        recommendations
            .push("Consider increasing server resources or reducing stream quality".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("System performed well within tested parameters".to_string());
    }

    Analysis {
        tier,
        achievement_rate: round2(achievement_rate),
        summary,
        capacity_assessment: capacity_assessment.to_string(),
        issues_found,
        recommendations,
    }
}

/// Writes `report` as pretty JSON and returns the path used.
///
/// Without `filename` the file is `<reports_dir>/<stem>_<timestamp>.json`. A
/// bare filename is placed under `reports_dir`; a path with a directory
/// component is used as given, creating that directory.
pub fn save_report<T: Serialize>(
    report: &T,
    reports_dir: &Path,
    filename: Option<&Path>,
    stem: &str,
) -> Result<PathBuf> {
    let path = match filename {
        None => reports_dir.join(format!(
            "{}_{}.json",
            stem,
            Local::now().format("%Y%m%d_%H%M%S")
        )),
        Some(name) if name.parent().map_or(true, |p| p.as_os_str().is_empty()) => {
            reports_dir.join(name)
        }
        Some(name) => name.to_path_buf(),
    };

    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
    }

    let payload = serde_json::to_vec_pretty(report)?;
    fs::write(&path, payload)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    Ok(path)
}

pub fn print_summary(report: &Report) {
    let info = &report.test_info;
    let perf = &report.stream_performance;
    let resources = &report.system_resources;
    let analysis = &report.analysis;

    println!("\n{}", "=".repeat(80));
    println!("CAMERA STREAM LOAD TEST RESULTS");
    println!("{}", "=".repeat(80));

    println!("\n📊 Test Overview:");
    println!("   Duration: {}s", info.duration_seconds);
    println!("   Target concurrent streams: {}", info.max_concurrent_target);
    println!("   Achieved concurrent streams: {}", info.max_concurrent_achieved);

    println!("\n📈 Performance Metrics:");
    println!("   Total frames received: {}", perf.total_frames_received);
    println!(
        "   Total data received: {:.1} MB",
        perf.total_bytes_received as f64 / (1024.0 * 1024.0)
    );
    println!("   Average FPS per stream: {}", perf.average_fps);
    println!("   Global FPS: {}", perf.frames_per_second_global);
    println!(
        "   Frame interval p50/p95/p99: {}/{}/{} ms",
        perf.frame_interval_ms.p50_ms, perf.frame_interval_ms.p95_ms, perf.frame_interval_ms.p99_ms
    );
    println!("   Total reconnections: {}", perf.total_reconnections);

    println!("\n🖥️  System Resources:");
    println!("   Peak CPU usage: {}%", resources.peak_cpu_percent);
    println!("   Peak memory usage: {}%", resources.peak_memory_percent);

    println!("\n📋 Analysis:");
    println!("   {}", analysis.summary);
    println!("   {}", analysis.capacity_assessment);

    if !analysis.issues_found.is_empty() {
        println!("\n⚠️  Issues Found:");
        for issue in &analysis.issues_found {
            println!("   - {}", issue);
        }
    }

    println!("\n💡 Recommendations:");
    for rec in &analysis.recommendations {
        println!("   - {}", rec);
    }

    let reconnecting: Vec<_> = report
        .individual_streams
        .iter()
        .filter(|s| s.reconnections > 0)
        .collect();
    if reconnecting.is_empty() {
        println!("\n✅ No reconnections needed - all streams stable!");
    } else {
        println!("\n🔄 Streams with reconnections:");
        for stream in reconnecting {
            println!("   {}: {} reconnections", stream.connection_id, stream.reconnections);
        }
    }

    println!("\n{}", "=".repeat(80));
}
