//! Several simultaneous viewers per camera, with per-camera and capacity analysis.

use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::inventory::CameraInventory;
use crate::load_test::{HarnessConfig, LoadHarness};
use crate::report::{Report, RunReport, StreamSummary, SystemResources};
use crate::stats::{mean, ratio, round1, round2, round3};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
pub struct MultiTestInfo {
    pub run_id: Uuid,
    pub target_cameras: usize,
    pub connections_per_camera: usize,
    pub total_connections: usize,
    pub test_duration: u64,
    pub actual_duration: f64,
    pub camera_selection: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatistics {
    pub total_connections_attempted: usize,
    pub successful_connections: usize,
    pub connection_success_rate: f64,
    pub total_frames_received: u64,
    pub total_bytes_received: u64,
    pub total_data_gb: f64,
    pub total_reconnections: u64,
    pub average_fps_per_connection: f64,
    pub global_fps: f64,
    pub reconnection_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraPerformance {
    pub connections_attempted: usize,
    pub successful_connections: usize,
    pub success_rate: f64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub total_reconnections: u64,
    pub avg_fps_per_connection: f64,
    pub combined_fps: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraSummary {
    pub avg_success_rate: f64,
    pub avg_fps_per_camera: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatistics {
    pub cameras_tested: usize,
    pub per_camera_analysis: BTreeMap<i64, CameraPerformance>,
    pub camera_summary: CameraSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityScenario {
    pub name: &'static str,
    pub connections_per_camera: usize,
    pub estimated_unique_cameras: usize,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringThresholds {
    pub warning: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductionRecommendations {
    pub safe_deployment: usize,
    pub target_utilization: &'static str,
    pub monitoring_thresholds: MonitoringThresholds,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityEstimate {
    pub estimated_max_connections: usize,
    pub confidence_level: ConfidenceLevel,
    pub current_utilization: f64,
    pub capacity_scenarios: Vec<CapacityScenario>,
    pub production_recommendations: ProductionRecommendations,
}

impl CapacityEstimate {
    pub fn single_viewer_cameras(&self) -> usize {
        self.estimated_max_connections
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Conservative,
    Standard,
    Aggressive,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentScenario {
    pub kind: DeploymentKind,
    pub unique_cameras: usize,
    pub description: &'static str,
    pub recommended: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecommendation {
    pub recommended_scenario: DeploymentKind,
    pub deployment_confidence: ConfidenceLevel,
    pub scenarios: Vec<DeploymentScenario>,
    pub rollout_plan: Vec<String>,
    pub scaling_bottlenecks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Grade {
    Excellent,
    Good,
    Moderate,
    Poor,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyMetrics {
    pub connection_success_rate: String,
    pub avg_fps_per_connection: String,
    pub reconnection_rate: String,
    pub total_data_processed: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiAnalysis {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_grade: Option<Grade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_metrics: Option<KeyMetrics>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiReport {
    pub multi_connection_test_info: MultiTestInfo,
    /// Absent when no connection ever reached `connected`.
    pub connection_statistics: Option<ConnectionStatistics>,
    pub camera_statistics: CameraStatistics,
    pub capacity_estimation: Option<CapacityEstimate>,
    pub deployment_recommendations: Option<DeploymentRecommendation>,
    pub analysis: MultiAnalysis,
    pub system_resources: SystemResources,
    pub individual_connections: Vec<StreamSummary>,
}

/// Runs `config.camera_count` cameras with `config.connections_per_camera`
/// viewers each. A failed harness run comes back as its error message.
pub async fn run_multi(
    config: HarnessConfig,
    inventory: Arc<dyn CameraInventory>,
    interrupt: &CancellationToken,
) -> Result<MultiReport, String> {
    let config = HarnessConfig {
        require_full_set: true,
        ..config
    };
    info!(
        "🎯 Multi-connection test: {} cameras x {} connections",
        config.camera_count, config.connections_per_camera
    );

    match LoadHarness::new(config.clone(), inventory).run(interrupt).await {
        RunReport::Completed(report) => Ok(analyze_multi(&report, &config)),
        RunReport::Failed { error } => Err(error),
    }
}

pub fn analyze_multi(report: &Report, config: &HarnessConfig) -> MultiReport {
    let connections = &report.individual_streams;
    let connection_statistics = connection_statistics(connections, report.test_info.duration_seconds);
    let camera_statistics = camera_statistics(connections);
    let capacity_estimation = connection_statistics
        .as_ref()
        .map(|stats| estimate_capacity(stats, config));
    let deployment_recommendations = connection_statistics
        .as_ref()
        .zip(capacity_estimation.as_ref())
        .map(|(stats, capacity)| recommend_deployment(stats, capacity));
    let analysis = grade_results(
        connection_statistics.as_ref(),
        capacity_estimation.as_ref(),
        config,
    );

    MultiReport {
        multi_connection_test_info: MultiTestInfo {
            run_id: report.test_info.run_id,
            target_cameras: config.camera_count,
            connections_per_camera: config.connections_per_camera,
            total_connections: config.target_concurrency(),
            test_duration: config.duration.as_secs(),
            actual_duration: report.test_info.duration_seconds,
            camera_selection: if config.shuffle { "shuffled" } else { "inventory order" },
        },
        connection_statistics,
        camera_statistics,
        capacity_estimation,
        deployment_recommendations,
        analysis,
        system_resources: report.system_resources.clone(),
        individual_connections: connections.clone(),
    }
}

fn connection_statistics(
    connections: &[StreamSummary],
    duration_seconds: f64,
) -> Option<ConnectionStatistics> {
    let successful: Vec<&StreamSummary> = connections.iter().filter(|c| c.ever_connected).collect();
    if successful.is_empty() {
        return None;
    }

    let total_frames: u64 = successful.iter().map(|c| c.total_frames).sum();
    let total_bytes: u64 = successful.iter().map(|c| c.total_bytes).sum();
    let total_reconnections: u64 = connections.iter().map(|c| u64::from(c.reconnections)).sum();
    let fps: Vec<f64> = successful.iter().map(|c| c.avg_fps).filter(|f| *f > 0.0).collect();

    Some(ConnectionStatistics {
        total_connections_attempted: connections.len(),
        successful_connections: successful.len(),
        connection_success_rate: round1(successful.len() as f64 / connections.len() as f64 * 100.0),
        total_frames_received: total_frames,
        total_bytes_received: total_bytes,
        total_data_gb: round3(total_bytes as f64 / BYTES_PER_GB),
        total_reconnections,
        average_fps_per_connection: round2(mean(&fps)),
        global_fps: round2(ratio(total_frames as f64, duration_seconds)),
        reconnection_rate: round3(total_reconnections as f64 / successful.len() as f64),
    })
}

fn camera_statistics(connections: &[StreamSummary]) -> CameraStatistics {
    let mut groups: BTreeMap<i64, Vec<&StreamSummary>> = BTreeMap::new();
    for connection in connections {
        groups.entry(connection.camera_id).or_default().push(connection);
    }

    let per_camera_analysis: BTreeMap<i64, CameraPerformance> = groups
        .into_iter()
        .map(|(camera_id, group)| {
            let successful: Vec<&&StreamSummary> = group.iter().filter(|c| c.ever_connected).collect();
            let fps: Vec<f64> = successful.iter().map(|c| c.avg_fps).filter(|f| *f > 0.0).collect();
            let performance = CameraPerformance {
                connections_attempted: group.len(),
                successful_connections: successful.len(),
                success_rate: round1(successful.len() as f64 / group.len() as f64 * 100.0),
                total_frames: successful.iter().map(|c| c.total_frames).sum(),
                total_bytes: successful.iter().map(|c| c.total_bytes).sum(),
                total_reconnections: group.iter().map(|c| u64::from(c.reconnections)).sum(),
                avg_fps_per_connection: round2(mean(&fps)),
                combined_fps: round2(successful.iter().map(|c| c.avg_fps).sum()),
            };
            (camera_id, performance)
        })
        .collect();

    let success_rates: Vec<f64> = per_camera_analysis.values().map(|c| c.success_rate).collect();
    let combined: Vec<f64> = per_camera_analysis.values().map(|c| c.combined_fps).collect();

    CameraStatistics {
        cameras_tested: per_camera_analysis.len(),
        camera_summary: CameraSummary {
            avg_success_rate: round1(mean(&success_rates)),
            avg_fps_per_camera: round2(mean(&combined)),
        },
        per_camera_analysis,
    }
}

fn estimate_capacity(stats: &ConnectionStatistics, config: &HarnessConfig) -> CapacityEstimate {
    let successful = stats.successful_connections;
    let success_rate = stats.connection_success_rate / 100.0;

    let (estimated, confidence_level) = if success_rate >= 0.95 {
        ((successful as f64 / 0.8) as usize, ConfidenceLevel::High)
    } else if success_rate >= 0.90 {
        ((successful as f64 / 0.9) as usize, ConfidenceLevel::Medium)
    } else {
        (successful, ConfidenceLevel::Low)
    };

    let scenario = |name, per_camera: usize, description: &str| CapacityScenario {
        name,
        connections_per_camera: per_camera,
        estimated_unique_cameras: estimated / per_camera,
        description: description.to_string(),
    };

    let capacity_scenarios = vec![
        scenario("single_viewer", 1, "Each camera has 1 viewer"),
        scenario("dual_viewer", 2, "Each camera has 2 viewers (monitoring + recording)"),
        scenario("multi_viewer", 4, "Each camera has 4 viewers (multiple operators)"),
        CapacityScenario {
            name: "current_test",
            connections_per_camera: config.connections_per_camera,
            estimated_unique_cameras: config.camera_count,
            description: format!(
                "Current test scenario ({} connections per camera)",
                config.connections_per_camera
            ),
        },
    ];

    CapacityEstimate {
        estimated_max_connections: estimated,
        confidence_level,
        current_utilization: round1(ratio(successful as f64, estimated as f64) * 100.0),
        capacity_scenarios,
        production_recommendations: ProductionRecommendations {
            safe_deployment: (estimated as f64 * 0.7) as usize,
            target_utilization: "70-80%",
            monitoring_thresholds: MonitoringThresholds {
                warning: (estimated as f64 * 0.8) as usize,
                critical: (estimated as f64 * 0.9) as usize,
            },
        },
    }
}

fn recommend_deployment(
    stats: &ConnectionStatistics,
    capacity: &CapacityEstimate,
) -> DeploymentRecommendation {
    let single = capacity.single_viewer_cameras();
    let scenarios = vec![
        DeploymentScenario {
            kind: DeploymentKind::Conservative,
            unique_cameras: single / 2,
            description: "Conservative deployment with 50% buffer for processing overhead",
            recommended: true,
        },
        DeploymentScenario {
            kind: DeploymentKind::Standard,
            unique_cameras: (single as f64 * 0.7) as usize,
            description: "Standard deployment with 30% buffer for processing overhead",
            recommended: true,
        },
        DeploymentScenario {
            kind: DeploymentKind::Aggressive,
            unique_cameras: (single as f64 * 0.9) as usize,
            description: "Aggressive deployment with 10% buffer - requires careful monitoring",
            recommended: false,
        },
    ];

    let rate = stats.reconnection_rate;
    let (recommended_scenario, deployment_confidence) = if rate <= 0.1 {
        (DeploymentKind::Standard, ConfidenceLevel::High)
    } else if rate <= 0.2 {
        (DeploymentKind::Conservative, ConfidenceLevel::Medium)
    } else {
        (DeploymentKind::Conservative, ConfidenceLevel::Low)
    };

    let cameras = scenarios
        .iter()
        .find(|s| s.kind == recommended_scenario)
        .map_or(0, |s| s.unique_cameras);

    let mut scaling_bottlenecks = Vec::new();
    if stats.total_data_gb > 10.0 {
        scaling_bottlenecks.push("Network bandwidth".to_string());
    }
    if stats.connection_success_rate < 95.0 {
        scaling_bottlenecks.push("Connection limits".to_string());
    }
    if rate > 0.15 {
        scaling_bottlenecks.push("Processing overhead".to_string());
    }

    DeploymentRecommendation {
        recommended_scenario,
        deployment_confidence,
        scenarios,
        rollout_plan: vec![
            format!("Phase 1: Deploy {} cameras", cameras / 2),
            format!("Phase 2: Scale to {} cameras", cameras),
            "Phase 3: Monitor and optimize before further scaling".to_string(),
        ],
        scaling_bottlenecks,
    }
}

fn grade_results(
    stats: Option<&ConnectionStatistics>,
    capacity: Option<&CapacityEstimate>,
    config: &HarnessConfig,
) -> MultiAnalysis {
    let (Some(stats), Some(capacity)) = (stats, capacity) else {
        return MultiAnalysis {
            summary: "❌ Test failed - no successful connections".to_string(),
            performance_grade: None,
            key_metrics: None,
            recommendations: Vec::new(),
        };
    };

    let success = stats.connection_success_rate;
    let rate = stats.reconnection_rate;
    let fps = stats.average_fps_per_connection;
    let cameras = config.camera_count;
    let per_camera = config.connections_per_camera;

    let (grade, summary) = if success >= 95.0 && rate <= 0.1 && fps >= 20.0 {
        (
            Grade::Excellent,
            format!(
                "✅ EXCELLENT: {} cameras x {} connections = {} total connections running stably",
                cameras,
                per_camera,
                config.target_concurrency()
            ),
        )
    } else if success >= 90.0 && rate <= 0.2 && fps >= 15.0 {
        (
            Grade::Good,
            format!(
                "✅ GOOD: {} cameras x {} connections with acceptable performance",
                cameras, per_camera
            ),
        )
    } else if success >= 80.0 && rate <= 0.4 {
        (
            Grade::Moderate,
            format!(
                "⚠️ MODERATE: {} cameras x {} connections with some stability issues",
                cameras, per_camera
            ),
        )
    } else {
        (
            Grade::Poor,
            format!(
                "❌ POOR: Significant issues with {} cameras x {} connections",
                cameras, per_camera
            ),
        )
    };

    let mut recommendations = vec![
        format!(
            "Server can handle {} total connections",
            capacity.estimated_max_connections
        ),
        format!(
            "Estimated capacity: ~{} unique cameras",
            capacity.single_viewer_cameras()
        ),
        "Monitor connection success rates and reconnection patterns in production".to_string(),
    ];
    if success < 95.0 {
        recommendations.push(format!(
            "Investigate connection failures ({:.1}% failure rate)",
            100.0 - success
        ));
    }
    if rate > 0.2 {
        recommendations
            .push("High reconnection rate indicates network or server stability issues".to_string());
    }

    MultiAnalysis {
        summary,
        performance_grade: Some(grade),
        key_metrics: Some(KeyMetrics {
            connection_success_rate: format!("{:.1}%", success),
            avg_fps_per_connection: format!("{:.1}", fps),
            reconnection_rate: format!("{:.3}", rate),
            total_data_processed: format!("{:.1} GB", stats.total_data_gb),
        }),
        recommendations,
    }
}

pub fn print_multi_summary(report: &MultiReport) {
    let info = &report.multi_connection_test_info;
    let cameras = &report.camera_statistics;
    let analysis = &report.analysis;

    println!("\n{}", "=".repeat(80));
    println!("🎯 MULTI-CONNECTION CAMERA STREAM LOAD TEST RESULTS");
    println!("{}", "=".repeat(80));

    println!("\n📊 Test Configuration:");
    println!("   Target cameras: {}", info.target_cameras);
    println!("   Connections per camera: {}", info.connections_per_camera);
    println!("   Total connections: {}", info.total_connections);
    println!("   Test duration: {}s", info.actual_duration);

    if let Some(stats) = &report.connection_statistics {
        println!("\n📈 Connection Performance:");
        println!(
            "   Successful connections: {}/{}",
            stats.successful_connections, stats.total_connections_attempted
        );
        println!("   Success rate: {}%", stats.connection_success_rate);
        println!("   Average FPS per connection: {}", stats.average_fps_per_connection);
        println!("   Global FPS: {}", stats.global_fps);
        println!("   Total data processed: {} GB", stats.total_data_gb);
        println!("   Reconnection rate: {}", stats.reconnection_rate);
    }

    println!("\n📺 Camera Performance:");
    println!("   Cameras tested: {}", cameras.cameras_tested);
    println!(
        "   Average success rate per camera: {}%",
        cameras.camera_summary.avg_success_rate
    );
    println!(
        "   Average combined FPS per camera: {}",
        cameras.camera_summary.avg_fps_per_camera
    );

    if let Some(capacity) = &report.capacity_estimation {
        println!("\n🎯 Capacity Estimation:");
        println!("   Estimated max connections: {}", capacity.estimated_max_connections);
        println!("   Current utilization: {}%", capacity.current_utilization);
        println!("   Confidence level: {:?}", capacity.confidence_level);
        println!(
            "   Safe deployment: {} connections (warning at {}, critical at {})",
            capacity.production_recommendations.safe_deployment,
            capacity.production_recommendations.monitoring_thresholds.warning,
            capacity.production_recommendations.monitoring_thresholds.critical
        );

        println!("\n📋 Unique Camera Capacity Scenarios:");
        for scenario in capacity
            .capacity_scenarios
            .iter()
            .filter(|s| s.name != "current_test")
        {
            println!(
                "   {}: ~{} cameras",
                scenario.description, scenario.estimated_unique_cameras
            );
        }
    }

    if let Some(deployment) = &report.deployment_recommendations {
        println!("\n🚀 Deployment Recommendations:");
        println!("   Recommended scenario: {:?}", deployment.recommended_scenario);
        println!("   Deployment confidence: {:?}", deployment.deployment_confidence);
        for step in &deployment.rollout_plan {
            println!("   {}", step);
        }
        if !deployment.scaling_bottlenecks.is_empty() {
            println!("   Bottlenecks: {}", deployment.scaling_bottlenecks.join(", "));
        }
    }

    println!("\n📋 Analysis:");
    println!("   {}", analysis.summary);
    if let Some(grade) = analysis.performance_grade {
        println!("   Performance grade: {:?}", grade);
    }

    if !analysis.recommendations.is_empty() {
        println!("\n💡 Recommendations:");
        for rec in &analysis.recommendations {
            println!("   - {}", rec);
        }
    }

    println!("\n{}", "=".repeat(80));
}
