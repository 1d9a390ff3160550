//! Repeated harness runs that look for the highest stable concurrency.

use async_trait::async_trait;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::inventory::CameraInventory;
use crate::load_test::{HarnessConfig, LoadHarness};
use crate::report::RunReport;
use crate::stats::{mean, round2, round3};

pub const DEFAULT_STABILITY_THRESHOLD: f64 = 0.1;

/// Hard cap on binary search iterations, whatever the range.
pub const MAX_SEARCH_ITERATIONS: usize = 12;

/// Share of the target that must be reached for a run to count as stable.
const REQUIRED_ACHIEVEMENT: f64 = 0.9;

const PRODUCTION_HEADROOM: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stability {
    pub target: usize,
    pub achieved: usize,
    pub total_reconnections: u64,
    /// Reconnections per achieved stream; infinite when nothing connected.
    pub reconnection_rate: f64,
    pub stable: bool,
}

pub fn assess_stability(
    target: usize,
    achieved: usize,
    total_reconnections: u64,
    threshold: f64,
) -> Stability {
    let reconnection_rate = if achieved > 0 {
        total_reconnections as f64 / achieved as f64
    } else {
        f64::INFINITY
    };
    let stable = achieved > 0
        && achieved as f64 >= target as f64 * REQUIRED_ACHIEVEMENT
        && reconnection_rate <= threshold;

    Stability {
        target,
        achieved,
        total_reconnections,
        reconnection_rate,
        stable,
    }
}

/// Runs one load test at a given concurrency.
#[async_trait]
pub trait LoadRunner: Send + Sync {
    async fn run_at(&self, target: usize) -> RunReport;
}

/// Builds a fresh harness per iteration from a template configuration.
pub struct HarnessRunner {
    template: HarnessConfig,
    inventory: Arc<dyn CameraInventory>,
    interrupt: CancellationToken,
}

impl HarnessRunner {
    pub fn new(
        template: HarnessConfig,
        inventory: Arc<dyn CameraInventory>,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            template,
            inventory,
            interrupt,
        }
    }
}

#[async_trait]
impl LoadRunner for HarnessRunner {
    async fn run_at(&self, target: usize) -> RunReport {
        let config = HarnessConfig {
            camera_count: target,
            ..self.template.clone()
        };
        LoadHarness::new(config, self.inventory.clone())
            .run(&self.interrupt)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Bisect [1, initial_max].
    Binary,
    /// Walk down from initial_max until the first stable run.
    StepDown,
}

/// Chooses the next target from the outcomes seen so far.
pub trait SearchPolicy: Send {
    fn next_target(&self) -> Option<usize>;

    /// `None` means the run failed before producing a report.
    fn record(&mut self, target: usize, outcome: Option<&Stability>);
}

#[derive(Debug, Clone)]
pub struct BinarySearch {
    low: usize,
    high: usize,
    best: usize,
    iterations: usize,
    max_iterations: usize,
}

impl BinarySearch {
    pub fn new(initial_max: usize) -> Self {
        Self {
            low: 1,
            high: initial_max,
            best: 0,
            iterations: 0,
            max_iterations: MAX_SEARCH_ITERATIONS,
        }
    }
}

impl SearchPolicy for BinarySearch {
    fn next_target(&self) -> Option<usize> {
        if self.iterations >= self.max_iterations || self.low > self.high {
            return None;
        }
        Some(self.low + (self.high - self.low) / 2)
    }

    fn record(&mut self, target: usize, outcome: Option<&Stability>) {
        self.iterations += 1;
        match outcome {
            Some(stability) if stability.stable => {
                self.best = self.best.max(stability.achieved);
                self.low = target + 1;
                info!("   🎯 New stable maximum: {}", self.best);
            }
            _ => self.high = target.saturating_sub(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepDown {
    initial_max: usize,
    current: usize,
    step: usize,
    found: bool,
}

impl StepDown {
    pub fn new(initial_max: usize) -> Self {
        Self {
            initial_max,
            current: initial_max,
            step: (initial_max / 10).max(10),
            found: false,
        }
    }
}

impl SearchPolicy for StepDown {
    fn next_target(&self) -> Option<usize> {
        (!self.found && self.current > 0).then_some(self.current)
    }

    fn record(&mut self, target: usize, outcome: Option<&Stability>) {
        if outcome.map_or(false, |s| s.stable) {
            self.found = true;
            return;
        }
        self.current = target.saturating_sub(self.step);
        if self.current < self.initial_max / 4 {
            self.step = (self.step / 2).max(5);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub initial_max: usize,
    pub duration: Duration,
    pub threshold: f64,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchIteration {
    pub iteration: usize,
    pub stream_count: usize,
    pub achieved_streams: usize,
    pub total_reconnections: u64,
    /// Absent when no stream connected.
    pub reconnection_rate: Option<f64>,
    pub is_stable: bool,
    pub avg_fps: f64,
    pub test_duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The run was cut short by an interrupt; its figures are partial.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

impl SearchIteration {
    fn from_report(iteration: usize, target: usize, report: &RunReport, threshold: f64) -> (Self, Option<Stability>) {
        match report {
            RunReport::Completed(report) => {
                let stability = assess_stability(
                    target,
                    report.test_info.max_concurrent_achieved,
                    report.stream_performance.total_reconnections,
                    threshold,
                );
                let entry = Self {
                    iteration,
                    stream_count: target,
                    achieved_streams: stability.achieved,
                    total_reconnections: stability.total_reconnections,
                    reconnection_rate: stability
                        .reconnection_rate
                        .is_finite()
                        .then_some(round3(stability.reconnection_rate)),
                    is_stable: stability.stable,
                    avg_fps: report.stream_performance.average_fps,
                    test_duration: report.test_info.duration_seconds,
                    error: None,
                    interrupted: false,
                };
                (entry, Some(stability))
            }
            RunReport::Failed { error } => {
                let entry = Self {
                    iteration,
                    stream_count: target,
                    achieved_streams: 0,
                    total_reconnections: 0,
                    reconnection_rate: None,
                    is_stable: false,
                    avg_fps: 0.0,
                    test_duration: 0.0,
                    error: Some(error.clone()),
                    interrupted: false,
                };
                (entry, None)
            }
        }
    }

    /// Stable over a full-length run.
    pub fn counts_as_stable(&self) -> bool {
        self.is_stable && !self.interrupted
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchInfo {
    pub strategy: Strategy,
    pub total_iterations: usize,
    pub initial_max_target: usize,
    pub test_duration_per_iteration: u64,
    pub stability_threshold: f64,
    pub maximum_stable_streams: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResults {
    pub recommended_max_streams: usize,
    pub production_limit: usize,
    pub confidence_level: Confidence,
    pub stability_verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceCharacteristics {
    pub max_stable_streams: usize,
    pub avg_fps_at_stable: f64,
    pub avg_reconnection_rate: f64,
    pub stability_range: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchAnalysis {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_characteristics: Option<PerformanceCharacteristics>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub adaptive_test_info: SearchInfo,
    pub optimization_results: OptimizationResults,
    pub all_test_iterations: Vec<SearchIteration>,
    pub best_stable_configuration: Option<SearchIteration>,
    pub analysis: SearchAnalysis,
}

/// Drives `runner` with the configured strategy. An interrupt ends the
/// search once the iteration in flight has reported.
pub async fn run_search(
    runner: &dyn LoadRunner,
    settings: &SearchSettings,
    interrupt: &CancellationToken,
) -> SearchReport {
    let mut policy: Box<dyn SearchPolicy> = match settings.strategy {
        Strategy::Binary => Box::new(BinarySearch::new(settings.initial_max)),
        Strategy::StepDown => Box::new(StepDown::new(settings.initial_max)),
    };

    let mut iterations = Vec::new();
    let mut interrupted = false;

    while let Some(target) = policy.next_target() {
        let number = iterations.len() + 1;
        info!("{}", "=".repeat(60));
        info!(
            "ITERATION {}: Testing {} concurrent streams ({}s, stability threshold {})",
            number,
            target,
            settings.duration.as_secs(),
            settings.threshold
        );
        info!("{}", "=".repeat(60));

        let report = runner.run_at(target).await;
        let (mut entry, stability) =
            SearchIteration::from_report(number, target, &report, settings.threshold);
        entry.interrupted = interrupt.is_cancelled();

        match (&entry.error, &stability) {
            (Some(error), _) => error!("❌ Iteration {} failed: {}", number, error),
            (None, Some(s)) => info!(
                "Result: {} | Target: {} | Achieved: {} | Reconnections: {} (rate: {:.3}) | Average FPS: {:.2}",
                if s.stable { "✅ STABLE" } else { "❌ UNSTABLE" },
                s.target,
                s.achieved,
                s.total_reconnections,
                s.reconnection_rate,
                entry.avg_fps
            ),
            (None, None) => {}
        }

        if entry.interrupted {
            warn!(
                "⏹️ Search interrupted during iteration {}, its result is not used",
                number
            );
            iterations.push(entry);
            interrupted = true;
            break;
        }

        policy.record(target, stability.as_ref());
        iterations.push(entry);
    }

    build_search_report(settings, iterations, interrupted)
}

pub fn build_search_report(
    settings: &SearchSettings,
    iterations: Vec<SearchIteration>,
    interrupted: bool,
) -> SearchReport {
    let best = iterations
        .iter()
        .filter(|i| i.counts_as_stable())
        .max_by_key(|i| i.achieved_streams)
        .cloned();
    let best_count = best.as_ref().map_or(0, |b| b.achieved_streams);
    let stable_runs = iterations.iter().filter(|i| i.counts_as_stable()).count();

    SearchReport {
        adaptive_test_info: SearchInfo {
            strategy: settings.strategy,
            total_iterations: iterations.len(),
            initial_max_target: settings.initial_max,
            test_duration_per_iteration: settings.duration.as_secs(),
            stability_threshold: settings.threshold,
            maximum_stable_streams: best_count,
            interrupted,
        },
        optimization_results: OptimizationResults {
            recommended_max_streams: best_count,
            production_limit: production_limit(best_count),
            confidence_level: if stable_runs >= 3 {
                Confidence::High
            } else {
                Confidence::Medium
            },
            stability_verified: best.is_some(),
        },
        analysis: analyze_search(&iterations, best_count),
        all_test_iterations: iterations,
        best_stable_configuration: best,
    }
}

pub fn production_limit(best: usize) -> usize {
    ((best as f64 * PRODUCTION_HEADROOM) as usize).max(1)
}

fn analyze_search(iterations: &[SearchIteration], best: usize) -> SearchAnalysis {
    if best == 0 {
        return SearchAnalysis {
            summary: "❌ Unable to find stable configuration - system may be overloaded".to_string(),
            performance_characteristics: None,
            recommendations: vec![
                "Check network connectivity and server capacity".to_string(),
                "Try reducing initial test parameters".to_string(),
                "Consider testing during off-peak hours".to_string(),
            ],
        };
    }

    let (stable, unstable): (Vec<_>, Vec<_>) = iterations
        .iter()
        .filter(|i| !i.interrupted)
        .partition(|i| i.is_stable);
    let fps: Vec<f64> = stable.iter().map(|i| i.avg_fps).collect();
    let rates: Vec<f64> = stable.iter().filter_map(|i| i.reconnection_rate).collect();

    let summary = if best >= 50 {
        format!("✅ EXCELLENT: System can handle {} concurrent streams stably", best)
    } else if best >= 20 {
        format!("✅ GOOD: System can handle {} concurrent streams stably", best)
    } else if best >= 10 {
        format!("⚠️ MODERATE: System can handle {} concurrent streams stably", best)
    } else {
        format!("❌ LIMITED: System can only handle {} concurrent streams stably", best)
    };

    let mut recommendations = Vec::new();
    if let Some(first_unstable) = unstable.iter().map(|i| i.stream_count).min() {
        recommendations.push(format!(
            "Stay below {} streams to maintain stability",
            first_unstable
        ));
    }
    recommendations.push(format!(
        "Recommended production limit: {} streams (80% of max)",
        production_limit(best)
    ));
    recommendations.push("Monitor system resources during production use".to_string());
    recommendations.push("Implement gradual stream scaling in production".to_string());

    SearchAnalysis {
        summary,
        performance_characteristics: Some(PerformanceCharacteristics {
            max_stable_streams: best,
            avg_fps_at_stable: round2(mean(&fps)),
            avg_reconnection_rate: round3(mean(&rates)),
            stability_range: format!("1-{} streams", best),
        }),
        recommendations,
    }
}

pub fn print_search_summary(report: &SearchReport) {
    let info = &report.adaptive_test_info;
    let results = &report.optimization_results;
    let analysis = &report.analysis;

    println!("\n{}", "=".repeat(80));
    println!("🎯 ADAPTIVE CAMERA STREAM LOAD TEST RESULTS");
    println!("{}", "=".repeat(80));

    println!("\n📊 Optimization Process:");
    println!("   Strategy: {:?}", info.strategy);
    println!("   Total test iterations: {}", info.total_iterations);
    println!("   Duration per test: {}s", info.test_duration_per_iteration);
    println!("   Stability threshold: {}", info.stability_threshold);
    if info.interrupted {
        println!("   ⏹️ Search was interrupted before it converged");
    }

    println!("\n🎯 Results:");
    println!("   Maximum stable concurrent streams: {}", info.maximum_stable_streams);
    println!("   Recommended production limit: {}", results.production_limit);
    println!("   Confidence level: {:?}", results.confidence_level);

    if let Some(perf) = &analysis.performance_characteristics {
        println!("\n📈 Performance at Maximum:");
        println!("   Average FPS per stream: {}", perf.avg_fps_at_stable);
        println!("   Average reconnection rate: {}", perf.avg_reconnection_rate);
        println!("   Stable range: {}", perf.stability_range);
    }

    println!("\n🔁 Iterations:");
    for it in &report.all_test_iterations {
        match &it.error {
            Some(error) => println!("   #{} {} streams: failed ({})", it.iteration, it.stream_count, error),
            None => println!(
                "   #{} {} streams: achieved {}, {} reconnections, {}",
                it.iteration,
                it.stream_count,
                it.achieved_streams,
                it.total_reconnections,
                if it.interrupted {
                    "interrupted"
                } else if it.is_stable {
                    "stable"
                } else {
                    "unstable"
                }
            ),
        }
    }

    println!("\n📋 Analysis:");
    println!("   {}", analysis.summary);

    if !analysis.recommendations.is_empty() {
        println!("\n💡 Recommendations:");
        for rec in &analysis.recommendations {
            println!("   - {}", rec);
        }
    }

    println!("\n{}", "=".repeat(80));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{build_report, ReportInput};
    use crate::types::SystemSample;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Builds a completed report with the given achieved count and reconnections.
    fn completed(target: usize, achieved: usize, reconnections: u64) -> RunReport {
        let start = Utc::now();
        let samples = vec![SystemSample {
            timestamp: start,
            cpu_percent: 10.0,
            memory_percent: 20.0,
            memory_used_gb: 1.0,
            network_bytes_sent: 0,
            network_bytes_recv: 0,
            active_streams: achieved,
            total_frames: 0,
            total_bytes: 0,
        }];
        let mut report = build_report(&ReportInput {
            run_id: Uuid::new_v4(),
            target_concurrency: target,
            started_at: start,
            ended_at: start + chrono::Duration::seconds(10),
            streams: &[],
            samples: &samples,
        });
        report.stream_performance.total_reconnections = reconnections;
        report.stream_performance.average_fps = 12.0;
        RunReport::Completed(Box::new(report))
    }

    /// Stable up to `limit` streams, half-achieved above it.
    struct CapacityRunner {
        limit: usize,
        targets: Mutex<Vec<usize>>,
        fail_above: Option<usize>,
        /// Cancels the token while serving the n-th run (1-based).
        interrupt_on_run: Option<(usize, CancellationToken)>,
    }

    impl CapacityRunner {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                targets: Mutex::new(Vec::new()),
                fail_above: None,
                interrupt_on_run: None,
            }
        }

        fn targets(&self) -> Vec<usize> {
            self.targets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LoadRunner for CapacityRunner {
        async fn run_at(&self, target: usize) -> RunReport {
            let run = {
                let mut targets = self.targets.lock().unwrap();
                targets.push(target);
                targets.len()
            };
            if let Some((n, token)) = &self.interrupt_on_run {
                if run == *n {
                    token.cancel();
                }
            }
            if self.fail_above.map_or(false, |limit| target > limit) {
                return RunReport::failed("No active cameras found");
            }
            if target <= self.limit {
                completed(target, target, 0)
            } else {
                completed(target, target / 2, target as u64)
            }
        }
    }

    fn settings(initial_max: usize, strategy: Strategy) -> SearchSettings {
        SearchSettings {
            initial_max,
            duration: Duration::from_secs(120),
            threshold: DEFAULT_STABILITY_THRESHOLD,
            strategy,
        }
    }

    #[test]
    fn stability_predicate() {
        assert!(assess_stability(20, 18, 1, 0.1).stable);
        assert!(!assess_stability(20, 15, 0, 0.1).stable);
        // 3 reconnections over 18 streams is above the 0.1 threshold.
        assert!(!assess_stability(20, 18, 3, 0.1).stable);

        let nothing = assess_stability(5, 0, 0, 0.1);
        assert!(!nothing.stable);
        assert!(nothing.reconnection_rate.is_infinite());
    }

    #[tokio::test]
    async fn binary_search_converges_on_capacity() {
        let runner = CapacityRunner::new(37);
        let report = run_search(&runner, &settings(100, Strategy::Binary), &CancellationToken::new()).await;

        assert_eq!(runner.targets(), vec![50, 25, 37, 43, 40, 38]);
        assert_eq!(report.adaptive_test_info.maximum_stable_streams, 37);
        assert_eq!(report.optimization_results.production_limit, 29);
        assert_eq!(report.optimization_results.confidence_level, Confidence::Medium);
        assert!(report.optimization_results.stability_verified);
        assert_eq!(
            report.analysis.recommendations[0],
            "Stay below 38 streams to maintain stability"
        );
        assert!(report.analysis.summary.contains("GOOD"));
    }

    #[tokio::test]
    async fn binary_search_is_bounded() {
        let runner = CapacityRunner::new(usize::MAX);
        let report = run_search(&runner, &settings(1_000_000, Strategy::Binary), &CancellationToken::new()).await;

        assert_eq!(report.all_test_iterations.len(), MAX_SEARCH_ITERATIONS);
        assert_eq!(report.optimization_results.confidence_level, Confidence::High);
    }

    #[test]
    fn binary_search_stops_when_nothing_is_stable() {
        let mut search = BinarySearch::new(100);
        let mut seen = 0;
        while let Some(target) = search.next_target() {
            search.record(target, None);
            seen += 1;
        }
        assert!(seen <= MAX_SEARCH_ITERATIONS);
        assert_eq!(search.best, 0);
    }

    #[tokio::test]
    async fn failed_runs_count_as_unstable() {
        let mut runner = CapacityRunner::new(100);
        runner.fail_above = Some(10);
        let report = run_search(&runner, &settings(40, Strategy::Binary), &CancellationToken::new()).await;

        let first = &report.all_test_iterations[0];
        assert_eq!(first.stream_count, 20);
        assert!(!first.is_stable);
        assert_eq!(first.error.as_deref(), Some("No active cameras found"));
        assert_eq!(report.adaptive_test_info.maximum_stable_streams, 10);
    }

    #[tokio::test]
    async fn step_down_walks_to_first_stable_run() {
        let runner = CapacityRunner::new(15);
        let report = run_search(&runner, &settings(100, Strategy::StepDown), &CancellationToken::new()).await;

        assert_eq!(runner.targets(), vec![100, 90, 80, 70, 60, 50, 40, 30, 20, 15]);
        assert_eq!(report.adaptive_test_info.maximum_stable_streams, 15);
        assert!(report.analysis.summary.contains("MODERATE"));
    }

    #[tokio::test]
    async fn step_down_gives_up_at_zero() {
        let runner = CapacityRunner::new(0);
        let report = run_search(&runner, &settings(20, Strategy::StepDown), &CancellationToken::new()).await;

        assert_eq!(runner.targets(), vec![20, 10]);
        assert!(!report.optimization_results.stability_verified);
        assert!(report.best_stable_configuration.is_none());
        assert!(report.analysis.summary.starts_with("❌ Unable"));
        assert!(report.analysis.performance_characteristics.is_none());
    }

    #[tokio::test]
    async fn interrupt_stops_after_current_iteration() {
        let interrupt = CancellationToken::new();
        let mut runner = CapacityRunner::new(100);
        runner.interrupt_on_run = Some((1, interrupt.clone()));

        let report = run_search(&runner, &settings(100, Strategy::Binary), &interrupt).await;
        assert_eq!(runner.targets(), vec![50]);
        assert!(report.adaptive_test_info.interrupted);

        let partial = &report.all_test_iterations[0];
        assert!(partial.interrupted);
        assert!(partial.is_stable);
        assert_eq!(report.adaptive_test_info.maximum_stable_streams, 0);
        assert!(report.best_stable_configuration.is_none());
        assert!(!report.optimization_results.stability_verified);

        let value = serde_json::to_value(partial).unwrap();
        assert_eq!(value["interrupted"], true);
    }

    #[tokio::test]
    async fn interrupted_iteration_never_replaces_a_full_run() {
        let interrupt = CancellationToken::new();
        let mut runner = CapacityRunner::new(100);
        runner.interrupt_on_run = Some((2, interrupt.clone()));

        let report = run_search(&runner, &settings(100, Strategy::Binary), &interrupt).await;
        assert_eq!(runner.targets(), vec![50, 75]);
        assert_eq!(report.adaptive_test_info.total_iterations, 2);
        assert_eq!(report.adaptive_test_info.maximum_stable_streams, 50);
        assert_eq!(report.optimization_results.confidence_level, Confidence::Medium);
        assert!(!report.all_test_iterations[0].interrupted);
        assert!(report.all_test_iterations[1].interrupted);

        let value = serde_json::to_value(&report.all_test_iterations[0]).unwrap();
        assert!(value.get("interrupted").is_none());
    }

    #[test]
    fn unstable_iterations_without_connections_omit_rate() {
        let (entry, stability) = SearchIteration::from_report(1, 10, &completed(10, 0, 0), 0.1);
        assert!(stability.is_some());
        assert!(entry.reconnection_rate.is_none());
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value["reconnection_rate"].is_null());
        assert!(value.get("error").is_none());
    }
}
