use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod config;
mod error;
mod frame_parser;
mod inventory;
mod logging;
mod monitor;
mod multi;
mod report;
mod search;
mod stats;
mod stream;
#[cfg(test)]
mod test_support;
mod types;

use config::Settings;
use inventory::{CameraInventory, FileInventory, HttpInventory, StaticInventory};
use load_test::{HarnessConfig, LoadHarness};
use report::{print_summary, save_report, RunReport};
use search::{print_search_summary, run_search, HarnessRunner, SearchSettings, Strategy};
use types::CameraRecord;

const EXIT_INTERRUPTED: u8 = 130;

/// How a command ended. An interrupt overrides either outcome.
enum Outcome {
    Success,
    Failure,
}

#[derive(Parser, Debug)]
#[command(name = "streamload", version, about = "Concurrency load tester for MJPEG camera streams")]
struct Cli {
    /// Camera inventory endpoint (overrides CAMERA_API_URL).
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Read the camera inventory from a JSON file instead of the API.
    #[arg(long, global = true)]
    inventory_file: Option<PathBuf>,

    /// Stream this URL directly, skipping the inventory. Repeatable.
    #[arg(long = "stream-url", global = true)]
    stream_urls: Vec<String>,

    /// Verify TLS certificates of stream endpoints.
    #[arg(long, global = true)]
    strict_tls: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hold N concurrent streams open for a fixed duration.
    Run {
        #[arg(default_value_t = 50)]
        max_streams: usize,
        #[arg(default_value_t = 300)]
        duration_secs: u64,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Take cameras in inventory order.
        #[arg(long)]
        no_shuffle: bool,
    },
    /// Look for the highest stable concurrency.
    Search {
        #[arg(default_value_t = 100)]
        initial_max: usize,
        /// Seconds per iteration.
        #[arg(long, default_value_t = 120)]
        duration: u64,
        /// Highest tolerated reconnections per achieved stream.
        #[arg(long, default_value_t = search::DEFAULT_STABILITY_THRESHOLD)]
        threshold: f64,
        #[arg(long, value_enum, default_value_t = Strategy::Binary)]
        strategy: Strategy,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Open several viewers per camera.
    Multi {
        camera_count: usize,
        #[arg(long, default_value_t = 1)]
        connections_per_camera: usize,
        #[arg(long, default_value_t = 120)]
        duration: u64,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Command {
    fn run_kind(&self) -> &'static str {
        match self {
            Command::Run { .. } => "load_test",
            Command::Search { .. } => "adaptive_load_test",
            Command::Multi { .. } => "multi_connection_test",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_path = logging::init(&settings.logs_dir, cli.command.run_kind());
    info!("🚀 streamload {} starting...", env!("CARGO_PKG_VERSION"));
    if let Some(path) = log_path {
        info!("📝 Logging to {}", path.display());
    }

    let interrupt = CancellationToken::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⏹️ Interrupt received, stopping after the current run...");
            trigger.cancel();
        }
    });

    match execute(cli, settings, &interrupt).await {
        Ok(_) if interrupt.is_cancelled() => {
            info!("Interrupted, partial results were saved");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::Failure) => ExitCode::FAILURE,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli, settings: Settings, interrupt: &CancellationToken) -> Result<Outcome> {
    let inventory = build_inventory(&cli, &settings)?;
    let template = |camera_count: usize, duration_secs: u64| HarnessConfig {
        read_timeout: settings.read_timeout,
        connect_timeout: settings.connect_timeout,
        shutdown_grace: settings.shutdown_grace,
        accept_invalid_certs: !cli.strict_tls,
        ..HarnessConfig::new(camera_count, Duration::from_secs(duration_secs))
    };

    match &cli.command {
        Command::Run {
            max_streams,
            duration_secs,
            output,
            no_shuffle,
        } => {
            ensure!(*max_streams > 0, "max_streams must be at least 1");
            ensure!(*duration_secs > 0, "duration must be at least 1 second");

            let config = HarnessConfig {
                shuffle: !no_shuffle,
                ..template(*max_streams, *duration_secs)
            };
            let report = LoadHarness::new(config, inventory).run(interrupt).await;

            if let RunReport::Completed(summary) = &report {
                print_summary(summary);
            }
            let path = save_report(
                &report,
                &settings.reports_dir,
                output.as_deref(),
                "camera_stream_load_test_report",
            )?;
            info!("💾 Report saved to {}", path.display());

            Ok(match report {
                RunReport::Completed(_) => Outcome::Success,
                RunReport::Failed { error } => {
                    error!("❌ Test failed: {}", error);
                    Outcome::Failure
                }
            })
        }

        Command::Search {
            initial_max,
            duration,
            threshold,
            strategy,
            output,
        } => {
            ensure!(*initial_max > 0, "initial_max must be at least 1");
            ensure!(*duration > 0, "duration must be at least 1 second");
            ensure!(*threshold >= 0.0, "threshold must not be negative");

            let search_settings = SearchSettings {
                initial_max: *initial_max,
                duration: Duration::from_secs(*duration),
                threshold: *threshold,
                strategy: *strategy,
            };
            let runner = HarnessRunner::new(
                template(*initial_max, *duration),
                inventory,
                interrupt.clone(),
            );

            info!(
                "🎯 Searching for maximum stable streams ({:?}, starting at {})",
                strategy, initial_max
            );
            let report = run_search(&runner, &search_settings, interrupt).await;
            print_search_summary(&report);

            let path = save_report(
                &report,
                &settings.reports_dir,
                output.as_deref(),
                "adaptive_load_test_report",
            )?;
            info!("💾 Report saved to {}", path.display());

            Ok(if report.optimization_results.stability_verified {
                Outcome::Success
            } else {
                warn!("❌ Could not find a stable configuration");
                Outcome::Failure
            })
        }

        Command::Multi {
            camera_count,
            connections_per_camera,
            duration,
            output,
        } => {
            ensure!(*camera_count > 0, "camera_count must be at least 1");
            ensure!(*connections_per_camera > 0, "connections_per_camera must be at least 1");
            ensure!(*duration > 0, "duration must be at least 1 second");

            let config = HarnessConfig {
                connections_per_camera: *connections_per_camera,
                ..template(*camera_count, *duration)
            };
            let stem = format!(
                "multi_connection_test_{}x{}",
                camera_count, connections_per_camera
            );

            match multi::run_multi(config, inventory, interrupt).await {
                Ok(report) => {
                    multi::print_multi_summary(&report);
                    let path =
                        save_report(&report, &settings.reports_dir, output.as_deref(), &stem)?;
                    info!("💾 Report saved to {}", path.display());
                    Ok(Outcome::Success)
                }
                Err(message) => {
                    error!("❌ Test failed: {}", message);
                    let path = save_report(
                        &RunReport::failed(message),
                        &settings.reports_dir,
                        output.as_deref(),
                        &stem,
                    )?;
                    info!("💾 Report saved to {}", path.display());
                    Ok(Outcome::Failure)
                }
            }
        }
    }
}

fn build_inventory(cli: &Cli, settings: &Settings) -> Result<Arc<dyn CameraInventory>> {
    if !cli.stream_urls.is_empty() {
        let cameras = cli
            .stream_urls
            .iter()
            .zip(1..)
            .map(|(url, id)| CameraRecord {
                id,
                status: Some(1),
                stream_url: Some(url.clone()),
            })
            .collect();
        return Ok(Arc::new(StaticInventory::new(cameras)));
    }

    if let Some(path) = &cli.inventory_file {
        return Ok(Arc::new(FileInventory::new(path)));
    }

    let api_url = cli.api_url.clone().unwrap_or_else(|| settings.api_url.clone());
    Ok(Arc::new(HttpInventory::new(api_url, settings.inventory_timeout)?))
}
