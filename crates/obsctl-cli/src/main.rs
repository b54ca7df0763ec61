use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use obsctl_core::{ControllerStatus, JsonLineTransport, ObservationController};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::settings::{FileConfig, Overrides};

mod console;
mod settings;
mod viewer;
#[cfg(test)]
mod console_tests;
#[cfg(test)]
mod viewer_tests;

#[derive(Debug, Parser)]
#[command(name = "obsctld")]
#[command(about = "Observation control plane for a subarray of subordinate devices")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,

    #[arg(long, default_value = "./obsctl.json")]
    config: PathBuf,

    #[arg(long)]
    command_timeout_ms: Option<u64>,

    #[arg(long)]
    probe_interval_ms: Option<u64>,

    #[arg(long)]
    probe_timeout_ms: Option<u64>,

    #[arg(long)]
    stale_after_ms: Option<u64>,

    #[arg(long)]
    error_threshold: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Print the configuration after command-line overrides.
    Config,
    /// Connect, wait for the first probes, print one status.
    Status {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
        #[arg(long, default_value_t = 1500)]
        settle_ms: u64,
    },
    /// Print status whenever anything changes.
    Watch {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Interactive command console on stdin.
    Console,
    /// Terminal dashboard.
    View {
        #[arg(long, default_value_t = 180.0)]
        window_sec: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let mut file = FileConfig::load(&cli.config)?;
    file.apply(&Overrides {
        command_timeout_ms: cli.command_timeout_ms,
        probe_interval_ms: cli.probe_interval_ms,
        probe_timeout_ms: cli.probe_timeout_ms,
        stale_after_ms: cli.stale_after_ms,
        error_threshold: cli.error_threshold,
    });
    file.validate()?;

    if let CliCommand::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&file)?);
        return Ok(());
    }

    let transport = Arc::new(JsonLineTransport::new(file.endpoints(), file.connect_timeout()));
    let controller = ObservationController::start(file.controller_config(), transport);
    info!(config = %cli.config.display(), subordinates = file.subordinates.len(), "controller ready");

    let result = match cli.command {
        CliCommand::Config => Ok(()),
        CliCommand::Status { format, settle_ms } => {
            tokio::time::sleep(Duration::from_millis(settle_ms)).await;
            print_status(&controller.status(), format)
        }
        CliCommand::Watch { format } => stream_loop(&controller, format).await,
        CliCommand::Console => console::run_console(&controller).await,
        CliCommand::View { window_sec } => viewer::run_viewer(&controller, window_sec).await,
    };

    controller.shutdown();
    result
}

async fn stream_loop(
    controller: &ObservationController<JsonLineTransport>,
    format: OutputFormat,
) -> Result<()> {
    let mut changes = controller.changes();
    print_status(&controller.status(), format)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = controller.status();
                print_status(&status, format)?;
                info!(state = %status.observation_state, health = %status.aggregated_status, pending = status.pending.len(), "status");
            }
        }
    }

    Ok(())
}

pub(crate) fn print_status(status: &ControllerStatus, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(status)?);
        }
        OutputFormat::Ndjson => {
            println!("{}", serde_json::to_string(status)?);
        }
        OutputFormat::Human => {
            println!("=== Observation {} ===", status.observation_id);
            println!("Time:       {}", status.ts.to_rfc3339());
            println!(
                "State:      {}  health={}",
                status.observation_state, status.aggregated_status
            );

            let timer = &status.scan_timer;
            if timer.active {
                println!(
                    "Scan timer: window={} remaining_ms={}",
                    timer.window_id.unwrap_or_default(),
                    timer.remaining_ms.unwrap_or_default()
                );
            }

            if let Some(message) = &status.last_activity {
                println!("Activity:   {message}");
            }

            println!("Devices:");
            for device in &status.devices {
                println!(
                    "  {:<12} {:<8} {:<9} obs={:<11} {} age_ms={} failures={}",
                    device.id,
                    if device.required { "required" } else { "optional" },
                    device.status.as_str(),
                    device.obs_state.map(|s| s.as_str()).unwrap_or("n/a"),
                    if device.responsive { "responsive" } else { "UNRESPONSIVE" },
                    device
                        .age_ms
                        .map(|ms| ms.to_string())
                        .unwrap_or_else(|| "n/a".to_string()),
                    device.consecutive_failures,
                );
                if let Some(error) = &device.last_error {
                    println!("    last error: {error}");
                }
            }

            if !status.pending.is_empty() {
                println!("Pending:");
                for pending in &status.pending {
                    println!(
                        "  {} on {} ({} ms to deadline)",
                        pending.command, pending.target, pending.remaining_ms
                    );
                }
            }
        }
    }

    Ok(())
}
