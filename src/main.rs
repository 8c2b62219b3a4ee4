//! svcbridge binary.
//!
//! Runs a command as an operating-system service: the command becomes the
//! service's main task, its output goes to the log, and a stop request from
//! the manager kills it. `--debug` runs the command directly, without the
//! service manager.

mod debug_log;
mod workload;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use debug_log::DebugLog;
use service::{main_callback, BridgeConfig, RunOutcome, ServiceCoordinator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use workload::{LineSink, Workload};

#[derive(Parser, Debug)]
#[command(
    name = "svcbridge",
    about = "Run a command under the operating-system service manager",
    version,
    author
)]
struct Cli {
    /// Service name registered with the manager (overrides the config file)
    #[arg(short = 'n', long, env = "SVCBRIDGE_SERVICE_NAME")]
    service_name: Option<String>,

    /// TOML configuration file
    #[arg(short, long, env = "SVCBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Debug log file (defaults to service.log in the temp directory)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Run the command directly instead of as a service
    #[arg(long)]
    debug: bool,

    /// Keep the service running this long after the command exits, e.g. "30s"
    #[arg(long, value_parser = humantime::parse_duration)]
    linger: Option<Duration>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Command to run, and its arguments
    #[arg(last = true)]
    command: Vec<String>,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(name) = &cli.service_name {
        config.service_name = name.clone();
    }
    config.validate()?;
    Ok(config)
}

fn outcome_code(outcome: RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Completed => ExitCode::SUCCESS,
        RunOutcome::StartupTimedOut => ExitCode::from(2),
        RunOutcome::DispatchFailed { .. } => ExitCode::from(3),
        RunOutcome::RegistrationFailed { .. } => ExitCode::from(4),
    }
}

async fn run_direct(workload: Workload) -> Result<ExitCode> {
    let shutdown = Arc::new(Notify::new());
    let notifier = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping workload");
            notifier.notify_one();
        }
    });

    let exit = workload.run(shutdown).await?;
    Ok(if exit.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_service(
    config: BridgeConfig,
    workload: Workload,
    log: Arc<DebugLog>,
    linger: Option<Duration>,
) -> Result<ExitCode> {
    let service = ServiceCoordinator::native(config)?;
    let shutdown = Arc::new(Notify::new());

    let debug_sink = log.clone();
    service.on_debug(move |message| debug_sink.record(message))?;

    let stopper = service.clone();
    let notifier = shutdown.clone();
    service.on_stop(move || {
        notifier.notify_one();
        stopper.stop();
    })?;

    let output_log = log.clone();
    let sink: LineSink = Arc::new(move |stream: &str, line: &str| {
        output_log.record(&format!("[{}] {}", stream, line));
    });
    let workload = workload.with_sink(sink);

    let main = main_callback(move || {
        let workload = workload.clone();
        let shutdown = shutdown.clone();
        async move {
            match workload.run(shutdown.clone()).await {
                Ok(exit) => info!(exit = ?exit, "Service workload finished"),
                Err(e) => error!(error = %e, "Service workload failed"),
            }
            if let Some(linger) = linger {
                tokio::select! {
                    _ = tokio::time::sleep(linger) => {}
                    _ = shutdown.notified() => {}
                }
            }
        }
    });

    let outcome = service.run(Some(main)).await;
    info!(outcome = ?outcome, "Service run finished");
    Ok(outcome_code(outcome))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let workload = Workload::from_command_line(&cli.command);

    if cli.debug {
        info!(program = %workload.program(), "Running workload directly");
        return run_direct(workload).await;
    }

    let config = load_config(&cli)?;
    let log = Arc::new(match &cli.log_file {
        Some(path) => DebugLog::new(path),
        None => DebugLog::default(),
    });
    info!(
        service = %config.service_name,
        log = %log.path().display(),
        "Starting service bridge"
    );

    run_service(config, workload, log, cli.linger).await
}
