//! `beam_shower` command line front end.
//!
//! ```bash
//! beam_shower run --minutes 10
//! beam_shower check-config --config beam_shower.toml
//! beam_shower restore --backup ~/.local/share/beam_shower/state_backup.toml
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use beam_shower::backup::BackupRecord;
use beam_shower::config::Settings;
use beam_shower::events::ShowerEvent;
use beam_shower::logging::{init_tracing, LogFormat};
use beam_shower::microscope::simulated::SimulatedMicroscope;
use beam_shower::microscope::MicroscopeControl;
use beam_shower::operator::{AutoAcknowledge, ConsoleGate, OperatorGate};
use beam_shower::procedure::BeamShowerProcedure;
use beam_shower::session::{RunOutcome, ShowerSession};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "beam_shower", version, about = "Beam shower for STEM microscopes")]
struct Cli {
    /// Configuration file (defaults to ./beam_shower.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a beam shower and restore the microscope afterwards
    Run {
        /// Override the configured duration, in minutes
        #[arg(long)]
        minutes: Option<u64>,
        /// Confirm the safety prompt without asking
        #[arg(long)]
        yes: bool,
    },
    /// Load, validate and print the effective configuration
    CheckConfig,
    /// Restore the microscope from a backup record left by an interrupted run
    Restore {
        /// Backup record to replay (defaults to the configured path)
        #[arg(long)]
        backup: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings =
        Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&settings.application.log_level, cli.log_format)?;

    match cli.command {
        Commands::Run { minutes, yes } => run(settings, cli.log_format, minutes, yes).await,
        Commands::CheckConfig => {
            let text = toml::to_string_pretty(&settings)
                .context("Failed to render configuration")?;
            println!("{text}");
            Ok(())
        }
        Commands::Restore { backup } => {
            let path = backup.unwrap_or_else(|| settings.backup.resolved_path());
            let record = BackupRecord::read(&path).await?;
            let mut procedure = BeamShowerProcedure::new(microscope(), Arc::new(AutoAcknowledge));
            procedure.recover(record).await?;
            info!("Microscope restored from {}", path.display());
            Ok(())
        }
    }
}

async fn run(
    settings: Settings,
    format: LogFormat,
    minutes: Option<u64>,
    yes: bool,
) -> anyhow::Result<()> {
    let mut config = settings.procedure;
    if let Some(minutes) = minutes {
        config = config.with_duration(Duration::from_secs(minutes.saturating_mul(60)));
    }

    let gate: Arc<dyn OperatorGate> = if yes {
        Arc::new(AutoAcknowledge)
    } else {
        Arc::new(ConsoleGate)
    };
    let mut procedure = BeamShowerProcedure::new(microscope(), gate);
    if settings.backup.enabled {
        procedure = procedure.with_backup(settings.backup.resolved_path());
    }

    let printer = tokio::spawn(print_events(procedure.subscribe(), format));

    let mut session = ShowerSession::new(procedure, settings.session.tick_interval);
    let outcome = session
        .run(config, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for Ctrl-C: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .await;
    drop(session);
    let _ = printer.await;

    match outcome? {
        RunOutcome::Completed => info!("Beam shower completed"),
        RunOutcome::Stopped => info!("Beam shower stopped early"),
    }
    Ok(())
}

/// The vendor control library is not bound yet; every run goes to the simulator.
fn microscope() -> Arc<dyn MicroscopeControl> {
    warn!("No microscope control library bound; using the simulated microscope");
    Arc::new(SimulatedMicroscope::new())
}

async fn print_events(
    mut rx: tokio::sync::broadcast::Receiver<ShowerEvent>,
    format: LogFormat,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event printer skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if format == LogFormat::Json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("Could not encode event: {}", err),
            }
            continue;
        }
        match event {
            ShowerEvent::StateChanged { to, .. } => println!("[{to}]"),
            ShowerEvent::Status(text) => println!("{text}"),
            ShowerEvent::Progress(time) => println!(
                "Remaining time: {} ({:.0}%)",
                time,
                time.percent_complete()
            ),
            ShowerEvent::Error(text) => eprintln!("{text}"),
        }
    }
}
