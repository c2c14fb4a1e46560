//! `sluice`: host binary for the acquisition rig.
//!
//! Verbs map to the stable CLI surface: `run-experiment`, `lick-train`,
//! `run-train`, `maintenance`, `extract-logs`. `SERIAL_PORT`, `BAUD`, and
//! `LOG_ROOT` environment variables override the defaults when the
//! corresponding flags are absent.

mod session;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::session::{RigOptions, SessionError};

/// Exit codes fixed by the CLI contract.
const EXIT_OK: u8 = 0;
const EXIT_USER_ABORT: u8 = 2;
const EXIT_HARDWARE_FAULT: u8 = 3;
const EXIT_INTEGRITY_FAILURE: u8 = 4;

#[derive(Parser)]
#[command(name = "sluice", about = "Behavioral rig acquisition runtime")]
struct Cli {
    /// Serial port; falls back to $SERIAL_PORT, then /dev/ttyACM0.
    #[arg(long, global = true)]
    port: Option<String>,

    /// Baud rate; falls back to $BAUD, then 115200.
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Directory for staging logs and archives; falls back to $LOG_ROOT,
    /// then ./sluice-logs.
    #[arg(long, global = true)]
    log_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Full acquisition session: all modules live, logs archived at the
    /// end.
    RunExperiment {
        /// Valve calibration samples, JSON `[[pulse_us, volume_ul], ...]`.
        #[arg(long)]
        calibration: PathBuf,
        /// Session duration in seconds.
        #[arg(long, default_value_t = 3600)]
        duration_s: u64,
    },
    /// Reward every detected lick until the water budget runs out.
    LickTrain {
        #[arg(long)]
        calibration: PathBuf,
        #[arg(long, default_value_t = 1200)]
        duration_s: u64,
        /// Reward volume per lick.
        #[arg(long, default_value_t = 5.0)]
        reward_ul: f64,
        /// Total water budget for the session.
        #[arg(long, default_value_t = 1000.0)]
        budget_ul: f64,
    },
    /// Reward sustained running above a speed threshold.
    RunTrain {
        #[arg(long)]
        calibration: PathBuf,
        #[arg(long, default_value_t = 1200)]
        duration_s: u64,
        #[arg(long, default_value_t = 5.0)]
        reward_ul: f64,
        /// Running speed that must be held to earn a reward, cm/s.
        #[arg(long, default_value_t = 5.0)]
        speed_cm_s: f64,
        /// Pause after each reward before the next can be earned, seconds.
        #[arg(long, default_value_t = 2)]
        refractory_s: u64,
    },
    /// Manual valve upkeep: open, close, reference dispense, or a full
    /// calibration cycle.
    Maintenance {
        #[arg(long)]
        calibration: PathBuf,
        #[command(subcommand)]
        action: MaintenanceAction,
    },
    /// Re-derive typed module tables from a session archive.
    ExtractLogs {
        /// Archive produced by a previous session.
        #[arg(long)]
        archive: PathBuf,
        /// Output directory for the CSV tables.
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        calibration: PathBuf,
    },
}

#[derive(Subcommand)]
pub(crate) enum MaintenanceAction {
    /// Lock the valve open.
    OpenValve,
    /// Lock the valve closed.
    CloseValve,
    /// Dispense the 5 uL reference volume once.
    Reference,
    /// Run a calibration cycle at the given pulse duration.
    Calibrate {
        #[arg(long, default_value_t = 15_000)]
        pulse_us: u32,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let options = RigOptions::resolve(cli.port, cli.baud, cli.log_root);

    let outcome = match cli.command {
        Command::RunExperiment {
            calibration,
            duration_s,
        } => session::run_experiment(&options, &calibration, duration_s),
        Command::LickTrain {
            calibration,
            duration_s,
            reward_ul,
            budget_ul,
        } => session::lick_train(&options, &calibration, duration_s, reward_ul, budget_ul),
        Command::RunTrain {
            calibration,
            duration_s,
            reward_ul,
            speed_cm_s,
            refractory_s,
        } => session::run_train(
            &options,
            &calibration,
            duration_s,
            reward_ul,
            speed_cm_s,
            refractory_s,
        ),
        Command::Maintenance {
            calibration,
            action,
        } => session::maintenance(&options, &calibration, action),
        Command::ExtractLogs {
            archive,
            out,
            calibration,
        } => session::extract_logs(&archive, &out, &calibration),
    };

    match outcome {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(classify(&err))
        }
    }
}

/// Maps failure causes onto the contract's exit codes.
fn classify(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(session) = cause.downcast_ref::<SessionError>() {
            return match session {
                SessionError::UserAbort => EXIT_USER_ABORT,
                SessionError::HardwareFault(_) => EXIT_HARDWARE_FAULT,
                SessionError::IntegrityFailure(_) => EXIT_INTEGRITY_FAILURE,
            };
        }
        if let Some(log_err) = cause.downcast_ref::<eventlog::LogError>() {
            if matches!(log_err, eventlog::LogError::Integrity(_)) {
                return EXIT_INTEGRITY_FAILURE;
            }
        }
        if cause.downcast_ref::<controller::ControllerError>().is_some() {
            return EXIT_HARDWARE_FAULT;
        }
    }
    EXIT_HARDWARE_FAULT
}

/// Loads valve calibration samples from a JSON file.
pub(crate) fn load_calibration(path: &std::path::Path) -> Result<Vec<(f64, f64)>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading calibration file {}", path.display()))?;
    let samples: Vec<(f64, f64)> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing calibration samples from {}", path.display()))?;
    Ok(samples)
}
