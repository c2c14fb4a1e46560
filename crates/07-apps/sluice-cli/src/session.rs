//! Session assembly: wires the logger, controller, and module interfaces
//! together for each CLI verb.
//!
//! The experiment state machine proper lives outside this binary; these
//! loops cover acquisition, the two training protocols, and maintenance.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use controller::{Controller, ControllerConfig};
use eventlog::{EventLogger, LoggerConfig};
use extract::{extract_archive, write_annotation_table, write_module_tables};
use modules::{
    EncoderConfig, EncoderInterface, LickConfig, LickInterface, Module, ScreenConfig,
    ScreenInterface, TtlConfig, TtlInterface, ValveCommands, ValveConfig, ValveInterface,
};
use serde::Serialize;
use thiserror::Error;

/// Default controller id; doubles as the archive's controller source id.
const CONTROLLER_ID: u8 = 2;
/// Module ids on the reference rig.
const VALVE_ID: u8 = 1;
const LICK_ID: u8 = 1;
const ENCODER_ID: u8 = 1;
const FRAME_TTL_ID: u8 = 1;
const SCREEN_ID: u8 = 1;

/// Poll cadence of the session loops.
const POLL: Duration = Duration::from_millis(20);

/// Failures that pick specific process exit codes.
#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("session aborted by the user")]
    UserAbort,

    #[error("hardware fault: {0}")]
    HardwareFault(String),

    #[error("archive integrity failure: {0}")]
    IntegrityFailure(String),
}

/// Resolved connection and storage options.
pub(crate) struct RigOptions {
    pub port: String,
    pub baud: u32,
    pub log_root: PathBuf,
}

impl RigOptions {
    pub(crate) fn resolve(port: Option<String>, baud: Option<u32>, log_root: Option<PathBuf>) -> Self {
        let port = port
            .or_else(|| std::env::var("SERIAL_PORT").ok())
            .unwrap_or_else(|| "/dev/ttyACM0".to_owned());
        let baud = baud
            .or_else(|| std::env::var("BAUD").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(115_200);
        let log_root = log_root
            .or_else(|| std::env::var("LOG_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("sluice-logs"));
        Self {
            port,
            baud,
            log_root,
        }
    }
}

/// A running rig: logger plus controller plus the handles the loops need.
struct Rig {
    logger: EventLogger,
    controller: Controller,
    valve: ValveCommands,
    /// Dropping this file into the log root aborts the session cleanly;
    /// the GUI and the orchestrator both use it as the out-of-band stop
    /// signal.
    abort_flag: PathBuf,
}

impl Rig {
    /// Builds the full module set, starts the logger and the controller,
    /// and releases the output lock.
    fn bring_up(options: &RigOptions, calibration: &[(f64, f64)]) -> Result<Self> {
        // The archive is named after the controller id, one file per
        // controller.
        let logger = EventLogger::new(LoggerConfig::new(
            &options.log_root,
            CONTROLLER_ID.to_string(),
        ))
        .context("creating the event logger")?;
        logger.start().context("starting the event logger")?;

        let valve = ValveInterface::new(VALVE_ID, calibration, ValveConfig::default())
            .context("constructing the valve interface")?;
        let lick = LickInterface::new(LICK_ID, LickConfig::default())
            .context("constructing the lick interface")?;
        let encoder = EncoderInterface::new(ENCODER_ID, EncoderConfig::default())
            .context("constructing the encoder interface")?;
        let frame_ttl = TtlInterface::new(
            FRAME_TTL_ID,
            TtlConfig {
                report_pulses: true,
                ..TtlConfig::default()
            },
        )
        .context("constructing the frame-stamp interface")?;
        let screen = ScreenInterface::new(SCREEN_ID, ScreenConfig::default())
            .context("constructing the screen interface")?;

        let controller = Controller::new(
            ControllerConfig::new(CONTROLLER_ID, &options.port, options.baud),
            logger.handle(),
            vec![
                Module::Valve(valve),
                Module::Lick(lick),
                Module::Encoder(encoder),
                Module::Ttl(frame_ttl),
                Module::Screen(screen),
            ],
        )
        .context("constructing the controller")?;

        let valve = controller
            .valve_commands(VALVE_ID)
            .context("valve command handle")?;

        controller
            .start()
            .map_err(|err| SessionError::HardwareFault(err.to_string()))
            .context("starting the controller")?;
        controller
            .unlock()
            .map_err(|err| SessionError::HardwareFault(err.to_string()))
            .context("unlocking the controller")?;

        let abort_flag = options.log_root.join("abort.request");
        let _ = std::fs::remove_file(&abort_flag);

        Ok(Self {
            logger,
            controller,
            valve,
            abort_flag,
        })
    }

    /// Stops acquisition and archives the session log with verification.
    fn bring_down(self) -> Result<PathBuf> {
        self.controller
            .stop()
            .map_err(|err| SessionError::HardwareFault(err.to_string()))
            .context("stopping the controller")?;
        self.logger.stop().context("stopping the event logger")?;
        let archive = self
            .logger
            .compress_logs(true, true, true)
            .map_err(|err| match err {
                eventlog::LogError::Integrity(msg) => SessionError::IntegrityFailure(msg),
                other => SessionError::HardwareFault(other.to_string()),
            })
            .context("archiving session logs")?;
        log::info!("session archive: {}", archive.display());

        let summary = SessionSummary {
            archive: archive.clone(),
            ended_epoch_us: timekit::utc_now_us(),
            link: LinkSummary::from(self.controller.link_stats()),
        };
        let summary_path = archive.with_file_name("session_summary.json");
        std::fs::write(
            &summary_path,
            serde_json::to_string_pretty(&summary).context("serializing session summary")?,
        )
        .context("writing session summary")?;

        Ok(archive)
    }

    fn fail_fast(&self) -> Result<()> {
        if self.controller.state() == controller::ControllerState::Faulted {
            return Err(SessionError::HardwareFault(
                "controller faulted mid-session".to_owned(),
            )
            .into());
        }
        if self.abort_flag.exists() {
            let _ = std::fs::remove_file(&self.abort_flag);
            return Err(SessionError::UserAbort.into());
        }
        Ok(())
    }
}

/// Written next to the archive for the transfer pipeline's bookkeeping.
#[derive(Debug, Serialize)]
struct SessionSummary {
    archive: PathBuf,
    ended_epoch_us: u64,
    link: LinkSummary,
}

#[derive(Debug, Serialize)]
struct LinkSummary {
    frames_decoded: u64,
    frames_sent: u64,
    frame_errors: u64,
    dropped_commands: u64,
}

impl From<controller::LinkStats> for LinkSummary {
    fn from(stats: controller::LinkStats) -> Self {
        Self {
            frames_decoded: stats.frames_decoded,
            frames_sent: stats.frames_sent,
            frame_errors: stats.frame_errors,
            dropped_commands: stats.dropped_commands,
        }
    }
}

/// Shared tracker readers the training loops poll.
struct Trackers {
    licks: tracker::SharedTracker<u64>,
    speed: tracker::SharedTracker<f64>,
    volume: tracker::SharedTracker<f64>,
}

impl Trackers {
    fn connect() -> Result<Self> {
        Ok(Self {
            licks: tracker::SharedTracker::connect(&tracker::tracker_name(
                modules::LICK_TYPE,
                LICK_ID,
                "lick",
            ))
            .context("connecting the lick tracker")?,
            speed: tracker::SharedTracker::connect(&tracker::tracker_name(
                modules::ENCODER_TYPE,
                ENCODER_ID,
                "speed",
            ))
            .context("connecting the speed tracker")?,
            volume: tracker::SharedTracker::connect(&tracker::tracker_name(
                modules::VALVE_TYPE,
                VALVE_ID,
                "valve",
            ))
            .context("connecting the valve tracker")?,
        })
    }
}

pub(crate) fn run_experiment(
    options: &RigOptions,
    calibration_path: &Path,
    duration_s: u64,
) -> Result<()> {
    let calibration = crate::load_calibration(calibration_path)?;
    let rig = Rig::bring_up(options, &calibration)?;
    let trackers = Trackers::connect()?;

    log::info!("acquisition running for {duration_s} s");
    let deadline = Instant::now() + Duration::from_secs(duration_s);
    let mut last_report = Instant::now();
    let session = (|| -> Result<()> {
        while Instant::now() < deadline {
            rig.fail_fast()?;
            if last_report.elapsed() >= Duration::from_secs(30) {
                last_report = Instant::now();
                log::info!(
                    "licks {} | speed {:.2} cm/s | water {:.1} uL",
                    trackers.licks.read(0).unwrap_or(0),
                    trackers.speed.read(0).unwrap_or(0.0),
                    trackers.volume.read(0).unwrap_or(0.0),
                );
            }
            std::thread::sleep(POLL);
        }
        Ok(())
    })();

    // Archive whatever was recorded even when the session ended early.
    let teardown = rig.bring_down();
    session?;
    teardown.map(|_| ())
}

pub(crate) fn lick_train(
    options: &RigOptions,
    calibration_path: &Path,
    duration_s: u64,
    reward_ul: f64,
    budget_ul: f64,
) -> Result<()> {
    let calibration = crate::load_calibration(calibration_path)?;
    let mut rig = Rig::bring_up(options, &calibration)?;
    let trackers = Trackers::connect()?;

    log::info!("lick training: {reward_ul} uL per lick, {budget_ul} uL budget");
    let deadline = Instant::now() + Duration::from_secs(duration_s);
    let mut rewarded_licks = 0u64;
    let session = (|| -> Result<()> {
        while Instant::now() < deadline {
            rig.fail_fast()?;

            let licks = trackers.licks.read(0).unwrap_or(0);
            if licks > rewarded_licks {
                rewarded_licks = licks;
                rig.valve
                    .dispense_volume(reward_ul, false)
                    .context("dispensing lick reward")?;
            }
            if trackers.volume.read(0).unwrap_or(0.0) >= budget_ul {
                log::info!("water budget reached; ending the session");
                break;
            }
            std::thread::sleep(POLL);
        }
        Ok(())
    })();

    let teardown = rig.bring_down();
    session?;
    teardown.map(|_| ())
}

pub(crate) fn run_train(
    options: &RigOptions,
    calibration_path: &Path,
    duration_s: u64,
    reward_ul: f64,
    speed_cm_s: f64,
    refractory_s: u64,
) -> Result<()> {
    let calibration = crate::load_calibration(calibration_path)?;
    let mut rig = Rig::bring_up(options, &calibration)?;
    let trackers = Trackers::connect()?;

    log::info!("run training: {reward_ul} uL above {speed_cm_s} cm/s");
    let deadline = Instant::now() + Duration::from_secs(duration_s);
    let refractory = Duration::from_secs(refractory_s);
    let mut last_reward: Option<Instant> = None;
    let session = (|| -> Result<()> {
        while Instant::now() < deadline {
            rig.fail_fast()?;

            let speed = trackers.speed.read(0).unwrap_or(0.0);
            let eligible = last_reward
                .map(|at| at.elapsed() >= refractory)
                .unwrap_or(true);
            if speed >= speed_cm_s && eligible {
                rig.valve
                    .dispense_volume(reward_ul, false)
                    .context("dispensing run reward")?;
                last_reward = Some(Instant::now());
            }
            std::thread::sleep(POLL);
        }
        Ok(())
    })();

    let teardown = rig.bring_down();
    session?;
    teardown.map(|_| ())
}

pub(crate) fn maintenance(
    options: &RigOptions,
    calibration_path: &Path,
    action: crate::MaintenanceAction,
) -> Result<()> {
    let calibration = crate::load_calibration(calibration_path)?;
    let mut rig = Rig::bring_up(options, &calibration)?;

    match action {
        crate::MaintenanceAction::OpenValve => {
            rig.valve.toggle(true).context("opening the valve")?;
            log::info!("valve locked open");
        }
        crate::MaintenanceAction::CloseValve => {
            rig.valve.toggle(false).context("closing the valve")?;
            log::info!("valve locked closed");
        }
        crate::MaintenanceAction::Reference => {
            rig.valve
                .dispense_volume(5.0, false)
                .context("reference dispense")?;
            log::info!("reference 5 uL dispense issued");
        }
        crate::MaintenanceAction::Calibrate { pulse_us } => {
            rig.valve
                .set_parameters(modules::ValveParameters {
                    pulse_duration_us: pulse_us,
                    calibration_delay_us: 200_000,
                    calibration_count: 200,
                })
                .context("applying calibration parameters")?;
            rig.valve.calibrate().context("starting calibration")?;
            log::info!("calibration cycle started at {pulse_us} us per pulse");
        }
    }

    // Give the worker a moment to flush the queued commands to the wire.
    std::thread::sleep(Duration::from_millis(200));
    rig.bring_down()?;
    Ok(())
}

pub(crate) fn extract_logs(archive: &Path, out: &Path, calibration_path: &Path) -> Result<()> {
    let calibration = crate::load_calibration(calibration_path)?;

    // Reconstruct the rig's module set so extraction applies the same
    // calibrations the session ran with.
    let modules = vec![
        Module::Valve(
            ValveInterface::new(VALVE_ID, &calibration, ValveConfig::default())
                .context("constructing the valve interface")?,
        ),
        Module::Lick(
            LickInterface::new(LICK_ID, LickConfig::default())
                .context("constructing the lick interface")?,
        ),
        Module::Encoder(
            EncoderInterface::new(ENCODER_ID, EncoderConfig::default())
                .context("constructing the encoder interface")?,
        ),
        Module::Ttl(
            TtlInterface::new(FRAME_TTL_ID, TtlConfig::default())
                .context("constructing the frame-stamp interface")?,
        ),
        Module::Screen(
            ScreenInterface::new(SCREEN_ID, ScreenConfig::default())
                .context("constructing the screen interface")?,
        ),
    ];

    let extraction = extract_archive(archive, true)
        .with_context(|| format!("extracting {}", archive.display()))?;
    let source = extraction
        .source(CONTROLLER_ID)
        .context("archive has no controller stream")?;

    let written = write_module_tables(source, &modules, out)?;
    for path in &written {
        log::info!("wrote {}", path.display());
    }
    if !extraction.annotations.is_empty() {
        let path = write_annotation_table(&extraction.annotations, out)?;
        log::info!("wrote {}", path.display());
    }
    println!(
        "extracted {} module table(s) into {}",
        written.len(),
        out.display()
    );
    Ok(())
}
