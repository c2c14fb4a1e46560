//! Solenoid valve interface: calibrated fluid dispensing.
//!
//! The valve module pulses a FET-gated solenoid to pass precise fluid
//! volumes. Pulse duration maps to volume through a power-law calibration
//! `volume_ul = A * pulse_us^B` fit once at construction; the live
//! interface accumulates delivered volume by timing each open→closed cycle
//! with the worker-side microsecond timer.

use smallvec::SmallVec;
use timekit::MicrosTimer;
use tracker::{tracker_name, SharedTracker};
use wire::{Message, ParameterMessage};

use crate::base::{merged_levels, CommandQueue, EventMap, ModuleCore, ModuleEvent};
use crate::calibration::{power_law_fit, round_decimals};
use crate::series::ModuleSeries;
use crate::{ModuleError, ModuleResult};

pub const VALVE_TYPE: u8 = 5;

/// Valve event codes, firmware-aligned.
pub const VALVE_OPEN: u8 = 51;
pub const VALVE_CLOSED: u8 = 52;
pub const VALVE_CALIBRATED: u8 = 53;

/// Valve command codes.
pub const CMD_PULSE: u8 = 1;
pub const CMD_OPEN: u8 = 2;
pub const CMD_CLOSE: u8 = 3;
pub const CMD_CALIBRATE: u8 = 4;

/// Tracker layout: index 0 is the monotone cumulative volume in uL, index 1
/// mirrors the valve state (1 open, 0 closed).
pub const TRACKER_VOLUME: usize = 0;
pub const TRACKER_STATE: usize = 1;

/// Construction options beyond the calibration samples.
#[derive(Debug, Clone)]
pub struct ValveConfig {
    /// Smallest pulse the hardware dispenses reliably; requests mapping
    /// below it are refused.
    pub min_pulse_us: u32,
    /// Pause between pulses during a calibration cycle.
    pub calibration_delay_us: u32,
    /// Number of pulses in one calibration cycle.
    pub calibration_count: u16,
    /// Echo open/close events through the debug sink.
    pub debug: bool,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            min_pulse_us: 10_000,
            calibration_delay_us: 200_000,
            calibration_count: 200,
            debug: false,
        }
    }
}

/// PC-addressable runtime parameters of the valve module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveParameters {
    pub pulse_duration_us: u32,
    pub calibration_delay_us: u32,
    pub calibration_count: u16,
}

impl ValveParameters {
    pub fn pack(&self) -> SmallVec<[u8; 16]> {
        let mut data = SmallVec::new();
        data.extend_from_slice(&self.pulse_duration_us.to_le_bytes());
        data.extend_from_slice(&self.calibration_delay_us.to_le_bytes());
        data.extend_from_slice(&self.calibration_count.to_le_bytes());
        data
    }
}

/// Worker-side valve interface.
pub struct ValveInterface {
    core: ModuleCore,
    scale_coefficient: f64,
    nonlinearity_exponent: f64,
    config: ValveConfig,
    tracker: SharedTracker<f64>,
    cycle_timer: Option<MicrosTimer>,
    valve_open: bool,
}

impl ValveInterface {
    /// Fits the power-law calibration and reserves the valve tracker.
    ///
    /// `calibration_samples` pairs `(pulse_us, volume_ul)`; a fit that fails
    /// to converge is fatal here, before any hardware is touched.
    pub fn new(
        module_id: u8,
        calibration_samples: &[(f64, f64)],
        config: ValveConfig,
    ) -> ModuleResult<Self> {
        let (scale_coefficient, nonlinearity_exponent) = power_law_fit(calibration_samples)?;

        let mut core = ModuleCore::new(VALVE_TYPE, module_id);
        core.data_codes
            .extend_from_slice(&[VALVE_OPEN, VALVE_CLOSED, VALVE_CALIBRATED]);
        core.command_topics.push("reward/dispense");

        let mut tracker =
            SharedTracker::create(&tracker_name(VALVE_TYPE, module_id, "valve"), 2, true)?;
        tracker.set_destroy_on_drop(true);

        Ok(Self {
            core,
            scale_coefficient,
            nonlinearity_exponent,
            config,
            tracker,
            cycle_timer: None,
            valve_open: false,
        })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    /// The `A` term of `volume = A * pulse^B`.
    pub fn scale_coefficient(&self) -> f64 {
        self.scale_coefficient
    }

    /// The `B` term of `volume = A * pulse^B`.
    pub fn nonlinearity_exponent(&self) -> f64 {
        self.nonlinearity_exponent
    }

    /// Total volume dispensed this run, from the shared tracker.
    pub fn dispensed_volume_ul(&self) -> ModuleResult<f64> {
        Ok(self.tracker.read(TRACKER_VOLUME)?)
    }

    pub fn initialize_remote_assets(&mut self) -> ModuleResult<()> {
        self.cycle_timer = Some(MicrosTimer::start());
        Ok(())
    }

    pub fn terminate_remote_assets(&mut self) {
        self.cycle_timer = None;
    }

    /// Tracks valve state transitions and accumulates dispensed volume on
    /// each open→closed transition.
    pub fn process_received_data(&mut self, event: ModuleEvent<'_>) {
        match event.event() {
            VALVE_OPEN => {
                if self.config.debug {
                    log::debug!("valve {} opened", self.core.module_id);
                }
                if !self.valve_open {
                    if let Some(timer) = self.cycle_timer.as_mut() {
                        timer.reset();
                    }
                }
                self.valve_open = true;
                let _ = self.tracker.write(TRACKER_STATE, 1.0);
            }
            VALVE_CLOSED => {
                if self.config.debug {
                    log::debug!("valve {} closed", self.core.module_id);
                }
                if self.valve_open {
                    if let Some(timer) = self.cycle_timer.as_ref() {
                        let open_us = timer.elapsed_us();
                        let delivered = self.scale_coefficient
                            * f64::powf(open_us as f64, self.nonlinearity_exponent);
                        let total =
                            self.tracker.read(TRACKER_VOLUME).unwrap_or(0.0) + delivered;
                        let _ = self.tracker.write(TRACKER_VOLUME, total);
                    }
                }
                self.valve_open = false;
                let _ = self.tracker.write(TRACKER_STATE, 0.0);
            }
            VALVE_CALIBRATED => {
                log::info!("valve {} calibration cycle complete", self.core.module_id);
            }
            other => {
                log::warn!(
                    "valve {} received unexpected event {other}; skipped",
                    self.core.module_id
                );
            }
        }
    }

    /// App-side command handle for this valve.
    pub fn commands(&self, queue: CommandQueue) -> ValveCommands {
        ValveCommands {
            module_type: self.core.module_type,
            module_id: self.core.module_id,
            scale_coefficient: self.scale_coefficient,
            nonlinearity_exponent: self.nonlinearity_exponent,
            config: self.config.clone(),
            queue,
            last_pulse_us: None,
        }
    }

    /// Pairs open events with the next closed event and converts each pulse
    /// to volume; emits the cumulative series with an initial zero row at
    /// the onset timestamp.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        let levels = merged_levels(events, VALVE_OPEN, VALVE_CLOSED);

        let mut timestamp_us = vec![0u64];
        let mut volume_ul = vec![0.0f64];

        let any_open = levels.iter().any(|&(_, level)| level == 1);
        if !any_open {
            // No fluid moved; report a single zero row at the first closed
            // timestamp when one exists.
            if let Some(&(ts, _)) = levels.first() {
                timestamp_us.push(ts);
                volume_ul.push(0.0);
            }
            return ModuleSeries::CumulativeVolume {
                timestamp_us,
                volume_ul,
            };
        }

        let mut cumulative = 0.0f64;
        let mut open_since: Option<u64> = None;
        for &(ts, level) in &levels {
            match (level, open_since) {
                (1, None) => open_since = Some(ts),
                (0, Some(opened)) => {
                    let pulse_us = ts.saturating_sub(opened) as f64;
                    cumulative +=
                        self.scale_coefficient * f64::powf(pulse_us, self.nonlinearity_exponent);
                    timestamp_us.push(ts);
                    volume_ul.push(round_decimals(cumulative, 8));
                    open_since = None;
                }
                // Repeated levels in one direction: keep the earliest open,
                // ignore redundant closes.
                _ => {}
            }
        }

        ModuleSeries::CumulativeVolume {
            timestamp_us,
            volume_ul,
        }
    }
}

/// App-side valve command builder.
///
/// Holds the calibration constants and the last applied pulse duration so
/// repeat dispenses of the same volume skip the parameter message.
pub struct ValveCommands {
    module_type: u8,
    module_id: u8,
    scale_coefficient: f64,
    nonlinearity_exponent: f64,
    config: ValveConfig,
    queue: CommandQueue,
    last_pulse_us: Option<u32>,
}

impl ValveCommands {
    /// Smallest volume the valve dispenses reliably, from the calibration
    /// lower bound.
    pub fn minimum_volume_ul(&self) -> f64 {
        self.scale_coefficient
            * f64::powf(
                f64::from(self.config.min_pulse_us),
                self.nonlinearity_exponent,
            )
    }

    /// Inverts the calibration: microsecond pulse for a target volume.
    pub fn pulse_for_volume(&self, volume_ul: f64) -> ModuleResult<u32> {
        let minimum = self.minimum_volume_ul();
        if volume_ul < minimum {
            return Err(ModuleError::VolumeTooSmall {
                requested_ul: volume_ul,
                minimum_ul: minimum,
            });
        }
        let pulse =
            f64::powf(volume_ul / self.scale_coefficient, 1.0 / self.nonlinearity_exponent);
        Ok(pulse.round() as u32)
    }

    /// Dispenses `volume_ul` once. A volume change re-sends the parameter
    /// message before pulsing; repeats go straight to the pulse command.
    pub fn dispense_volume(&mut self, volume_ul: f64, noblock: bool) -> ModuleResult<()> {
        let pulse_us = self.pulse_for_volume(volume_ul)?;
        if self.last_pulse_us != Some(pulse_us) {
            self.set_parameters(ValveParameters {
                pulse_duration_us: pulse_us,
                calibration_delay_us: self.config.calibration_delay_us,
                calibration_count: self.config.calibration_count,
            })?;
        }
        self.queue
            .send_command(self.module_type, self.module_id, CMD_PULSE, noblock, 0)
    }

    /// Pulses with the previously applied duration; repeats every
    /// `repetition_delay_us` when non-zero.
    pub fn send_pulse(&self, repetition_delay_us: u32, noblock: bool) -> ModuleResult<()> {
        self.queue.send_command(
            self.module_type,
            self.module_id,
            CMD_PULSE,
            noblock,
            repetition_delay_us,
        )
    }

    /// Locks the valve permanently open (`true`) or closed (`false`).
    pub fn toggle(&self, open: bool) -> ModuleResult<()> {
        let command = if open { CMD_OPEN } else { CMD_CLOSE };
        self.queue
            .send_command(self.module_type, self.module_id, command, false, 0)
    }

    /// Runs one calibration cycle with the last applied parameters. The
    /// device blocks until all pulses complete.
    pub fn calibrate(&self) -> ModuleResult<()> {
        self.queue
            .send_command(self.module_type, self.module_id, CMD_CALIBRATE, false, 0)
    }

    /// Applies new runtime parameters to the device.
    pub fn set_parameters(&mut self, parameters: ValveParameters) -> ModuleResult<()> {
        self.queue.send(Message::Parameters(ParameterMessage {
            module_type: self.module_type,
            module_id: self.module_id,
            return_code: 0,
            data: parameters.pack(),
        }))?;
        self.last_pulse_us = Some(parameters.pulse_duration_us);
        Ok(())
    }

    /// Clears pending valve commands on the device.
    pub fn reset_command_queue(&self) -> ModuleResult<()> {
        self.queue.send_dequeue(self.module_type, self.module_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::EventRecord;
    use crossbeam_channel::unbounded;

    const SAMPLES: [(f64, f64); 4] = [
        (15_000.0, 1.10),
        (30_000.0, 3.00),
        (45_000.0, 6.25),
        (60_000.0, 10.90),
    ];

    fn valve(module_id: u8) -> ValveInterface {
        ValveInterface::new(module_id, &SAMPLES, ValveConfig::default()).expect("valve")
    }

    fn state(event: u8) -> wire::ModuleState {
        wire::ModuleState {
            module_type: VALVE_TYPE,
            module_id: 61,
            command: CMD_PULSE,
            event,
        }
    }

    #[test]
    fn dispense_below_minimum_volume_fails() {
        let valve = valve(60);
        let (tx, _rx) = unbounded();
        let mut commands = valve.commands(CommandQueue::attached(tx));
        let minimum = commands.minimum_volume_ul();
        let result = commands.dispense_volume(minimum * 0.5, false);
        assert!(matches!(result, Err(ModuleError::VolumeTooSmall { .. })));
        // The boundary itself is accepted.
        commands.dispense_volume(minimum, false).expect("boundary");
    }

    #[test]
    fn repeat_dispense_skips_parameter_message() {
        let valve = valve(62);
        let (tx, rx) = unbounded();
        let mut commands = valve.commands(CommandQueue::attached(tx));

        commands.dispense_volume(5.0, false).expect("dispense");
        commands.dispense_volume(5.0, false).expect("repeat");

        let sent: Vec<Message> = rx.try_iter().collect();
        let parameter_count = sent
            .iter()
            .filter(|m| matches!(m, Message::Parameters(_)))
            .count();
        let pulse_count = sent
            .iter()
            .filter(|m| matches!(m, Message::OneOff(c) if c.command == CMD_PULSE))
            .count();
        assert_eq!(parameter_count, 1);
        assert_eq!(pulse_count, 2);
    }

    #[test]
    fn open_close_cycle_accumulates_tracked_volume() {
        let mut valve = valve(63);
        valve.initialize_remote_assets().expect("init");

        let target_ul = 5.0;
        let (tx, _rx) = unbounded();
        let pulse_us = valve
            .commands(CommandQueue::attached(tx))
            .pulse_for_volume(target_ul)
            .expect("pulse");

        valve.process_received_data(ModuleEvent::State(&state(VALVE_OPEN)));
        // Hold the valve "open" for the calibrated pulse duration with the
        // spin timer, then close it.
        let hold = MicrosTimer::start();
        hold.delay_blocking(u64::from(pulse_us));
        valve.process_received_data(ModuleEvent::State(&state(VALVE_CLOSED)));

        let dispensed = valve.dispensed_volume_ul().expect("tracker");
        let error = (dispensed - target_ul).abs() / target_ul;
        assert!(
            error < 0.01,
            "dispensed {dispensed} uL, expected ~{target_ul} uL (error {error})"
        );
        valve.terminate_remote_assets();
    }

    #[test]
    fn parse_pairs_pulses_into_cumulative_volume() {
        let valve = valve(64);
        let a = valve.scale_coefficient();
        let b = valve.nonlinearity_exponent();

        let mut events = EventMap::new();
        events.insert(
            VALVE_OPEN,
            vec![
                EventRecord {
                    timestamp_us: 1_000,
                    object: None,
                },
                EventRecord {
                    timestamp_us: 100_000,
                    object: None,
                },
            ],
        );
        events.insert(
            VALVE_CLOSED,
            vec![
                EventRecord {
                    timestamp_us: 31_000,
                    object: None,
                },
                EventRecord {
                    timestamp_us: 145_000,
                    object: None,
                },
            ],
        );

        let series = valve.parse_logged_data(&events);
        let ModuleSeries::CumulativeVolume {
            timestamp_us,
            volume_ul,
        } = series
        else {
            panic!("wrong series kind");
        };

        assert_eq!(timestamp_us, vec![0, 31_000, 145_000]);
        let first = a * f64::powf(30_000.0, b);
        let second = first + a * f64::powf(45_000.0, b);
        assert_eq!(volume_ul[0], 0.0);
        assert!((volume_ul[1] - first).abs() < 1e-6);
        assert!((volume_ul[2] - second).abs() < 1e-6);
        // Monotone accumulation.
        assert!(volume_ul.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn parse_without_open_events_reports_zero_volume() {
        let valve = valve(65);
        let mut events = EventMap::new();
        events.insert(
            VALVE_CLOSED,
            vec![EventRecord {
                timestamp_us: 777,
                object: None,
            }],
        );

        let series = valve.parse_logged_data(&events);
        let ModuleSeries::CumulativeVolume {
            timestamp_us,
            volume_ul,
        } = series
        else {
            panic!("wrong series kind");
        };
        assert_eq!(timestamp_us, vec![0, 777]);
        assert_eq!(volume_ul, vec![0.0, 0.0]);
    }
}
