//! Quadrature encoder interface: wheel position and running speed.
//!
//! Pulse counts arrive as separate CCW/CW events. The live path integrates
//! them into absolute position and publishes a 100 ms smoothed speed to the
//! shared tracker; extraction rebuilds the cumulative position series from
//! the logged pulses.

use smallvec::SmallVec;
use timekit::MicrosTimer;
use tracker::{tracker_name, SharedTracker};
use wire::{Message, ParameterMessage};

use crate::base::{sorted_events, CommandQueue, EventMap, ModuleCore, ModuleEvent};
use crate::bus::{null_bus, BusHandle};
use crate::calibration::round_decimals;
use crate::series::ModuleSeries;
use crate::{ModuleError, ModuleResult};

pub const ENCODER_TYPE: u8 = 2;

/// Encoder event codes.
pub const ENCODER_CCW: u8 = 51;
pub const ENCODER_CW: u8 = 52;
pub const ENCODER_PPR: u8 = 53;

/// Encoder command codes.
pub const CMD_CHECK_STATE: u8 = 1;
pub const CMD_RESET_COUNT: u8 = 2;
pub const CMD_GET_PPR: u8 = 3;

/// Tracker layout: index 0 is the smoothed running speed in cm/s.
pub const TRACKER_SPEED: usize = 0;

/// Width of the speed smoothing window.
const SPEED_WINDOW_US: u64 = 100_000;

/// Topic carrying signed motion deltas (f64 little-endian, in bridge units).
pub const MOTION_TOPIC: &str = "treadmill/motion";

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Quadrature pulses per full revolution.
    pub ppr: u32,
    /// Wheel diameter, cm. The fraction absorbs the wheel wrap thickness.
    pub wheel_diameter_cm: f64,
    /// Centimeters per bridge unit; enables motion publishing when set.
    pub cm_per_bridge_unit: Option<f64>,
    pub debug: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ppr: 8_192,
            wheel_diameter_cm: 15.0333,
            cm_per_bridge_unit: None,
            debug: false,
        }
    }
}

/// Packed device parameters for the encoder module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderParameters {
    pub report_ccw: bool,
    pub report_cw: bool,
    /// Minimum pulse delta per report.
    pub delta_threshold: u32,
}

impl EncoderParameters {
    pub fn pack(&self) -> SmallVec<[u8; 16]> {
        let mut data = SmallVec::new();
        data.push(u8::from(self.report_ccw));
        data.push(u8::from(self.report_cw));
        data.extend_from_slice(&self.delta_threshold.to_le_bytes());
        data
    }
}

/// Worker-side encoder interface.
pub struct EncoderInterface {
    core: ModuleCore,
    config: EncoderConfig,
    cm_per_pulse: f64,
    bridge_units_per_pulse: Option<f64>,
    tracker: SharedTracker<f64>,
    bus: BusHandle,
    speed_timer: Option<MicrosTimer>,
    current_position_cm: f64,
    previous_position_cm: f64,
}

impl EncoderInterface {
    pub fn new(module_id: u8, config: EncoderConfig) -> ModuleResult<Self> {
        if config.ppr == 0 || config.wheel_diameter_cm <= 0.0 {
            return Err(ModuleError::InvalidCalibration(
                "encoder ppr and wheel diameter must be positive",
            ));
        }

        let mut core = ModuleCore::new(ENCODER_TYPE, module_id);
        core.data_codes
            .extend_from_slice(&[ENCODER_CCW, ENCODER_CW, ENCODER_PPR]);

        let cm_per_pulse = round_decimals(
            std::f64::consts::PI * config.wheel_diameter_cm / f64::from(config.ppr),
            8,
        );
        let bridge_units_per_pulse = config.cm_per_bridge_unit.map(|cm_per_unit| {
            round_decimals(
                std::f64::consts::PI * config.wheel_diameter_cm
                    / (f64::from(config.ppr) * cm_per_unit),
                8,
            )
        });
        if bridge_units_per_pulse.is_some() {
            core.command_topics.push(MOTION_TOPIC);
        }

        let mut tracker =
            SharedTracker::create(&tracker_name(ENCODER_TYPE, module_id, "speed"), 1, true)?;
        tracker.set_destroy_on_drop(true);

        Ok(Self {
            core,
            config,
            cm_per_pulse,
            bridge_units_per_pulse,
            tracker,
            bus: null_bus(),
            speed_timer: None,
            current_position_cm: 0.0,
            previous_position_cm: 0.0,
        })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    /// Centimeters of wheel surface per quadrature pulse.
    pub fn cm_per_pulse(&self) -> f64 {
        self.cm_per_pulse
    }

    /// Smoothed running speed in cm/s, from the shared tracker.
    pub fn speed_cm_s(&self) -> ModuleResult<f64> {
        Ok(self.tracker.read(TRACKER_SPEED)?)
    }

    /// Attaches the pub/sub bridge used for motion publishing.
    pub fn attach_bus(&mut self, bus: BusHandle) {
        self.bus = bus;
    }

    pub fn initialize_remote_assets(&mut self) -> ModuleResult<()> {
        self.speed_timer = Some(MicrosTimer::start());
        self.current_position_cm = 0.0;
        self.previous_position_cm = 0.0;
        Ok(())
    }

    pub fn terminate_remote_assets(&mut self) {
        self.speed_timer = None;
    }

    pub fn process_received_data(&mut self, event: ModuleEvent<'_>) {
        let sign = match event.event() {
            ENCODER_CCW => 1.0,
            ENCODER_CW => -1.0,
            ENCODER_PPR => {
                log::info!(
                    "encoder {} reports ppr {}",
                    self.core.module_id,
                    event.object_u64().unwrap_or(0)
                );
                return;
            }
            other => {
                log::warn!(
                    "encoder {} received unexpected event {other}; skipped",
                    self.core.module_id
                );
                return;
            }
        };
        let Some(pulses) = event.object_u64() else {
            log::warn!(
                "encoder {} motion event without a readable payload; skipped",
                self.core.module_id
            );
            return;
        };

        let motion_cm = round_decimals(pulses as f64 * self.cm_per_pulse * sign, 8);
        self.current_position_cm += motion_cm;
        if self.config.debug {
            log::debug!("encoder {} moved {motion_cm} cm", self.core.module_id);
        }

        // Refresh the smoothed speed once the window elapses.
        if let Some(timer) = self.speed_timer.as_mut() {
            let elapsed_us = timer.elapsed_us();
            if elapsed_us >= SPEED_WINDOW_US {
                timer.reset();
                let distance = (self.current_position_cm - self.previous_position_cm).abs();
                let speed = distance / (elapsed_us as f64) * 1_000_000.0;
                let _ = self.tracker.write(TRACKER_SPEED, speed);
                self.previous_position_cm = self.current_position_cm;
            }
        }

        // Mirror the signed motion onto the bridge when configured.
        if let Some(units_per_pulse) = self.bridge_units_per_pulse {
            let movement = round_decimals(pulses as f64 * units_per_pulse * sign, 8);
            self.bus.publish(MOTION_TOPIC, &movement.to_le_bytes());
        }
    }

    /// App-side command handle.
    pub fn commands(&self, queue: CommandQueue) -> EncoderCommands {
        EncoderCommands {
            module_type: self.core.module_type,
            module_id: self.core.module_id,
            queue,
        }
    }

    /// Cumulative absolute position in centimeters.
    ///
    /// A direction with no logged events gets one synthetic zero-pulse entry
    /// 1 µs after the other direction's first event, keeping the merge total
    /// without affecting the integral.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        let mut ccw = sorted_events(events, ENCODER_CCW);
        let mut cw = sorted_events(events, ENCODER_CW);

        if ccw.is_empty() && cw.is_empty() {
            return ModuleSeries::Position {
                timestamp_us: Vec::new(),
                position_cm: Vec::new(),
            };
        }
        if ccw.is_empty() {
            ccw.push((cw[0].0 + 1, 0));
        } else if cw.is_empty() {
            cw.push((ccw[0].0 + 1, 0));
        }

        let mut rows: Vec<(u64, f64)> = Vec::with_capacity(ccw.len() + cw.len());
        rows.extend(
            ccw.into_iter()
                .map(|(ts, pulses)| (ts, pulses as f64 * self.cm_per_pulse)),
        );
        rows.extend(
            cw.into_iter()
                .map(|(ts, pulses)| (ts, -(pulses as f64) * self.cm_per_pulse)),
        );
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut cumulative = 0.0f64;
        let mut timestamp_us = Vec::with_capacity(rows.len());
        let mut position_cm = Vec::with_capacity(rows.len());
        for (ts, displacement) in rows {
            cumulative += displacement;
            timestamp_us.push(ts);
            position_cm.push(round_decimals(cumulative, 8));
        }

        ModuleSeries::Position {
            timestamp_us,
            position_cm,
        }
    }
}

/// App-side encoder command builder.
pub struct EncoderCommands {
    module_type: u8,
    module_id: u8,
    queue: CommandQueue,
}

impl EncoderCommands {
    /// Reports accumulated motion; repeats every `repetition_delay_us` when
    /// non-zero.
    pub fn check_state(&self, repetition_delay_us: u32) -> ModuleResult<()> {
        self.queue.send_command(
            self.module_type,
            self.module_id,
            CMD_CHECK_STATE,
            true,
            repetition_delay_us,
        )
    }

    /// Zeroes the device-side pulse counter.
    pub fn reset_pulse_count(&self) -> ModuleResult<()> {
        self.queue
            .send_command(self.module_type, self.module_id, CMD_RESET_COUNT, true, 0)
    }

    /// Estimates PPR from the index channel; the device reports an
    /// [`ENCODER_PPR`] event.
    pub fn get_ppr(&self) -> ModuleResult<()> {
        self.queue
            .send_command(self.module_type, self.module_id, CMD_GET_PPR, false, 0)
    }

    pub fn set_parameters(&self, parameters: EncoderParameters) -> ModuleResult<()> {
        self.queue.send(Message::Parameters(ParameterMessage {
            module_type: self.module_type,
            module_id: self.module_id,
            return_code: 0,
            data: parameters.pack(),
        }))
    }

    pub fn reset_command_queue(&self) -> ModuleResult<()> {
        self.queue.send_dequeue(self.module_type, self.module_id)
    }
}
