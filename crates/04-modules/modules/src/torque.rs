//! Wheel torque sensor interface.
//!
//! The sensor reports amplified differential ADC samples, split into CCW
//! (positive) and CW (negative) events. The ADC→N·cm scale derives from the
//! sensor capacity and its voltage span; treat extracted torques as a rough
//! activity estimate rather than a precision measurement.

use smallvec::SmallVec;
use wire::{Message, ParameterMessage};

use crate::base::{sorted_events, CommandQueue, EventMap, ModuleCore, ModuleEvent};
use crate::calibration::round_decimals;
use crate::lick::volts_per_adc;
use crate::series::ModuleSeries;
use crate::{ModuleError, ModuleResult};

pub const TORQUE_TYPE: u8 = 6;

/// Torque event codes. CCW carries positive sign downstream, CW negative.
pub const TORQUE_CCW: u8 = 51;
pub const TORQUE_CW: u8 = 52;

/// Command code: report the current torque readout.
pub const CMD_CHECK_STATE: u8 = 1;

#[derive(Debug, Clone)]
pub struct TorqueConfig {
    /// Sensor output at zero torque, volts.
    pub baseline_voltage: f64,
    /// Sensor output at rated capacity, volts.
    pub maximum_voltage: f64,
    /// Rated sensor capacity, N·cm.
    pub sensor_capacity_ncm: f64,
    /// Wheel radius used to expose force-per-ADC, cm.
    pub wheel_radius_cm: f64,
    pub debug: bool,
}

impl Default for TorqueConfig {
    fn default() -> Self {
        Self {
            baseline_voltage: 0.1,
            maximum_voltage: 3.3,
            sensor_capacity_ncm: 9.8,
            wheel_radius_cm: 7.5,
            debug: false,
        }
    }
}

/// Packed device parameters for the torque module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorqueParameters {
    pub report_ccw: bool,
    pub report_cw: bool,
    pub signal_threshold: u16,
    pub delta_threshold: u16,
    pub averaging_pool_size: u8,
}

impl TorqueParameters {
    pub fn pack(&self) -> SmallVec<[u8; 16]> {
        let mut data = SmallVec::new();
        data.push(u8::from(self.report_ccw));
        data.push(u8::from(self.report_cw));
        data.extend_from_slice(&self.signal_threshold.to_le_bytes());
        data.extend_from_slice(&self.delta_threshold.to_le_bytes());
        data.push(self.averaging_pool_size);
        data
    }
}

/// Worker-side torque interface.
pub struct TorqueInterface {
    core: ModuleCore,
    config: TorqueConfig,
    torque_per_adc: f64,
}

impl TorqueInterface {
    pub fn new(module_id: u8, config: TorqueConfig) -> ModuleResult<Self> {
        if config.maximum_voltage <= config.baseline_voltage {
            return Err(ModuleError::InvalidCalibration(
                "maximum voltage must exceed the baseline voltage",
            ));
        }
        let mut core = ModuleCore::new(TORQUE_TYPE, module_id);
        if config.debug {
            core.data_codes.extend_from_slice(&[TORQUE_CCW, TORQUE_CW]);
        }

        let torque_per_adc = round_decimals(
            config.sensor_capacity_ncm * volts_per_adc()
                / (config.maximum_voltage - config.baseline_voltage),
            8,
        );

        Ok(Self {
            core,
            config,
            torque_per_adc,
        })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    /// N·cm per ADC unit.
    pub fn torque_per_adc(&self) -> f64 {
        self.torque_per_adc
    }

    /// Newtons per ADC unit at the wheel surface.
    pub fn force_per_adc(&self) -> f64 {
        round_decimals(self.torque_per_adc / self.config.wheel_radius_cm, 8)
    }

    pub fn initialize_remote_assets(&mut self) -> ModuleResult<()> {
        Ok(())
    }

    pub fn terminate_remote_assets(&mut self) {}

    pub fn process_received_data(&mut self, event: ModuleEvent<'_>) {
        if !self.config.debug {
            return;
        }
        let adc = event.object_u64().unwrap_or(0);
        match event.event() {
            TORQUE_CCW => log::debug!("torque {} ccw adc {adc}", self.core.module_id),
            TORQUE_CW => log::debug!("torque {} cw adc {adc}", self.core.module_id),
            other => log::debug!("torque {} event {other}", self.core.module_id),
        }
    }

    /// App-side command handle.
    pub fn commands(&self, queue: CommandQueue) -> TorqueCommands {
        TorqueCommands {
            module_type: self.core.module_type,
            module_id: self.core.module_id,
            queue,
        }
    }

    /// Signed torque series: CCW positive, CW negative, timestamp-sorted.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        let mut rows: Vec<(u64, f64)> = Vec::new();
        for (ts, adc) in sorted_events(events, TORQUE_CCW) {
            rows.push((ts, round_decimals(adc as f64 * self.torque_per_adc, 8)));
        }
        for (ts, adc) in sorted_events(events, TORQUE_CW) {
            rows.push((ts, round_decimals(-(adc as f64) * self.torque_per_adc, 8)));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        ModuleSeries::Torque {
            timestamp_us: rows.iter().map(|&(ts, _)| ts).collect(),
            torque_ncm: rows.iter().map(|&(_, torque)| torque).collect(),
        }
    }
}

/// App-side torque command builder.
pub struct TorqueCommands {
    module_type: u8,
    module_id: u8,
    queue: CommandQueue,
}

impl TorqueCommands {
    /// Polls the sensor; repeats every `repetition_delay_us` when non-zero.
    pub fn check_state(&self, repetition_delay_us: u32) -> ModuleResult<()> {
        self.queue.send_command(
            self.module_type,
            self.module_id,
            CMD_CHECK_STATE,
            true,
            repetition_delay_us,
        )
    }

    pub fn set_parameters(&self, parameters: TorqueParameters) -> ModuleResult<()> {
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
