//! Wheel brake interface: PWM-driven resistive torque.
//!
//! The brake motor couples to the running wheel; engaged it applies its
//! maximum torque, disengaged it still drags at the minimum coupling
//! torque. Strength calibration maps PWM 0..255 linearly between the two.

use smallvec::SmallVec;
use wire::{Message, ParameterMessage};

use crate::base::{CommandQueue, EventMap, ModuleCore, ModuleEvent};
use crate::calibration::round_decimals;
use crate::series::ModuleSeries;
use crate::ModuleResult;

pub const BRAKE_TYPE: u8 = 3;

/// Brake event codes.
pub const BRAKE_OUTPUT_LOCKED: u8 = 51;
pub const BRAKE_ENGAGED: u8 = 52;
pub const BRAKE_DISENGAGED: u8 = 53;

/// Brake command codes.
pub const CMD_ENGAGE: u8 = 1;
pub const CMD_DISENGAGE: u8 = 2;
pub const CMD_SET_POWER: u8 = 3;

/// Newton-centimeters per gram-centimeter.
pub const NCM_PER_GCM: f64 = 0.00980665;

#[derive(Debug, Clone)]
pub struct BrakeConfig {
    /// Residual torque with the brake disengaged, g·cm.
    pub minimum_torque_gcm: f64,
    /// Torque with the brake fully engaged, g·cm.
    pub maximum_torque_gcm: f64,
    pub debug: bool,
}

impl Default for BrakeConfig {
    fn default() -> Self {
        Self {
            minimum_torque_gcm: 100.0,
            maximum_torque_gcm: 1_200.0,
            debug: false,
        }
    }
}

/// Packed device parameters: the PWM strength applied by
/// [`BrakeCommands::set_breaking_power`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrakeParameters {
    pub breaking_strength: u8,
}

impl BrakeParameters {
    pub fn pack(&self) -> SmallVec<[u8; 16]> {
        SmallVec::from_slice(&[self.breaking_strength])
    }
}

/// Worker-side brake interface.
pub struct BrakeInterface {
    core: ModuleCore,
    config: BrakeConfig,
    minimum_torque_ncm: f64,
    maximum_torque_ncm: f64,
    torque_per_pwm: f64,
}

impl BrakeInterface {
    pub fn new(module_id: u8, config: BrakeConfig) -> ModuleResult<Self> {
        let mut core = ModuleCore::new(BRAKE_TYPE, module_id);
        core.error_codes.push(BRAKE_OUTPUT_LOCKED);
        if config.debug {
            core.data_codes
                .extend_from_slice(&[BRAKE_ENGAGED, BRAKE_DISENGAGED]);
        }

        let minimum_torque_ncm = round_decimals(config.minimum_torque_gcm * NCM_PER_GCM, 8);
        let maximum_torque_ncm = round_decimals(config.maximum_torque_gcm * NCM_PER_GCM, 8);
        let torque_per_pwm =
            round_decimals((maximum_torque_ncm - minimum_torque_ncm) / 255.0, 8);

        Ok(Self {
            core,
            config,
            minimum_torque_ncm,
            maximum_torque_ncm,
            torque_per_pwm,
        })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    pub fn minimum_torque_ncm(&self) -> f64 {
        self.minimum_torque_ncm
    }

    pub fn maximum_torque_ncm(&self) -> f64 {
        self.maximum_torque_ncm
    }

    /// N·cm added per PWM unit of breaking strength.
    pub fn torque_per_pwm(&self) -> f64 {
        self.torque_per_pwm
    }

    pub fn initialize_remote_assets(&mut self) -> ModuleResult<()> {
        Ok(())
    }

    pub fn terminate_remote_assets(&mut self) {}

    pub fn process_received_data(&mut self, event: ModuleEvent<'_>) {
        if !self.config.debug {
            return;
        }
        match event.event() {
            BRAKE_ENGAGED => log::debug!("brake {} engaged", self.core.module_id),
            BRAKE_DISENGAGED => log::debug!("brake {} disengaged", self.core.module_id),
            other => log::debug!("brake {} event {other}", self.core.module_id),
        }
    }

    /// App-side command handle.
    pub fn commands(&self, queue: CommandQueue) -> BrakeCommands {
        BrakeCommands {
            module_type: self.core.module_type,
            module_id: self.core.module_id,
            minimum_torque_ncm: self.minimum_torque_ncm,
            torque_per_pwm: self.torque_per_pwm,
            queue,
        }
    }

    /// Torque series: maximum torque on each engage, minimum on each
    /// disengage, timestamp-sorted.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        let mut rows: Vec<(u64, f64)> = Vec::new();
        if let Some(records) = events.get(&BRAKE_ENGAGED) {
            rows.extend(
                records
                    .iter()
                    .map(|r| (r.timestamp_us, self.maximum_torque_ncm)),
            );
        }
        if let Some(records) = events.get(&BRAKE_DISENGAGED) {
            rows.extend(
                records
                    .iter()
                    .map(|r| (r.timestamp_us, self.minimum_torque_ncm)),
            );
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        ModuleSeries::Torque {
            timestamp_us: rows.iter().map(|&(ts, _)| ts).collect(),
            torque_ncm: rows.iter().map(|&(_, torque)| torque).collect(),
        }
    }
}

/// App-side brake command builder.
pub struct BrakeCommands {
    module_type: u8,
    module_id: u8,
    minimum_torque_ncm: f64,
    torque_per_pwm: f64,
    queue: CommandQueue,
}

impl BrakeCommands {
    /// PWM value whose applied torque is closest to `target_ncm`.
    pub fn pwm_from_torque(&self, target_ncm: f64) -> u8 {
        let pwm = (target_ncm - self.minimum_torque_ncm) / self.torque_per_pwm;
        pwm.round().clamp(0.0, 255.0) as u8
    }

    /// Engages (`true`) or disengages (`false`) the brake at full strength.
    pub fn toggle(&self, engage: bool) -> ModuleResult<()> {
        let command = if engage { CMD_ENGAGE } else { CMD_DISENGAGE };
        self.queue
            .send_command(self.module_type, self.module_id, command, false, 0)
    }

    /// Applies the last-set variable breaking strength.
    pub fn set_breaking_power(&self) -> ModuleResult<()> {
        self.queue
            .send_command(self.module_type, self.module_id, CMD_SET_POWER, false, 0)
    }

    pub fn set_parameters(&self, parameters: BrakeParameters) -> ModuleResult<()> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::EventRecord;

    fn brake() -> BrakeInterface {
        BrakeInterface::new(1, BrakeConfig::default()).expect("brake")
    }

    fn record(ts: u64) -> EventRecord {
        EventRecord {
            timestamp_us: ts,
            object: None,
        }
    }

    #[test]
    fn torque_bounds_convert_to_newton_centimeters() {
        let brake = brake();
        assert!((brake.minimum_torque_ncm() - 0.980665).abs() < 1e-6);
        assert!((brake.maximum_torque_ncm() - 11.76798).abs() < 1e-5);
    }

    #[test]
    fn pwm_mapping_covers_both_ends() {
        let brake = brake();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let commands = brake.commands(CommandQueue::attached(tx));
        assert_eq!(commands.pwm_from_torque(brake.minimum_torque_ncm()), 0);
        assert_eq!(commands.pwm_from_torque(brake.maximum_torque_ncm()), 255);
        // Out-of-range targets clamp instead of wrapping.
        assert_eq!(commands.pwm_from_torque(-5.0), 0);
        assert_eq!(commands.pwm_from_torque(1_000.0), 255);
    }

    #[test]
    fn parse_maps_states_to_torque_levels() {
        let brake = brake();
        let mut events = EventMap::new();
        events.insert(BRAKE_ENGAGED, vec![record(100), record(300)]);
        events.insert(BRAKE_DISENGAGED, vec![record(200)]);

        let ModuleSeries::Torque {
            timestamp_us,
            torque_ncm,
        } = brake.parse_logged_data(&events)
        else {
            panic!("wrong series kind");
        };
        assert_eq!(timestamp_us, vec![100, 200, 300]);
        assert_eq!(
            torque_ncm,
            vec![
                brake.maximum_torque_ncm(),
                brake.minimum_torque_ncm(),
                brake.maximum_torque_ncm()
            ]
        );
    }
}
