//! Conductive lick sensor interface.
//!
//! The device reports ADC voltage changes on the lick tube; the host
//! thresholds them, debounces on the mandatory zero between tongue
//! contacts, and keeps the monotone lick count in a shared tracker for
//! closed-loop consumers.

use smallvec::SmallVec;
use tracker::{tracker_name, SharedTracker};
use wire::{Message, ParameterMessage};

use crate::base::{sorted_events, CommandQueue, EventMap, ModuleCore, ModuleEvent};
use crate::calibration::round_decimals;
use crate::series::ModuleSeries;
use crate::ModuleResult;

pub const LICK_TYPE: u8 = 4;

/// The only lick event: the sensed voltage changed.
pub const LICK_VOLTAGE_CHANGED: u8 = 51;

/// Command code: report the current sensor state.
pub const CMD_CHECK_STATE: u8 = 1;

/// Tracker layout: index 0 is the monotone lick count.
pub const TRACKER_COUNT: usize = 0;

/// 12-bit ADC referenced to 3.3 V.
pub fn volts_per_adc() -> f64 {
    round_decimals(3.3 / f64::from((1u32 << 12) - 1), 12)
}

/// Device-side detection parameters plus the host-side lick threshold.
#[derive(Debug, Clone, Copy)]
pub struct LickConfig {
    /// ADC level the device must see before reporting at all.
    pub signal_threshold: u16,
    /// Minimum ADC delta between consecutive reports.
    pub delta_threshold: u16,
    /// Device-side smoothing pool size.
    pub averaging_pool_size: u8,
    /// Host-side threshold separating licks from noise; inclusive.
    pub lick_threshold: u16,
    pub debug: bool,
}

impl Default for LickConfig {
    fn default() -> Self {
        Self {
            signal_threshold: 200,
            delta_threshold: 180,
            averaging_pool_size: 30,
            lick_threshold: 1000,
            debug: false,
        }
    }
}

/// Packed device parameters for the lick module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LickParameters {
    pub signal_threshold: u16,
    pub delta_threshold: u16,
    pub averaging_pool_size: u8,
}

impl LickParameters {
    pub fn pack(&self) -> SmallVec<[u8; 16]> {
        let mut data = SmallVec::new();
        data.extend_from_slice(&self.signal_threshold.to_le_bytes());
        data.extend_from_slice(&self.delta_threshold.to_le_bytes());
        data.push(self.averaging_pool_size);
        data
    }
}

/// Worker-side lick interface.
pub struct LickInterface {
    core: ModuleCore,
    config: LickConfig,
    tracker: SharedTracker<u64>,
    /// A zero readout must be observed before the next lick can count; the
    /// sensor is pulled to zero between tongue contacts.
    observed_zero: bool,
}

impl LickInterface {
    pub fn new(module_id: u8, config: LickConfig) -> ModuleResult<Self> {
        let mut core = ModuleCore::new(LICK_TYPE, module_id);
        core.data_codes.push(LICK_VOLTAGE_CHANGED);
        core.command_topics.push("lick/state");

        let mut tracker =
            SharedTracker::create(&tracker_name(LICK_TYPE, module_id, "lick"), 1, true)?;
        tracker.set_destroy_on_drop(true);

        Ok(Self {
            core,
            config,
            tracker,
            observed_zero: false,
        })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    pub fn lick_threshold(&self) -> u16 {
        self.config.lick_threshold
    }

    pub fn lick_count(&self) -> ModuleResult<u64> {
        Ok(self.tracker.read(TRACKER_COUNT)?)
    }

    pub fn initialize_remote_assets(&mut self) -> ModuleResult<()> {
        Ok(())
    }

    pub fn terminate_remote_assets(&mut self) {}

    /// Counts one lick per zero→above-threshold transition.
    pub fn process_received_data(&mut self, event: ModuleEvent<'_>) {
        if event.event() != LICK_VOLTAGE_CHANGED {
            return;
        }
        let Some(adc) = event.object_u64() else {
            log::warn!(
                "lick {} voltage event without a readable payload; skipped",
                self.core.module_id
            );
            return;
        };
        if self.config.debug {
            log::debug!("lick {} adc {adc}", self.core.module_id);
        }

        if adc == 0 {
            self.observed_zero = true;
            return;
        }
        if adc >= u64::from(self.config.lick_threshold) && self.observed_zero {
            let count = self.tracker.read(TRACKER_COUNT).unwrap_or(0) + 1;
            let _ = self.tracker.write(TRACKER_COUNT, count);
            self.observed_zero = false;
        }
    }

    /// App-side command handle.
    pub fn commands(&self, queue: CommandQueue) -> LickCommands {
        LickCommands {
            module_type: self.core.module_type,
            module_id: self.core.module_id,
            queue,
        }
    }

    /// Emits the full `(timestamp, adc, state)` triple with the state
    /// re-derived from the current threshold, so analyses can re-threshold
    /// offline.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        let rows = sorted_events(events, LICK_VOLTAGE_CHANGED);
        let threshold = u64::from(self.config.lick_threshold);

        let mut timestamp_us = Vec::with_capacity(rows.len());
        let mut adc_value = Vec::with_capacity(rows.len());
        let mut lick_state = Vec::with_capacity(rows.len());
        for (ts, adc) in rows {
            timestamp_us.push(ts);
            adc_value.push(adc as u16);
            lick_state.push(u8::from(adc >= threshold));
        }

        ModuleSeries::LickStates {
            timestamp_us,
            adc_value,
            lick_state,
        }
    }
}

/// App-side lick command builder.
pub struct LickCommands {
    module_type: u8,
    module_id: u8,
    queue: CommandQueue,
}

impl LickCommands {
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

    pub fn set_parameters(&self, parameters: LickParameters) -> ModuleResult<()> {
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

    /// Converts a voltage on the sensor pin to ADC units.
    pub fn adc_from_volts(&self, voltage: f64) -> u16 {
        (voltage / volts_per_adc()).round() as u16
    }
}
