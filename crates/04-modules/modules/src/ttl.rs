//! TTL line interface: pulse output and level monitoring.
//!
//! One module instance drives or watches a single TTL pin. The monitoring
//! path feeds extraction with input-level transitions; its rising edges are
//! the canonical seed series for cross-source alignment. The first recorded
//! pulse is dropped when shorter than the configured blip filter: the
//! upstream acquisition device emits a short "start blip" when scanning
//! begins.

use smallvec::SmallVec;
use tracker::{tracker_name, SharedTracker};
use wire::{Message, ParameterMessage};

use crate::base::{merged_levels, rising_edges, CommandQueue, EventMap, ModuleCore, ModuleEvent};
use crate::series::ModuleSeries;
use crate::ModuleResult;

pub const TTL_TYPE: u8 = 1;

/// TTL event codes.
pub const TTL_OUTPUT_LOCKED: u8 = 51;
pub const TTL_INPUT_ON: u8 = 52;
pub const TTL_INPUT_OFF: u8 = 53;
pub const TTL_INVALID_PIN_MODE: u8 = 54;
pub const TTL_OUTPUT_ON: u8 = 55;
pub const TTL_OUTPUT_OFF: u8 = 56;

/// TTL command codes.
pub const CMD_SEND_PULSE: u8 = 1;
pub const CMD_TOGGLE_ON: u8 = 2;
pub const CMD_TOGGLE_OFF: u8 = 3;
pub const CMD_CHECK_STATE: u8 = 4;

/// Tracker layout (only with `report_pulses`): index 0 mirrors the input
/// level.
pub const TRACKER_LEVEL: usize = 0;

#[derive(Debug, Clone)]
pub struct TtlConfig {
    /// Mirror the input level into a shared tracker.
    pub report_pulses: bool,
    /// Drop the first extracted pulse when narrower than this. Host-side
    /// heuristic, not a device guarantee.
    pub blip_filter_us: u64,
    pub debug: bool,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            report_pulses: false,
            blip_filter_us: 10_000,
            debug: false,
        }
    }
}

/// Packed device parameters for the TTL module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlParameters {
    pub pulse_duration_us: u32,
    pub averaging_pool_size: u8,
}

impl TtlParameters {
    pub fn pack(&self) -> SmallVec<[u8; 16]> {
        let mut data = SmallVec::new();
        data.extend_from_slice(&self.pulse_duration_us.to_le_bytes());
        data.push(self.averaging_pool_size);
        data
    }
}

/// Worker-side TTL interface.
pub struct TtlInterface {
    core: ModuleCore,
    config: TtlConfig,
    tracker: Option<SharedTracker<u32>>,
}

impl TtlInterface {
    pub fn new(module_id: u8, config: TtlConfig) -> ModuleResult<Self> {
        let mut core = ModuleCore::new(TTL_TYPE, module_id);
        if config.report_pulses || config.debug {
            core.data_codes
                .extend_from_slice(&[TTL_INPUT_ON, TTL_INPUT_OFF]);
        }
        core.error_codes
            .extend_from_slice(&[TTL_OUTPUT_LOCKED, TTL_INVALID_PIN_MODE]);

        let tracker = if config.report_pulses {
            let mut tracker =
                SharedTracker::create(&tracker_name(TTL_TYPE, module_id, "pulse"), 1, true)?;
            tracker.set_destroy_on_drop(true);
            Some(tracker)
        } else {
            None
        };

        Ok(Self {
            core,
            config,
            tracker,
        })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    /// Current input level, when pulse reporting is enabled.
    pub fn input_high(&self) -> bool {
        self.tracker
            .as_ref()
            .and_then(|t| t.read(TRACKER_LEVEL).ok())
            .map(|level| level == 1)
            .unwrap_or(false)
    }

    pub fn initialize_remote_assets(&mut self) -> ModuleResult<()> {
        Ok(())
    }

    pub fn terminate_remote_assets(&mut self) {}

    pub fn process_received_data(&mut self, event: ModuleEvent<'_>) {
        match event.event() {
            TTL_INPUT_ON => {
                if self.config.debug {
                    log::debug!("ttl {} input high", self.core.module_id);
                }
                if let Some(tracker) = &self.tracker {
                    let _ = tracker.write(TRACKER_LEVEL, 1);
                }
            }
            TTL_INPUT_OFF => {
                if self.config.debug {
                    log::debug!("ttl {} input low", self.core.module_id);
                }
                if let Some(tracker) = &self.tracker {
                    let _ = tracker.write(TRACKER_LEVEL, 0);
                }
            }
            other => {
                log::warn!(
                    "ttl {} received unexpected event {other}; skipped",
                    self.core.module_id
                );
            }
        }
    }

    /// App-side command handle.
    pub fn commands(&self, queue: CommandQueue) -> TtlCommands {
        TtlCommands {
            module_type: self.core.module_type,
            module_id: self.core.module_id,
            queue,
        }
    }

    /// Rising-edge timestamps of the monitored input, with the start blip
    /// filtered out.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        let levels = merged_levels(events, TTL_INPUT_ON, TTL_INPUT_OFF);
        let mut edges = rising_edges(&levels);

        // Width of the first pulse: the next low level after the first edge.
        if let Some(&first_edge) = edges.first() {
            let first_off = levels
                .iter()
                .find(|&&(ts, level)| level == 0 && ts > first_edge)
                .map(|&(ts, _)| ts);
            if let Some(off) = first_off {
                if off - first_edge < self.config.blip_filter_us {
                    edges.remove(0);
                }
            }
        }

        ModuleSeries::RisingEdges { timestamp_us: edges }
    }
}

/// App-side TTL command builder.
pub struct TtlCommands {
    module_type: u8,
    module_id: u8,
    queue: CommandQueue,
}

impl TtlCommands {
    /// Emits one pulse with the pre-set duration; repeats every
    /// `repetition_delay_us` when non-zero.
    pub fn send_pulse(&self, repetition_delay_us: u32, noblock: bool) -> ModuleResult<()> {
        self.queue.send_command(
            self.module_type,
            self.module_id,
            CMD_SEND_PULSE,
            noblock,
            repetition_delay_us,
        )
    }

    /// Drives the output permanently high or low.
    pub fn toggle(&self, high: bool) -> ModuleResult<()> {
        let command = if high { CMD_TOGGLE_ON } else { CMD_TOGGLE_OFF };
        self.queue
            .send_command(self.module_type, self.module_id, command, false, 0)
    }

    /// Monitors the input pin; the device reports only level transitions.
    pub fn check_state(&self, repetition_delay_us: u32) -> ModuleResult<()> {
        self.queue.send_command(
            self.module_type,
            self.module_id,
            CMD_CHECK_STATE,
            true,
            repetition_delay_us,
        )
    }

    pub fn set_parameters(&self, parameters: TtlParameters) -> ModuleResult<()> {
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

    fn ttl(module_id: u8) -> TtlInterface {
        TtlInterface::new(module_id, TtlConfig::default()).expect("ttl")
    }

    fn record(ts: u64) -> EventRecord {
        EventRecord {
            timestamp_us: ts,
            object: None,
        }
    }

    #[test]
    fn start_blip_is_dropped() {
        let ttl = ttl(60);
        let mut events = EventMap::new();
        events.insert(
            TTL_INPUT_ON,
            vec![record(1_000), record(100_000), record(300_000)],
        );
        events.insert(
            TTL_INPUT_OFF,
            vec![record(6_000), record(200_000), record(400_000)],
        );

        let ModuleSeries::RisingEdges { timestamp_us } = ttl.parse_logged_data(&events) else {
            panic!("wrong series kind");
        };
        assert_eq!(timestamp_us, vec![100_000, 300_000]);
    }

    #[test]
    fn wide_first_pulse_is_kept() {
        let ttl = ttl(61);
        let mut events = EventMap::new();
        events.insert(TTL_INPUT_ON, vec![record(1_000), record(300_000)]);
        events.insert(TTL_INPUT_OFF, vec![record(150_000), record(400_000)]);

        let ModuleSeries::RisingEdges { timestamp_us } = ttl.parse_logged_data(&events) else {
            panic!("wrong series kind");
        };
        assert_eq!(timestamp_us, vec![1_000, 300_000]);
    }

    #[test]
    fn no_edges_without_both_levels() {
        let ttl = ttl(62);
        let mut events = EventMap::new();
        events.insert(TTL_INPUT_OFF, vec![record(10)]);
        let ModuleSeries::RisingEdges { timestamp_us } = ttl.parse_logged_data(&events) else {
            panic!("wrong series kind");
        };
        assert!(timestamp_us.is_empty());
    }

    #[test]
    fn pulse_reporting_mirrors_input_level() {
        let mut config = TtlConfig::default();
        config.report_pulses = true;
        let mut ttl = TtlInterface::new(63, config).expect("ttl");

        let on = wire::ModuleState {
            module_type: TTL_TYPE,
            module_id: 63,
            command: CMD_CHECK_STATE,
            event: TTL_INPUT_ON,
        };
        let off = wire::ModuleState {
            event: TTL_INPUT_OFF,
            ..on
        };

        assert!(!ttl.input_high());
        ttl.process_received_data(ModuleEvent::State(&on));
        assert!(ttl.input_high());
        ttl.process_received_data(ModuleEvent::State(&off));
        assert!(!ttl.input_high());
    }
}
