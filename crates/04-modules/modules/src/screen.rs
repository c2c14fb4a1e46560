//! Display screen interface.
//!
//! The module pulses a relay wired across the display's power button; each
//! pulse flips the screen state. Extraction reconstructs the state timeline
//! from the configured initial state plus the pulse rising edges.

use smallvec::SmallVec;
use wire::{Message, ParameterMessage};

use crate::base::{merged_levels, rising_edges, CommandQueue, EventMap, ModuleCore, ModuleEvent};
use crate::series::ModuleSeries;
use crate::ModuleResult;

pub const SCREEN_TYPE: u8 = 7;

/// Screen event codes.
pub const SCREEN_OUTPUT_LOCKED: u8 = 51;
pub const SCREEN_PULSE_ON: u8 = 52;
pub const SCREEN_PULSE_OFF: u8 = 53;

/// Command code: emit one button-press pulse.
pub const CMD_TOGGLE: u8 = 1;

#[derive(Debug, Clone)]
pub struct ScreenConfig {
    /// Whether the screens are powered when the runtime starts.
    pub initially_on: bool,
    pub debug: bool,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            initially_on: false,
            debug: false,
        }
    }
}

/// Packed device parameters: the simulated button-press duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenParameters {
    pub pulse_duration_us: u32,
}

impl ScreenParameters {
    pub fn pack(&self) -> SmallVec<[u8; 16]> {
        SmallVec::from_slice(&self.pulse_duration_us.to_le_bytes())
    }
}

/// Worker-side screen interface.
pub struct ScreenInterface {
    core: ModuleCore,
    config: ScreenConfig,
}

impl ScreenInterface {
    pub fn new(module_id: u8, config: ScreenConfig) -> ModuleResult<Self> {
        let mut core = ModuleCore::new(SCREEN_TYPE, module_id);
        core.error_codes.push(SCREEN_OUTPUT_LOCKED);
        if config.debug {
            core.data_codes
                .extend_from_slice(&[SCREEN_PULSE_ON, SCREEN_PULSE_OFF]);
        }
        Ok(Self { core, config })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    pub fn initially_on(&self) -> bool {
        self.config.initially_on
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
            SCREEN_PULSE_ON => log::debug!("screen {} toggle pulse high", self.core.module_id),
            SCREEN_PULSE_OFF => log::debug!("screen {} toggle pulse low", self.core.module_id),
            other => log::debug!("screen {} event {other}", self.core.module_id),
        }
    }

    /// App-side command handle.
    pub fn commands(&self, queue: CommandQueue) -> ScreenCommands {
        ScreenCommands {
            module_type: self.core.module_type,
            module_id: self.core.module_id,
            queue,
        }
    }

    /// Screen state series: the initial state at the onset, flipped on each
    /// toggle-pulse rising edge.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        let levels = merged_levels(events, SCREEN_PULSE_ON, SCREEN_PULSE_OFF);
        let edges = rising_edges(&levels);

        let mut timestamp_us = Vec::with_capacity(edges.len() + 1);
        let mut state = Vec::with_capacity(edges.len() + 1);
        timestamp_us.push(0);
        state.push(u8::from(self.config.initially_on));
        for edge in edges {
            let flipped = 1 - state[state.len() - 1];
            timestamp_us.push(edge);
            state.push(flipped);
        }

        ModuleSeries::BinaryState {
            timestamp_us,
            state,
        }
    }
}

/// App-side screen command builder.
pub struct ScreenCommands {
    module_type: u8,
    module_id: u8,
    queue: CommandQueue,
}

impl ScreenCommands {
    /// Emits one button-press pulse, flipping the screen state.
    pub fn toggle(&self) -> ModuleResult<()> {
        self.queue
            .send_command(self.module_type, self.module_id, CMD_TOGGLE, false, 0)
    }

    pub fn set_parameters(&self, parameters: ScreenParameters) -> ModuleResult<()> {
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

    fn record(ts: u64) -> EventRecord {
        EventRecord {
            timestamp_us: ts,
            object: None,
        }
    }

    #[test]
    fn state_flips_on_each_pulse_rising_edge() {
        let screen = ScreenInterface::new(1, ScreenConfig::default()).expect("screen");
        let mut events = EventMap::new();
        events.insert(SCREEN_PULSE_ON, vec![record(100), record(200)]);
        events.insert(SCREEN_PULSE_OFF, vec![record(150), record(250)]);

        let ModuleSeries::BinaryState {
            timestamp_us,
            state,
        } = screen.parse_logged_data(&events)
        else {
            panic!("wrong series kind");
        };
        assert_eq!(timestamp_us, vec![0, 100, 200]);
        assert_eq!(state, vec![0, 1, 0]);
    }

    #[test]
    fn initial_state_survives_without_pulses() {
        let config = ScreenConfig {
            initially_on: true,
            debug: false,
        };
        let screen = ScreenInterface::new(1, config).expect("screen");
        let events = EventMap::new();

        let ModuleSeries::BinaryState {
            timestamp_us,
            state,
        } = screen.parse_logged_data(&events)
        else {
            panic!("wrong series kind");
        };
        assert_eq!(timestamp_us, vec![0]);
        assert_eq!(state, vec![1]);
    }
}
