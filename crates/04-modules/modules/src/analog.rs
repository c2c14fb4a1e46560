//! General-purpose analog input interface: raw 12-bit ADC pass-through.

use tracker::{tracker_name, SharedTracker};

use crate::base::{sorted_events, CommandQueue, EventMap, ModuleCore, ModuleEvent};
use crate::series::ModuleSeries;
use crate::ModuleResult;

pub const ANALOG_TYPE: u8 = 8;

/// The only analog event: a non-zero sample.
pub const ANALOG_NONZERO: u8 = 51;

/// Command code: report the current readout.
pub const CMD_CHECK_STATE: u8 = 1;

/// Tracker layout: index 0 mirrors the latest sample.
pub const TRACKER_SAMPLE: usize = 0;

#[derive(Debug, Clone, Default)]
pub struct AnalogConfig {
    /// Mirror the latest sample into a shared tracker.
    pub report_samples: bool,
    pub debug: bool,
}

/// Worker-side analog interface.
pub struct AnalogInterface {
    core: ModuleCore,
    config: AnalogConfig,
    tracker: Option<SharedTracker<u32>>,
}

impl AnalogInterface {
    pub fn new(module_id: u8, config: AnalogConfig) -> ModuleResult<Self> {
        let mut core = ModuleCore::new(ANALOG_TYPE, module_id);
        if config.report_samples || config.debug {
            core.data_codes.push(ANALOG_NONZERO);
        }

        let tracker = if config.report_samples {
            let mut tracker =
                SharedTracker::create(&tracker_name(ANALOG_TYPE, module_id, "pulse"), 1, true)?;
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

    pub fn initialize_remote_assets(&mut self) -> ModuleResult<()> {
        Ok(())
    }

    pub fn terminate_remote_assets(&mut self) {}

    pub fn process_received_data(&mut self, event: ModuleEvent<'_>) {
        if event.event() != ANALOG_NONZERO {
            return;
        }
        let sample = event.object_u64().unwrap_or(0);
        if self.config.debug {
            log::debug!("analog {} sample {sample}", self.core.module_id);
        }
        if let Some(tracker) = &self.tracker {
            let _ = tracker.write(TRACKER_SAMPLE, sample as u32);
        }
    }

    /// App-side command handle.
    pub fn commands(&self, queue: CommandQueue) -> AnalogCommands {
        AnalogCommands {
            module_type: self.core.module_type,
            module_id: self.core.module_id,
            queue,
        }
    }

    /// Raw sample pass-through, timestamp-sorted.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        let rows = sorted_events(events, ANALOG_NONZERO);
        ModuleSeries::Analog {
            timestamp_us: rows.iter().map(|&(ts, _)| ts).collect(),
            adc_value: rows.iter().map(|&(_, adc)| adc as u16).collect(),
        }
    }
}

/// App-side analog command builder.
pub struct AnalogCommands {
    module_type: u8,
    module_id: u8,
    queue: CommandQueue,
}

impl AnalogCommands {
    /// Polls the input; repeats every `repetition_delay_us` when non-zero.
    pub fn check_state(&self, repetition_delay_us: u32) -> ModuleResult<()> {
        self.queue.send_command(
            self.module_type,
            self.module_id,
            CMD_CHECK_STATE,
            true,
            repetition_delay_us,
        )
    }

    pub fn reset_command_queue(&self) -> ModuleResult<()> {
        self.queue.send_dequeue(self.module_type, self.module_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::EventRecord;
    use wire::PayloadValue;

    #[test]
    fn samples_pass_through_sorted() {
        let analog = AnalogInterface::new(1, AnalogConfig::default()).expect("analog");
        let mut events = EventMap::new();
        events.insert(
            ANALOG_NONZERO,
            vec![
                EventRecord {
                    timestamp_us: 20,
                    object: Some(PayloadValue::U16(300)),
                },
                EventRecord {
                    timestamp_us: 10,
                    object: Some(PayloadValue::U16(4_000)),
                },
            ],
        );

        let ModuleSeries::Analog {
            timestamp_us,
            adc_value,
        } = analog.parse_logged_data(&events)
        else {
            panic!("wrong series kind");
        };
        assert_eq!(timestamp_us, vec![10, 20]);
        assert_eq!(adc_value, vec![4_000, 300]);
    }
}
