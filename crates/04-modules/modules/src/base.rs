//! Shared plumbing embedded in every hardware module interface.

use std::collections::HashMap;

use crossbeam_channel::Sender;
use smallvec::SmallVec;
use wire::{Message, ModuleData, ModuleState, OneOffCommand, PayloadValue, RepeatedCommand};

use crate::{ModuleError, ModuleResult};

/// Identity and routing data common to all module interfaces.
#[derive(Debug, Clone)]
pub struct ModuleCore {
    pub module_type: u8,
    pub module_id: u8,
    /// Event codes delivered to the online processing hook.
    pub data_codes: SmallVec<[u8; 8]>,
    /// Event codes treated as module errors by the controller.
    pub error_codes: SmallVec<[u8; 4]>,
    /// Pub/sub topics whose inbound commands this module consumes.
    pub command_topics: SmallVec<[&'static str; 2]>,
}

impl ModuleCore {
    pub fn new(module_type: u8, module_id: u8) -> Self {
        Self {
            module_type,
            module_id,
            data_codes: SmallVec::new(),
            error_codes: SmallVec::new(),
            command_topics: SmallVec::new(),
        }
    }

    pub fn routing_key(&self) -> (u8, u8) {
        (self.module_type, self.module_id)
    }

    pub fn wants_event(&self, event: u8) -> bool {
        self.data_codes.contains(&event)
    }

    pub fn is_error_event(&self, event: u8) -> bool {
        self.error_codes.contains(&event)
    }
}

/// Inbound module traffic as seen by the processing hook.
#[derive(Debug, Clone, Copy)]
pub enum ModuleEvent<'a> {
    Data(&'a ModuleData),
    State(&'a ModuleState),
}

impl ModuleEvent<'_> {
    pub fn event(&self) -> u8 {
        match self {
            ModuleEvent::Data(m) => m.event,
            ModuleEvent::State(m) => m.event,
        }
    }

    pub fn command(&self) -> u8 {
        match self {
            ModuleEvent::Data(m) => m.command,
            ModuleEvent::State(m) => m.command,
        }
    }

    pub fn object(&self) -> Option<&PayloadValue> {
        match self {
            ModuleEvent::Data(m) => Some(&m.object),
            ModuleEvent::State(_) => None,
        }
    }

    /// The payload widened to `u64`, for counter/ADC style objects.
    pub fn object_u64(&self) -> Option<u64> {
        self.object().and_then(PayloadValue::as_u64)
    }
}

/// Outbound command queue attached by the owning controller.
///
/// Interfaces are constructed detached; registration hands each one a clone
/// of the controller's queue. Sending through a detached core fails with
/// [`ModuleError::NotRegistered`].
#[derive(Debug, Default, Clone)]
pub struct CommandQueue {
    sender: Option<Sender<Message>>,
}

impl CommandQueue {
    pub fn attached(sender: Sender<Message>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn attach(&mut self, sender: Sender<Message>) {
        self.sender = Some(sender);
    }

    pub fn is_attached(&self) -> bool {
        self.sender.is_some()
    }

    pub fn send(&self, message: Message) -> ModuleResult<()> {
        let sender = self.sender.as_ref().ok_or(ModuleError::NotRegistered)?;
        sender.send(message).map_err(|_| ModuleError::QueueClosed)
    }

    /// A one-off command, or a repeated command when `repetition_delay_us`
    /// is non-zero. This is the shape every module command shares.
    pub fn send_command(
        &self,
        module_type: u8,
        module_id: u8,
        command: u8,
        noblock: bool,
        repetition_delay_us: u32,
    ) -> ModuleResult<()> {
        let message = if repetition_delay_us == 0 {
            Message::OneOff(OneOffCommand {
                module_type,
                module_id,
                return_code: 0,
                command,
                noblock,
            })
        } else {
            Message::Repeated(RepeatedCommand {
                module_type,
                module_id,
                return_code: 0,
                command,
                noblock,
                cycle_delay_us: repetition_delay_us,
            })
        };
        self.send(message)
    }

    /// Clears the module's pending command queue on the device.
    pub fn send_dequeue(&self, module_type: u8, module_id: u8) -> ModuleResult<()> {
        self.send(Message::Dequeue {
            module_type,
            module_id,
            return_code: 0,
        })
    }
}

/// One event recovered from the log during extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Onset-relative microseconds.
    pub timestamp_us: u64,
    /// The data payload, absent for state events.
    pub object: Option<PayloadValue>,
}

impl EventRecord {
    pub fn value_u64(&self) -> u64 {
        self.object
            .as_ref()
            .and_then(PayloadValue::as_u64)
            .unwrap_or(0)
    }
}

/// Events grouped by event code for one module instance.
pub type EventMap = HashMap<u8, Vec<EventRecord>>;

/// Collects `(timestamp, value)` pairs for an event code, sorted by
/// timestamp. Missing codes yield an empty vector.
pub fn sorted_events(map: &EventMap, event: u8) -> Vec<(u64, u64)> {
    let mut rows: Vec<(u64, u64)> = map
        .get(&event)
        .map(|records| {
            records
                .iter()
                .map(|r| (r.timestamp_us, r.value_u64()))
                .collect()
        })
        .unwrap_or_default();
    rows.sort_by_key(|&(ts, _)| ts);
    rows
}

/// Merges level events (`on_event` → 1, `off_event` → 0) into one
/// timestamp-sorted edge list.
pub fn merged_levels(map: &EventMap, on_event: u8, off_event: u8) -> Vec<(u64, u8)> {
    let mut rows: Vec<(u64, u8)> = Vec::new();
    if let Some(records) = map.get(&on_event) {
        rows.extend(records.iter().map(|r| (r.timestamp_us, 1u8)));
    }
    if let Some(records) = map.get(&off_event) {
        rows.extend(records.iter().map(|r| (r.timestamp_us, 0u8)));
    }
    rows.sort_by_key(|&(ts, level)| (ts, level));
    rows
}

/// Rising-edge timestamps of a level series, assuming the line idles low
/// before the first event.
pub fn rising_edges(levels: &[(u64, u8)]) -> Vec<u64> {
    let mut previous = 0u8;
    let mut edges = Vec::new();
    for &(ts, level) in levels {
        if previous == 0 && level == 1 {
            edges.push(ts);
        }
        previous = level;
    }
    edges
}
