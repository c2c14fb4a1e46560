//! Typed views of every payload that crosses the serial link.
//!
//! The first payload byte is the protocol discriminant; the remaining bytes
//! follow the firmware header order (`module_type`, `module_id`, …). Host →
//! device traffic is the command family; device → host traffic is the
//! data/state/identification family. Both directions share one [`Message`]
//! enum so the logger and the extraction pipeline can re-parse anything that
//! was ever put on the wire.

use smallvec::SmallVec;

use crate::payload::PayloadValue;
use crate::{WireError, WireResult};

/// Leading byte of host-originated payloads stored in a controller's log
/// stream (frame-error notes, module-error warnings). Never valid on the
/// wire; extraction separates these from firmware traffic by this marker.
pub const HOST_NOTE: u8 = 0xFF;

/// Protocol discriminants, fixed by the firmware constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    RepeatedCommand = 1,
    OneOffCommand = 2,
    DequeueCommand = 3,
    Parameters = 4,
    Identify = 5,
    Lock = 6,
    Unlock = 7,
    ModuleData = 8,
    ModuleState = 9,
    Identification = 10,
}

impl Protocol {
    pub fn from_byte(byte: u8) -> WireResult<Self> {
        let protocol = match byte {
            1 => Protocol::RepeatedCommand,
            2 => Protocol::OneOffCommand,
            3 => Protocol::DequeueCommand,
            4 => Protocol::Parameters,
            5 => Protocol::Identify,
            6 => Protocol::Lock,
            7 => Protocol::Unlock,
            8 => Protocol::ModuleData,
            9 => Protocol::ModuleState,
            10 => Protocol::Identification,
            other => return Err(WireError::UnknownProtocol(other)),
        };
        Ok(protocol)
    }
}

/// A one-shot module command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneOffCommand {
    pub module_type: u8,
    pub module_id: u8,
    pub return_code: u8,
    pub command: u8,
    pub noblock: bool,
}

/// A module command the firmware re-runs every `cycle_delay_us` microseconds
/// until dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatedCommand {
    pub module_type: u8,
    pub module_id: u8,
    pub return_code: u8,
    pub command: u8,
    pub noblock: bool,
    pub cycle_delay_us: u32,
}

/// A runtime-parameter update for one module.
///
/// The data bytes are the module's parameter struct packed little-endian
/// field by field; the layout is known to the firmware, so the host treats
/// the tuple as opaque once packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterMessage {
    pub module_type: u8,
    pub module_id: u8,
    pub return_code: u8,
    pub data: SmallVec<[u8; 16]>,
}

/// A module event that carries a payload object.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleData {
    pub module_type: u8,
    pub module_id: u8,
    pub command: u8,
    pub event: u8,
    pub object: PayloadValue,
}

/// A module event without a payload object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleState {
    pub module_type: u8,
    pub module_id: u8,
    pub command: u8,
    pub event: u8,
}

/// The controller's reply to an identify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    pub controller_id: u8,
}

/// Every message the host can encode or decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    OneOff(OneOffCommand),
    Repeated(RepeatedCommand),
    Parameters(ParameterMessage),
    /// Clears a module's pending command queue on the device.
    Dequeue {
        module_type: u8,
        module_id: u8,
        return_code: u8,
    },
    /// Asks the controller to identify itself.
    Identify,
    /// Puts the controller into the locked (output-inhibited) state.
    Lock,
    /// Releases the output lock.
    Unlock,
    Data(ModuleData),
    State(ModuleState),
    Identification(Identification),
}

impl Message {
    /// The `(module_type, module_id)` routing key, for module-scoped
    /// messages.
    pub fn routing_key(&self) -> Option<(u8, u8)> {
        match self {
            Message::OneOff(c) => Some((c.module_type, c.module_id)),
            Message::Repeated(c) => Some((c.module_type, c.module_id)),
            Message::Parameters(c) => Some((c.module_type, c.module_id)),
            Message::Dequeue {
                module_type,
                module_id,
                ..
            } => Some((*module_type, *module_id)),
            Message::Data(m) => Some((m.module_type, m.module_id)),
            Message::State(m) => Some((m.module_type, m.module_id)),
            Message::Identify | Message::Lock | Message::Unlock | Message::Identification(_) => {
                None
            }
        }
    }

    /// The event byte for inbound module traffic.
    pub fn event(&self) -> Option<u8> {
        match self {
            Message::Data(m) => Some(m.event),
            Message::State(m) => Some(m.event),
            _ => None,
        }
    }

    /// Serializes the unframed payload (`protocol` byte plus header fields
    /// plus object bytes).
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Message::Repeated(c) => {
                out.extend_from_slice(&[
                    Protocol::RepeatedCommand as u8,
                    c.module_type,
                    c.module_id,
                    c.return_code,
                    c.command,
                    u8::from(c.noblock),
                ]);
                out.extend_from_slice(&c.cycle_delay_us.to_le_bytes());
            }
            Message::OneOff(c) => {
                out.extend_from_slice(&[
                    Protocol::OneOffCommand as u8,
                    c.module_type,
                    c.module_id,
                    c.return_code,
                    c.command,
                    u8::from(c.noblock),
                ]);
            }
            Message::Dequeue {
                module_type,
                module_id,
                return_code,
            } => {
                out.extend_from_slice(&[
                    Protocol::DequeueCommand as u8,
                    *module_type,
                    *module_id,
                    *return_code,
                ]);
            }
            Message::Parameters(c) => {
                out.extend_from_slice(&[
                    Protocol::Parameters as u8,
                    c.module_type,
                    c.module_id,
                    c.return_code,
                ]);
                out.extend_from_slice(&c.data);
            }
            Message::Identify => out.push(Protocol::Identify as u8),
            Message::Lock => out.push(Protocol::Lock as u8),
            Message::Unlock => out.push(Protocol::Unlock as u8),
            Message::Data(m) => {
                out.extend_from_slice(&[
                    Protocol::ModuleData as u8,
                    m.module_type,
                    m.module_id,
                    m.command,
                    m.event,
                    m.object.prototype(),
                ]);
                m.object.encode_into(out);
            }
            Message::State(m) => {
                out.extend_from_slice(&[
                    Protocol::ModuleState as u8,
                    m.module_type,
                    m.module_id,
                    m.command,
                    m.event,
                ]);
            }
            Message::Identification(m) => {
                out.extend_from_slice(&[Protocol::Identification as u8, m.controller_id]);
            }
        }
    }

    /// Parses an unframed payload back into a typed message.
    pub fn decode_payload(payload: &[u8]) -> WireResult<Self> {
        let (&protocol_byte, rest) = payload
            .split_first()
            .ok_or(WireError::Framing("empty payload"))?;
        let protocol = Protocol::from_byte(protocol_byte)?;

        let need = |len: usize| -> WireResult<()> {
            if rest.len() < len {
                Err(WireError::Truncated {
                    needed: len,
                    found: rest.len(),
                })
            } else {
                Ok(())
            }
        };
        let exact = |len: usize| -> WireResult<()> {
            need(len)?;
            if rest.len() > len {
                Err(WireError::Framing("payload longer than message layout"))
            } else {
                Ok(())
            }
        };

        let message = match protocol {
            Protocol::RepeatedCommand => {
                exact(9)?;
                Message::Repeated(RepeatedCommand {
                    module_type: rest[0],
                    module_id: rest[1],
                    return_code: rest[2],
                    command: rest[3],
                    noblock: rest[4] != 0,
                    cycle_delay_us: u32::from_le_bytes(
                        rest[5..9].try_into().expect("len checked"),
                    ),
                })
            }
            Protocol::OneOffCommand => {
                exact(5)?;
                Message::OneOff(OneOffCommand {
                    module_type: rest[0],
                    module_id: rest[1],
                    return_code: rest[2],
                    command: rest[3],
                    noblock: rest[4] != 0,
                })
            }
            Protocol::DequeueCommand => {
                exact(3)?;
                Message::Dequeue {
                    module_type: rest[0],
                    module_id: rest[1],
                    return_code: rest[2],
                }
            }
            Protocol::Parameters => {
                need(3)?;
                Message::Parameters(ParameterMessage {
                    module_type: rest[0],
                    module_id: rest[1],
                    return_code: rest[2],
                    data: SmallVec::from_slice(&rest[3..]),
                })
            }
            Protocol::Identify => {
                exact(0)?;
                Message::Identify
            }
            Protocol::Lock => {
                exact(0)?;
                Message::Lock
            }
            Protocol::Unlock => {
                exact(0)?;
                Message::Unlock
            }
            Protocol::ModuleData => {
                need(5)?;
                let object = PayloadValue::decode(rest[4], &rest[5..])?;
                Message::Data(ModuleData {
                    module_type: rest[0],
                    module_id: rest[1],
                    command: rest[2],
                    event: rest[3],
                    object,
                })
            }
            Protocol::ModuleState => {
                exact(4)?;
                Message::State(ModuleState {
                    module_type: rest[0],
                    module_id: rest[1],
                    command: rest[2],
                    event: rest[3],
                })
            }
            Protocol::Identification => {
                exact(1)?;
                Message::Identification(Identification {
                    controller_id: rest[0],
                })
            }
        };
        Ok(message)
    }
}
