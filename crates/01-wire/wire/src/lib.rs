//! Wire protocol shared with the microcontroller firmware.
//!
//! This crate owns the bit-exact serial frame layout:
//! * [`Message`] – typed view of every payload that crosses the link.
//! * [`PayloadValue`] – prototype-tagged scalar/array payload objects.
//! * [`encode_frame`] / [`FrameReader`] – framing, COBS stuffing, CRC.
//! * [`WireError`] – the decode failure surface.
//!
//! Frames are little-endian and must match the firmware constant table; see
//! the constants in [`frame`].

mod error;
mod frame;
mod message;
mod payload;

pub use error::{WireError, WireResult};
pub use frame::{
    encode_frame, FrameReader, DELIMITER, MAX_PAYLOAD_LEN, START_BYTE,
};
pub use message::{
    Identification, Message, ModuleData, ModuleState, OneOffCommand, ParameterMessage, Protocol,
    RepeatedCommand, HOST_NOTE,
};
pub use payload::{PayloadValue, ScalarKind};

/// Encodes a typed message into a complete on-wire frame.
pub fn encode_message(message: &Message) -> WireResult<Vec<u8>> {
    let mut payload = Vec::with_capacity(16);
    message.encode_payload(&mut payload);
    encode_frame(&payload)
}
