//! Prototype-tagged payload objects carried by data messages.
//!
//! The firmware describes every data payload with a single prototype byte;
//! the table here must stay in lock-step with the firmware constant table.
//! Unknown prototype bytes fail decoding instead of guessing a width.

use crate::{WireError, WireResult};

/// Scalar element type of a payload object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

/// A decoded data-message payload: one scalar or a small fixed array.
///
/// Each variant corresponds to exactly one prototype byte, so encoding is
/// unambiguous and `decode` is the total inverse of `encode_into`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PayloadValue {
    Bool(bool),
    U8(u8),
    U8x2([u8; 2]),
    U8x3([u8; 3]),
    U8x4([u8; 4]),
    I8(i8),
    U16(u16),
    U16x2([u16; 2]),
    I16(i16),
    U32(u32),
    U32x2([u32; 2]),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl PayloadValue {
    /// The prototype byte identifying this payload layout on the wire.
    pub fn prototype(&self) -> u8 {
        match self {
            PayloadValue::Bool(_) => 1,
            PayloadValue::U8(_) => 2,
            PayloadValue::U8x2(_) => 3,
            PayloadValue::U8x3(_) => 4,
            PayloadValue::U8x4(_) => 5,
            PayloadValue::I8(_) => 6,
            PayloadValue::U16(_) => 7,
            PayloadValue::U16x2(_) => 8,
            PayloadValue::I16(_) => 9,
            PayloadValue::U32(_) => 10,
            PayloadValue::U32x2(_) => 11,
            PayloadValue::I32(_) => 12,
            PayloadValue::U64(_) => 13,
            PayloadValue::I64(_) => 14,
            PayloadValue::F32(_) => 15,
            PayloadValue::F64(_) => 16,
        }
    }

    /// `(element kind, element count, byte length)` for a prototype byte.
    pub fn prototype_layout(prototype: u8) -> WireResult<(ScalarKind, usize, usize)> {
        let layout = match prototype {
            1 => (ScalarKind::Bool, 1, 1),
            2 => (ScalarKind::U8, 1, 1),
            3 => (ScalarKind::U8, 2, 2),
            4 => (ScalarKind::U8, 3, 3),
            5 => (ScalarKind::U8, 4, 4),
            6 => (ScalarKind::I8, 1, 1),
            7 => (ScalarKind::U16, 1, 2),
            8 => (ScalarKind::U16, 2, 4),
            9 => (ScalarKind::I16, 1, 2),
            10 => (ScalarKind::U32, 1, 4),
            11 => (ScalarKind::U32, 2, 8),
            12 => (ScalarKind::I32, 1, 4),
            13 => (ScalarKind::U64, 1, 8),
            14 => (ScalarKind::I64, 1, 8),
            15 => (ScalarKind::F32, 1, 4),
            16 => (ScalarKind::F64, 1, 8),
            other => return Err(WireError::UnknownPrototype(other)),
        };
        Ok(layout)
    }

    /// Appends the little-endian object bytes (no prototype byte).
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            PayloadValue::Bool(v) => out.push(u8::from(*v)),
            PayloadValue::U8(v) => out.push(*v),
            PayloadValue::U8x2(v) => out.extend_from_slice(v),
            PayloadValue::U8x3(v) => out.extend_from_slice(v),
            PayloadValue::U8x4(v) => out.extend_from_slice(v),
            PayloadValue::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            PayloadValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            PayloadValue::U16x2(v) => {
                for element in v {
                    out.extend_from_slice(&element.to_le_bytes());
                }
            }
            PayloadValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            PayloadValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            PayloadValue::U32x2(v) => {
                for element in v {
                    out.extend_from_slice(&element.to_le_bytes());
                }
            }
            PayloadValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            PayloadValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            PayloadValue::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            PayloadValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            PayloadValue::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Decodes object bytes according to `prototype`.
    ///
    /// Fails with [`WireError::Truncated`] when `bytes` is shorter than the
    /// prototype's layout and [`WireError::Framing`] when it is longer.
    pub fn decode(prototype: u8, bytes: &[u8]) -> WireResult<Self> {
        let (_, _, expected_len) = Self::prototype_layout(prototype)?;
        if bytes.len() < expected_len {
            return Err(WireError::Truncated {
                needed: expected_len,
                found: bytes.len(),
            });
        }
        if bytes.len() > expected_len {
            return Err(WireError::Framing("payload object longer than prototype"));
        }

        let value = match prototype {
            1 => PayloadValue::Bool(bytes[0] != 0),
            2 => PayloadValue::U8(bytes[0]),
            3 => PayloadValue::U8x2([bytes[0], bytes[1]]),
            4 => PayloadValue::U8x3([bytes[0], bytes[1], bytes[2]]),
            5 => PayloadValue::U8x4([bytes[0], bytes[1], bytes[2], bytes[3]]),
            6 => PayloadValue::I8(bytes[0] as i8),
            7 => PayloadValue::U16(le_u16(&bytes[0..2])),
            8 => PayloadValue::U16x2([le_u16(&bytes[0..2]), le_u16(&bytes[2..4])]),
            9 => PayloadValue::I16(le_u16(&bytes[0..2]) as i16),
            10 => PayloadValue::U32(le_u32(&bytes[0..4])),
            11 => PayloadValue::U32x2([le_u32(&bytes[0..4]), le_u32(&bytes[4..8])]),
            12 => PayloadValue::I32(le_u32(&bytes[0..4]) as i32),
            13 => PayloadValue::U64(le_u64(&bytes[0..8])),
            14 => PayloadValue::I64(le_u64(&bytes[0..8]) as i64),
            15 => PayloadValue::F32(f32::from_le_bytes(bytes[0..4].try_into().expect("len checked"))),
            16 => PayloadValue::F64(f64::from_le_bytes(bytes[0..8].try_into().expect("len checked"))),
            other => return Err(WireError::UnknownPrototype(other)),
        };
        Ok(value)
    }

    /// Widens any unsigned/boolean scalar payload to `u64`.
    ///
    /// Returns `None` for signed, float, and array payloads; module
    /// interfaces use this for event counters and ADC readouts.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PayloadValue::Bool(v) => Some(u64::from(*v)),
            PayloadValue::U8(v) => Some(u64::from(*v)),
            PayloadValue::U16(v) => Some(u64::from(*v)),
            PayloadValue::U32(v) => Some(u64::from(*v)),
            PayloadValue::U64(v) => Some(*v),
            _ => None,
        }
    }
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes(bytes.try_into().expect("len checked"))
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().expect("len checked"))
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().expect("len checked"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_prototype_round_trips() {
        let values = [
            PayloadValue::Bool(true),
            PayloadValue::U8(0xAB),
            PayloadValue::U8x2([1, 2]),
            PayloadValue::U8x3([1, 2, 3]),
            PayloadValue::U8x4([1, 2, 3, 4]),
            PayloadValue::I8(-7),
            PayloadValue::U16(4_095),
            PayloadValue::U16x2([100, 65_000]),
            PayloadValue::I16(-1_024),
            PayloadValue::U32(8_192),
            PayloadValue::U32x2([0, u32::MAX]),
            PayloadValue::I32(-40),
            PayloadValue::U64(u64::MAX - 1),
            PayloadValue::I64(i64::MIN),
            PayloadValue::F32(1.5),
            PayloadValue::F64(-0.125),
        ];
        for value in values {
            let mut bytes = Vec::new();
            value.encode_into(&mut bytes);
            let decoded = PayloadValue::decode(value.prototype(), &bytes).expect("decode");
            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn unknown_prototype_is_rejected() {
        assert_eq!(
            PayloadValue::decode(200, &[0]),
            Err(WireError::UnknownPrototype(200))
        );
    }

    #[test]
    fn short_object_reports_truncated() {
        assert_eq!(
            PayloadValue::decode(10, &[1, 2]),
            Err(WireError::Truncated { needed: 4, found: 2 })
        );
    }
}
