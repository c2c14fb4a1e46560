use thiserror::Error;

pub type WireResult<T> = Result<T, WireError>;

/// Decode/encode failures for the serial framing layer.
///
/// Transient variants (`Framing`, `Crc`, `Truncated`, `UnknownPrototype`)
/// are counted by the controller's storm accounting and never advance module
/// state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Framing(&'static str),

    #[error("crc mismatch: expected {expected:#06x}, found {found:#06x}")]
    Crc { expected: u16, found: u16 },

    #[error("unknown payload prototype {0}")]
    UnknownPrototype(u8),

    #[error("unknown protocol byte {0}")]
    UnknownProtocol(u8),

    #[error("frame truncated: needed {needed} payload bytes, found {found}")]
    Truncated { needed: usize, found: usize },

    #[error("payload of {0} bytes exceeds the {max} byte frame limit", max = crate::MAX_PAYLOAD_LEN)]
    Oversize(usize),
}
