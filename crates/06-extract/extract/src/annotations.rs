//! Orchestrator annotation records.
//!
//! The orchestrator logs out-of-band records under its reserved source id;
//! the first payload byte selects the record type.

use crate::{ExtractError, ExtractResult};

/// Record-type bytes of the orchestrator's annotation stream.
pub const RECORD_HARDWARE_STATE: u8 = 1;
pub const RECORD_RUNTIME_STATE: u8 = 2;
pub const RECORD_GUIDANCE: u8 = 3;
pub const RECORD_EXTERNAL_TERMINATED: u8 = 4;

/// One decoded orchestrator record.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationRecord {
    HardwareState { timestamp_us: u64, state: u8 },
    RuntimeState { timestamp_us: u64, state: u8 },
    Guidance { timestamp_us: u64, enabled: bool },
    ExternalTerminated { timestamp_us: u64, position: f64 },
}

impl AnnotationRecord {
    pub fn timestamp_us(&self) -> u64 {
        match self {
            AnnotationRecord::HardwareState { timestamp_us, .. }
            | AnnotationRecord::RuntimeState { timestamp_us, .. }
            | AnnotationRecord::Guidance { timestamp_us, .. }
            | AnnotationRecord::ExternalTerminated { timestamp_us, .. } => *timestamp_us,
        }
    }

    /// `(record_type, value)` pair for tabular output.
    pub fn columns(&self) -> (&'static str, String) {
        match self {
            AnnotationRecord::HardwareState { state, .. } => {
                ("hardware_state", state.to_string())
            }
            AnnotationRecord::RuntimeState { state, .. } => ("runtime_state", state.to_string()),
            AnnotationRecord::Guidance { enabled, .. } => {
                ("guidance", u8::from(*enabled).to_string())
            }
            AnnotationRecord::ExternalTerminated { position, .. } => {
                ("external_terminated", position.to_string())
            }
        }
    }
}

/// Decodes one annotation payload.
pub fn decode(timestamp_us: u64, payload: &[u8]) -> ExtractResult<AnnotationRecord> {
    let (&record_type, rest) = payload
        .split_first()
        .ok_or(ExtractError::MalformedAnnotation("empty payload"))?;
    let record = match record_type {
        RECORD_HARDWARE_STATE => AnnotationRecord::HardwareState {
            timestamp_us,
            state: *rest
                .first()
                .ok_or(ExtractError::MalformedAnnotation("missing hardware state"))?,
        },
        RECORD_RUNTIME_STATE => AnnotationRecord::RuntimeState {
            timestamp_us,
            state: *rest
                .first()
                .ok_or(ExtractError::MalformedAnnotation("missing runtime state"))?,
        },
        RECORD_GUIDANCE => AnnotationRecord::Guidance {
            timestamp_us,
            enabled: *rest
                .first()
                .ok_or(ExtractError::MalformedAnnotation("missing guidance flag"))?
                != 0,
        },
        RECORD_EXTERNAL_TERMINATED => {
            let bytes: [u8; 8] = rest
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(ExtractError::MalformedAnnotation("missing f64 position"))?;
            AnnotationRecord::ExternalTerminated {
                timestamp_us,
                position: f64::from_le_bytes(bytes),
            }
        }
        _ => return Err(ExtractError::MalformedAnnotation("unknown record type")),
    };
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_record_type_decodes() {
        assert_eq!(
            decode(5, &[1, 3]).expect("decode"),
            AnnotationRecord::HardwareState {
                timestamp_us: 5,
                state: 3
            }
        );
        assert_eq!(
            decode(6, &[2, 9]).expect("decode"),
            AnnotationRecord::RuntimeState {
                timestamp_us: 6,
                state: 9
            }
        );
        assert_eq!(
            decode(7, &[3, 1]).expect("decode"),
            AnnotationRecord::Guidance {
                timestamp_us: 7,
                enabled: true
            }
        );
        let mut terminated = vec![4];
        terminated.extend_from_slice(&123.5f64.to_le_bytes());
        assert_eq!(
            decode(8, &terminated).expect("decode"),
            AnnotationRecord::ExternalTerminated {
                timestamp_us: 8,
                position: 123.5
            }
        );
    }

    #[test]
    fn unknown_record_type_is_refused() {
        assert!(matches!(
            decode(0, &[9, 0]),
            Err(ExtractError::MalformedAnnotation(_))
        ));
    }
}
