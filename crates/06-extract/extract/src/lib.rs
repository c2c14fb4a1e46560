//! Post-run log extraction: from the compressed archive back to aligned,
//! typed time series.
//!
//! The pipeline memory-maps the archive, anchors every source at its onset
//! stamp, re-decodes each entry with the wire payload parser (controller
//! sources) or the orchestrator record table, groups module events by
//! `(module_type, module_id, event)`, and hands each group to the owning
//! module's `parse_logged_data` for its columnar output.

mod align;
mod annotations;
mod error;
mod tables;

use std::collections::HashMap;
use std::path::Path;

use eventlog::archive::Archive;
use eventlog::ANNOTATION_SOURCE;
use modules::{EventMap, EventRecord};
use wire::{Message, HOST_NOTE};

pub use align::{interpolate_linear, interpolate_previous};
pub use annotations::AnnotationRecord;
pub use error::{ExtractError, ExtractResult};
pub use tables::{write_annotation_table, write_module_tables};

/// A host-originated note found inside a controller's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNote {
    pub timestamp_us: u64,
    pub kind: u8,
    pub detail: Vec<u8>,
}

/// One decoded controller source.
pub struct ExtractedSource {
    pub source_id: u8,
    /// UTC epoch microseconds of the source onset; absolute wall-clock
    /// stamps are `onset_epoch_us + timestamp_us`.
    pub onset_epoch_us: u64,
    /// Module events grouped by routing key and event code.
    pub events: HashMap<(u8, u8), EventMap>,
    pub host_notes: Vec<HostNote>,
}

impl ExtractedSource {
    /// Events for one module instance; empty when the module never spoke.
    pub fn module_events(&self, module_type: u8, module_id: u8) -> EventMap {
        self.events
            .get(&(module_type, module_id))
            .cloned()
            .unwrap_or_default()
    }
}

/// The decoded archive: controller sources plus orchestrator annotations.
pub struct Extraction {
    pub sources: Vec<ExtractedSource>,
    pub annotations: Vec<AnnotationRecord>,
    /// Onset of the orchestrator's annotation stream, when present.
    pub annotation_onset_epoch_us: Option<u64>,
}

impl Extraction {
    pub fn source(&self, source_id: u8) -> Option<&ExtractedSource> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

/// Reads an archive and decodes every stream.
pub fn extract_archive(path: &Path, memory_mapping: bool) -> ExtractResult<Extraction> {
    let archive = Archive::open(path, memory_mapping)?;

    let mut sources = Vec::new();
    let mut annotations = Vec::new();
    let mut annotation_onset = None;

    for stream in &archive.streams {
        let mut entries = stream.entries.iter();
        let onset = entries
            .next()
            .filter(|entry| entry.time_stamp_us == 0)
            .and_then(|entry| timekit::decode_onset_bytes(&entry.payload))
            .ok_or(ExtractError::MissingOnset {
                source_id: stream.source_id,
            })?;

        if stream.source_id == ANNOTATION_SOURCE {
            annotation_onset = Some(onset);
            for entry in entries {
                match annotations::decode(entry.time_stamp_us, &entry.payload) {
                    Ok(record) => annotations.push(record),
                    Err(err) => {
                        log::warn!("skipping malformed annotation record: {err}");
                    }
                }
            }
            continue;
        }

        let mut source = ExtractedSource {
            source_id: stream.source_id,
            onset_epoch_us: onset,
            events: HashMap::new(),
            host_notes: Vec::new(),
        };

        for entry in entries {
            if entry.payload.first() == Some(&HOST_NOTE) {
                source.host_notes.push(HostNote {
                    timestamp_us: entry.time_stamp_us,
                    kind: entry.payload.get(1).copied().unwrap_or(0),
                    detail: entry.payload.get(2..).unwrap_or_default().to_vec(),
                });
                continue;
            }

            match Message::decode_payload(&entry.payload) {
                Ok(Message::Data(data)) => {
                    source
                        .events
                        .entry((data.module_type, data.module_id))
                        .or_default()
                        .entry(data.event)
                        .or_default()
                        .push(EventRecord {
                            timestamp_us: entry.time_stamp_us,
                            object: Some(data.object),
                        });
                }
                Ok(Message::State(state)) => {
                    source
                        .events
                        .entry((state.module_type, state.module_id))
                        .or_default()
                        .entry(state.event)
                        .or_default()
                        .push(EventRecord {
                            timestamp_us: entry.time_stamp_us,
                            object: None,
                        });
                }
                // Outbound command echoes and identification replies carry
                // no behavioral data; they stay in the raw log only.
                Ok(_) => {}
                Err(err) => {
                    log::warn!(
                        "source {}: undecodable entry at {} us skipped ({err})",
                        stream.source_id,
                        entry.time_stamp_us
                    );
                }
            }
        }

        sources.push(source);
    }

    Ok(Extraction {
        sources,
        annotations,
        annotation_onset_epoch_us: annotation_onset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventlog::{EventLogger, LogPackage, LoggerConfig};
    use modules::{LickConfig, LickInterface, Module, ModuleSeries, LICK_TYPE};
    use wire::{ModuleData, PayloadValue};

    fn payload_of(message: &Message) -> Vec<u8> {
        let mut payload = Vec::new();
        message.encode_payload(&mut payload);
        payload
    }

    fn lick_data(adc: u16) -> Message {
        Message::Data(ModuleData {
            module_type: LICK_TYPE,
            module_id: 85,
            command: 1,
            event: modules::LICK_VOLTAGE_CHANGED,
            object: PayloadValue::U16(adc),
        })
    }

    #[test]
    fn archive_round_trips_into_module_series() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::new(LoggerConfig::new(dir.path(), "rig")).expect("logger");
        logger.start().expect("start");
        let handle = logger.handle();

        handle.submit(LogPackage::onset(2)).expect("onset");
        for (ts, adc) in [(1_000u64, 0u16), (2_000, 1_400), (3_000, 200)] {
            handle
                .submit(LogPackage {
                    source_id: 2,
                    time_stamp_us: ts,
                    serialized_data: payload_of(&lick_data(adc)),
                })
                .expect("submit");
        }
        logger.stop().expect("stop");
        let archive = logger.compress_logs(false, true, true).expect("compress");

        let extraction = extract_archive(&archive, true).expect("extract");
        let source = extraction.source(2).expect("source");
        assert!(source.onset_epoch_us > 0);

        let lick = LickInterface::new(85, LickConfig::default()).expect("lick");
        let module = Module::Lick(lick);
        let events = source.module_events(LICK_TYPE, 85);
        let ModuleSeries::LickStates {
            timestamp_us,
            adc_value,
            lick_state,
        } = module.parse_logged_data(&events)
        else {
            panic!("wrong series kind");
        };
        assert_eq!(timestamp_us, vec![1_000, 2_000, 3_000]);
        assert_eq!(adc_value, vec![0, 1_400, 200]);
        assert_eq!(lick_state, vec![0, 1, 0]);
    }

    #[test]
    fn extraction_is_deterministic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::new(LoggerConfig::new(dir.path(), "rig")).expect("logger");
        logger.start().expect("start");
        let handle = logger.handle();
        handle.submit(LogPackage::onset(2)).expect("onset");
        handle
            .submit(LogPackage {
                source_id: 2,
                time_stamp_us: 42,
                serialized_data: payload_of(&lick_data(1_234)),
            })
            .expect("submit");
        logger.stop().expect("stop");
        let archive = logger.compress_logs(false, false, false).expect("compress");

        let lick = LickInterface::new(86, LickConfig::default()).expect("lick");
        let first = extract_archive(&archive, false).expect("extract");
        let second = extract_archive(&archive, true).expect("extract");
        let events_a = first.source(2).expect("source").module_events(LICK_TYPE, 85);
        let events_b = second
            .source(2)
            .expect("source")
            .module_events(LICK_TYPE, 85);
        assert_eq!(lick.parse_logged_data(&events_a), lick.parse_logged_data(&events_b));
    }

    #[test]
    fn stream_without_onset_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::new(LoggerConfig::new(dir.path(), "rig")).expect("logger");
        logger.start().expect("start");
        logger
            .handle()
            .submit(LogPackage {
                source_id: 2,
                time_stamp_us: 5,
                serialized_data: vec![1, 2, 3],
            })
            .expect("submit");
        logger.stop().expect("stop");
        let archive = logger.compress_logs(false, false, false).expect("compress");

        assert!(matches!(
            extract_archive(&archive, false),
            Err(ExtractError::MissingOnset { source_id: 2 })
        ));
    }

    #[test]
    fn host_notes_are_separated_from_module_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::new(LoggerConfig::new(dir.path(), "rig")).expect("logger");
        logger.start().expect("start");
        let handle = logger.handle();
        handle.submit(LogPackage::onset(2)).expect("onset");
        handle
            .submit(LogPackage {
                source_id: 2,
                time_stamp_us: 9,
                serialized_data: vec![HOST_NOTE, 1, 2],
            })
            .expect("submit");
        logger.stop().expect("stop");
        let archive = logger.compress_logs(false, false, false).expect("compress");

        let extraction = extract_archive(&archive, false).expect("extract");
        let source = extraction.source(2).expect("source");
        assert!(source.events.is_empty());
        assert_eq!(
            source.host_notes,
            vec![HostNote {
                timestamp_us: 9,
                kind: 1,
                detail: vec![2],
            }]
        );
    }
}
