//! Columnar output: one CSV per module instance plus the annotation table.

use std::path::{Path, PathBuf};

use modules::Module;

use crate::annotations::AnnotationRecord;
use crate::{ExtractResult, ExtractedSource};

/// Runs every module's `parse_logged_data` over the extracted source and
/// writes one CSV per module at
/// `<out_dir>/<kind>_<module_type>_<module_id>.csv`. Returns the written
/// paths in module order.
pub fn write_module_tables(
    source: &ExtractedSource,
    modules: &[Module],
    out_dir: &Path,
) -> ExtractResult<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)?;

    let mut written = Vec::with_capacity(modules.len());
    for module in modules {
        let (module_type, module_id) = module.routing_key();
        let events = source.module_events(module_type, module_id);
        let series = module.parse_logged_data(&events);

        let path = out_dir.join(format!(
            "{}_{}_{}.csv",
            module.kind_name(),
            module_type,
            module_id
        ));
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(series.column_names())?;
        for index in 0..series.len() {
            writer.write_record(series.row(index))?;
        }
        writer.flush()?;

        log::debug!(
            "wrote {} rows for {} ({module_type}, {module_id})",
            series.len(),
            module.kind_name()
        );
        written.push(path);
    }
    Ok(written)
}

/// Writes the orchestrator annotation stream as a single table.
pub fn write_annotation_table(
    annotations: &[AnnotationRecord],
    out_dir: &Path,
) -> ExtractResult<PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join("annotations.csv");
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["timestamp_us", "record_type", "value"])?;
    for record in annotations {
        let (record_type, value) = record.columns();
        writer.write_record([record.timestamp_us().to_string(), record_type.into(), value])?;
    }
    writer.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modules::{EventRecord, LickConfig, LickInterface, Module, LICK_TYPE};
    use std::collections::HashMap;
    use wire::PayloadValue;

    #[test]
    fn module_tables_land_on_disk_with_headers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lick = LickInterface::new(87, LickConfig::default()).expect("lick");
        let modules = vec![Module::Lick(lick)];

        let mut events = modules::EventMap::new();
        events.insert(
            modules::LICK_VOLTAGE_CHANGED,
            vec![EventRecord {
                timestamp_us: 11,
                object: Some(PayloadValue::U16(2_000)),
            }],
        );
        let source = ExtractedSource {
            source_id: 2,
            onset_epoch_us: 1,
            events: HashMap::from([((LICK_TYPE, 87), events)]),
            host_notes: Vec::new(),
        };

        let written = write_module_tables(&source, &modules, dir.path()).expect("write");
        assert_eq!(written.len(), 1);
        let contents = std::fs::read_to_string(&written[0]).expect("read");
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("timestamp_us,adc_value,lick_state"));
        assert_eq!(lines.next(), Some("11,2000,1"));
    }

    #[test]
    fn annotation_table_renders_each_record_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = vec![
            AnnotationRecord::RuntimeState {
                timestamp_us: 4,
                state: 2,
            },
            AnnotationRecord::Guidance {
                timestamp_us: 9,
                enabled: true,
            },
        ];
        let path = write_annotation_table(&records, dir.path()).expect("write");
        let contents = std::fs::read_to_string(path).expect("read");
        assert!(contents.contains("4,runtime_state,2"));
        assert!(contents.contains("9,guidance,1"));
    }
}
