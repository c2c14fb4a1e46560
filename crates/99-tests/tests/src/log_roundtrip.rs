//! Log round-trip at session scale: 10,000 valve pulses through the logger,
//! the archive, and integrity verification.

use eventlog::archive::Archive;
use eventlog::{EventLogger, LogPackage, LoggerConfig};
use wire::{Message, ModuleState};

const VALVE_SOURCE: u8 = 2;

fn valve_state_payload(event: u8) -> Vec<u8> {
    let message = Message::State(ModuleState {
        module_type: modules::VALVE_TYPE,
        module_id: 1,
        command: 1,
        event,
    });
    let mut payload = Vec::new();
    message.encode_payload(&mut payload);
    payload
}

#[test]
fn ten_thousand_pulse_pairs_survive_compression_and_verification() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = LoggerConfig::new(dir.path(), "rig");
    config.queue_capacity = 1024;
    let logger = EventLogger::new(config).expect("logger");
    logger.start().expect("start");
    let handle = logger.handle();

    handle.submit(LogPackage::onset(VALVE_SOURCE)).expect("onset");

    // 10,000 open/closed pairs at 1 ms cadence; pair k closes at k * 1000.
    let open = valve_state_payload(modules::VALVE_OPEN);
    let closed = valve_state_payload(modules::VALVE_CLOSED);
    for pair in 1..=10_000u64 {
        handle
            .submit(LogPackage {
                source_id: VALVE_SOURCE,
                time_stamp_us: (pair - 1) * 1_000 + 500,
                serialized_data: open.clone(),
            })
            .expect("open");
        handle
            .submit(LogPackage {
                source_id: VALVE_SOURCE,
                time_stamp_us: pair * 1_000,
                serialized_data: closed.clone(),
            })
            .expect("closed");
    }

    logger.stop().expect("stop");
    assert_eq!(
        logger.source_index(VALVE_SOURCE).map(|i| i.entry_count),
        Some(20_001)
    );
    let archive_path = logger
        .compress_logs(true, true, true)
        .expect("compress with verification");

    let archive = Archive::open(&archive_path, true).expect("open archive");
    let stream = archive.stream(VALVE_SOURCE).expect("valve stream");
    assert_eq!(stream.index.entry_count, 20_001);
    assert_eq!(stream.index.first_ts, 0);
    assert_eq!(stream.index.last_ts, 10_000_000);

    // Adjacent entries never regress within one source.
    let mut previous = 0u64;
    for entry in &stream.entries {
        assert!(entry.time_stamp_us >= previous);
        previous = entry.time_stamp_us;
    }
}
