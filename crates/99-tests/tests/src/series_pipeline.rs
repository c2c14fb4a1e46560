//! Extraction pipeline over synthetic device traffic: encoder position,
//! TTL blip filtering, screen reconstruction, and table output, all from
//! one archived session.

use eventlog::{EventLogger, LogPackage, LoggerConfig};
use extract::{extract_archive, write_module_tables};
use modules::{
    EncoderConfig, EncoderInterface, Module, ModuleSeries, ScreenConfig, ScreenInterface,
    TtlConfig, TtlInterface,
};
use wire::{Message, ModuleData, ModuleState, PayloadValue};

const SOURCE: u8 = 3;
const ENCODER_ID: u8 = 91;
const TTL_ID: u8 = 92;
const SCREEN_ID: u8 = 93;

fn payload(message: &Message) -> Vec<u8> {
    let mut bytes = Vec::new();
    message.encode_payload(&mut bytes);
    bytes
}

fn encoder_pulse(event: u8, pulses: u32) -> Vec<u8> {
    payload(&Message::Data(ModuleData {
        module_type: modules::ENCODER_TYPE,
        module_id: ENCODER_ID,
        command: 1,
        event,
        object: PayloadValue::U32(pulses),
    }))
}

fn ttl_level(event: u8) -> Vec<u8> {
    payload(&Message::State(ModuleState {
        module_type: modules::TTL_TYPE,
        module_id: TTL_ID,
        command: 4,
        event,
    }))
}

fn screen_pulse(event: u8) -> Vec<u8> {
    payload(&Message::State(ModuleState {
        module_type: modules::SCREEN_TYPE,
        module_id: SCREEN_ID,
        command: 1,
        event,
    }))
}

fn build_archive(dir: &std::path::Path) -> std::path::PathBuf {
    let logger = EventLogger::new(LoggerConfig::new(dir, "rig")).expect("logger");
    logger.start().expect("start");
    let handle = logger.handle();
    handle.submit(LogPackage::onset(SOURCE)).expect("onset");

    let mut submit = |ts: u64, data: Vec<u8>| {
        handle
            .submit(LogPackage {
                source_id: SOURCE,
                time_stamp_us: ts,
                serialized_data: data,
            })
            .expect("submit");
    };

    // Encoder: ccw 0, ccw 100, cw 50.
    submit(10, encoder_pulse(modules::ENCODER_CCW, 0));
    submit(20, encoder_pulse(modules::ENCODER_CCW, 100));
    submit(30, encoder_pulse(modules::ENCODER_CW, 50));

    // TTL: a 5 ms start blip, then two real 100 ms frames.
    submit(1_000, ttl_level(modules::TTL_INPUT_ON));
    submit(6_000, ttl_level(modules::TTL_INPUT_OFF));
    submit(100_000, ttl_level(modules::TTL_INPUT_ON));
    submit(200_000, ttl_level(modules::TTL_INPUT_OFF));
    submit(300_000, ttl_level(modules::TTL_INPUT_ON));
    submit(400_000, ttl_level(modules::TTL_INPUT_OFF));

    // Screen: two toggle pulses.
    submit(500_100, screen_pulse(modules::SCREEN_PULSE_ON));
    submit(500_150, screen_pulse(modules::SCREEN_PULSE_OFF));
    submit(500_200, screen_pulse(modules::SCREEN_PULSE_ON));
    submit(500_250, screen_pulse(modules::SCREEN_PULSE_OFF));

    logger.stop().expect("stop");
    logger.compress_logs(true, true, true).expect("compress")
}

fn rig_modules() -> Vec<Module> {
    vec![
        Module::Encoder(
            EncoderInterface::new(ENCODER_ID, EncoderConfig::default()).expect("encoder"),
        ),
        Module::Ttl(TtlInterface::new(TTL_ID, TtlConfig::default()).expect("ttl")),
        Module::Screen(ScreenInterface::new(SCREEN_ID, ScreenConfig::default()).expect("screen")),
    ]
}

#[test]
fn archived_session_rebuilds_every_module_series() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = build_archive(dir.path());
    let extraction = extract_archive(&archive, true).expect("extract");
    let source = extraction.source(SOURCE).expect("source");
    let rig = rig_modules();

    // Encoder: cumulative position in cm, rounded conversion factor.
    let Module::Encoder(encoder) = &rig[0] else {
        panic!("module order");
    };
    let cpp = encoder.cm_per_pulse();
    let events = source.module_events(modules::ENCODER_TYPE, ENCODER_ID);
    let ModuleSeries::Position {
        timestamp_us,
        position_cm,
    } = rig[0].parse_logged_data(&events)
    else {
        panic!("wrong series kind");
    };
    assert_eq!(timestamp_us, vec![10, 20, 30]);
    assert!((position_cm[0]).abs() < 1e-9);
    assert!((position_cm[1] - 100.0 * cpp).abs() < 1e-6);
    assert!((position_cm[2] - 50.0 * cpp).abs() < 1e-6);

    // TTL: the 5 ms start blip is dropped, real frames survive.
    let events = source.module_events(modules::TTL_TYPE, TTL_ID);
    let ModuleSeries::RisingEdges { timestamp_us } = rig[1].parse_logged_data(&events) else {
        panic!("wrong series kind");
    };
    assert_eq!(timestamp_us, vec![100_000, 300_000]);

    // Screen: off at onset, flipped per toggle pulse.
    let events = source.module_events(modules::SCREEN_TYPE, SCREEN_ID);
    let ModuleSeries::BinaryState {
        timestamp_us,
        state,
    } = rig[2].parse_logged_data(&events)
    else {
        panic!("wrong series kind");
    };
    assert_eq!(timestamp_us, vec![0, 500_100, 500_200]);
    assert_eq!(state, vec![0, 1, 0]);
}

#[test]
fn parse_logged_data_is_pure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = build_archive(dir.path());
    let extraction = extract_archive(&archive, false).expect("extract");
    let source = extraction.source(SOURCE).expect("source");

    for module in rig_modules() {
        let (module_type, module_id) = module.routing_key();
        let events = source.module_events(module_type, module_id);
        let first = module.parse_logged_data(&events);
        let second = module.parse_logged_data(&events);
        assert_eq!(first, second, "{} parse is not pure", module.kind_name());
    }
}

#[test]
fn tables_land_on_disk_for_every_module() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = build_archive(dir.path());
    let extraction = extract_archive(&archive, true).expect("extract");
    let source = extraction.source(SOURCE).expect("source");
    let rig = rig_modules();

    let out = dir.path().join("tables");
    let written = write_module_tables(source, &rig, &out).expect("write tables");
    assert_eq!(written.len(), 3);
    for path in &written {
        let contents = std::fs::read_to_string(path).expect("read table");
        assert!(contents.starts_with("timestamp_us"));
        assert!(contents.lines().count() >= 2);
    }
}
