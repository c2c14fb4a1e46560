//! Round-trip coverage for every message kind over the full framing path.

use smallvec::SmallVec;
use wire::{
    encode_message, FrameReader, Identification, Message, ModuleData, ModuleState, OneOffCommand,
    ParameterMessage, PayloadValue, RepeatedCommand,
};

fn roundtrip(message: Message) {
    let frame = encode_message(&message).expect("encode");
    let mut reader = FrameReader::new();
    reader.push_bytes(&frame);
    let payload = reader.next_payload().expect("frame").expect("complete");
    let decoded = Message::decode_payload(&payload).expect("decode");
    assert_eq!(message, decoded);
}

#[test]
fn commands_roundtrip() {
    roundtrip(Message::OneOff(OneOffCommand {
        module_type: 5,
        module_id: 1,
        return_code: 0,
        command: 1,
        noblock: false,
    }));
    roundtrip(Message::Repeated(RepeatedCommand {
        module_type: 1,
        module_id: 2,
        return_code: 0,
        command: 4,
        noblock: true,
        cycle_delay_us: 50_000,
    }));
    roundtrip(Message::Parameters(ParameterMessage {
        module_type: 5,
        module_id: 1,
        return_code: 0,
        data: SmallVec::from_slice(&35_590u32.to_le_bytes()),
    }));
    roundtrip(Message::Dequeue {
        module_type: 3,
        module_id: 1,
        return_code: 0,
    });
    roundtrip(Message::Identify);
    roundtrip(Message::Lock);
    roundtrip(Message::Unlock);
}

#[test]
fn replies_roundtrip() {
    roundtrip(Message::Data(ModuleData {
        module_type: 4,
        module_id: 1,
        command: 0,
        event: 51,
        object: PayloadValue::U16(1_523),
    }));
    roundtrip(Message::Data(ModuleData {
        module_type: 2,
        module_id: 1,
        command: 0,
        event: 52,
        object: PayloadValue::U32(817),
    }));
    roundtrip(Message::State(ModuleState {
        module_type: 5,
        module_id: 1,
        command: 1,
        event: 52,
    }));
    roundtrip(Message::Identification(Identification { controller_id: 7 }));
}

#[test]
fn back_to_back_frames_decode_in_order() {
    let first = Message::State(ModuleState {
        module_type: 5,
        module_id: 1,
        command: 1,
        event: 51,
    });
    let second = Message::Data(ModuleData {
        module_type: 4,
        module_id: 1,
        command: 0,
        event: 51,
        object: PayloadValue::U16(0),
    });

    let mut stream = encode_message(&first).expect("encode");
    stream.extend_from_slice(&encode_message(&second).expect("encode"));

    let mut reader = FrameReader::new();
    reader.push_bytes(&stream);
    let a = reader.next_payload().expect("frame").expect("complete");
    let b = reader.next_payload().expect("frame").expect("complete");
    assert_eq!(Message::decode_payload(&a).expect("decode"), first);
    assert_eq!(Message::decode_payload(&b).expect("decode"), second);
    assert!(reader.next_payload().expect("drained").is_none());
}
