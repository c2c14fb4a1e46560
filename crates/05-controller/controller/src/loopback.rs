//! In-memory duplex link plus a scriptable device endpoint.
//!
//! [`loopback_pair`] yields the host-side [`LoopbackLink`] the controller
//! drives and a [`DeviceEndpoint`] a test (or dry run) uses to play the
//! firmware's part: decode host frames, reply with typed messages.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use wire::{encode_message, FrameReader, Identification, Message};

use crate::link::SerialLink;

#[derive(Default)]
struct Shared {
    host_to_device: Mutex<VecDeque<u8>>,
    device_to_host: Mutex<VecDeque<u8>>,
}

/// Creates a connected host link / device endpoint pair.
pub fn loopback_pair() -> (LoopbackLink, DeviceEndpoint) {
    let shared = Arc::new(Shared::default());
    (
        LoopbackLink {
            shared: Arc::clone(&shared),
        },
        DeviceEndpoint {
            shared,
            reader: FrameReader::new(),
        },
    )
}

/// Host side of the in-memory duplex.
pub struct LoopbackLink {
    shared: Arc<Shared>,
}

impl SerialLink for LoopbackLink {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.shared.device_to_host.lock();
        let n = buf.len().min(queue.len());
        for slot in buf.iter_mut().take(n) {
            *slot = queue.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.shared.host_to_device.lock().extend(bytes.iter());
        Ok(())
    }

    fn flush_output(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Device side: decodes host frames and injects replies.
pub struct DeviceEndpoint {
    shared: Arc<Shared>,
    reader: FrameReader,
}

impl DeviceEndpoint {
    /// Decodes every complete frame the host has written so far.
    pub fn drain_host_messages(&mut self) -> Vec<Message> {
        {
            let mut queue = self.shared.host_to_device.lock();
            let bytes: Vec<u8> = queue.drain(..).collect();
            self.reader.push_bytes(&bytes);
        }

        let mut messages = Vec::new();
        loop {
            match self.reader.next_payload() {
                Ok(Some(payload)) => {
                    if let Ok(message) = Message::decode_payload(&payload) {
                        messages.push(message);
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        messages
    }

    /// Frames and queues a device→host message.
    pub fn send(&self, message: &Message) {
        let frame = encode_message(message).expect("loopback messages are well formed");
        self.shared.device_to_host.lock().extend(frame.iter());
    }

    /// Queues raw bytes, bypassing the codec. Tests use this to inject
    /// corrupt frames.
    pub fn send_raw(&self, bytes: &[u8]) {
        self.shared.device_to_host.lock().extend(bytes.iter());
    }

    /// Replies to a pending identify request, if one arrived.
    ///
    /// Returns `true` when an identify request was consumed.
    pub fn answer_identify(&mut self, controller_id: u8) -> bool {
        let messages = self.drain_host_messages();
        let mut answered = false;
        for message in &messages {
            if matches!(message, Message::Identify) && !answered {
                self.send(&Message::Identification(Identification { controller_id }));
                answered = true;
            }
        }
        answered
    }
}
