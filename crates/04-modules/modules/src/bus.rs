//! Contract with the external pub/sub bridge.
//!
//! The runtime that mirrors behavioral data into a game engine (or any other
//! live consumer) is an external collaborator; the core only promises to
//! call [`BusPublisher::publish`] from the communication worker with the
//! topics each module declares. Payload encodings are part of each module's
//! documented topic contract.

use std::sync::Arc;

/// Outbound side of the pub/sub bridge.
pub trait BusPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]);
}

/// Shared handle the interfaces hold.
pub type BusHandle = Arc<dyn BusPublisher>;

/// Discards every message; the default when no bridge is attached.
#[derive(Debug, Default)]
pub struct NullBus;

impl BusPublisher for NullBus {
    fn publish(&self, _topic: &str, _payload: &[u8]) {}
}

/// Returns the default disconnected bus handle.
pub fn null_bus() -> BusHandle {
    Arc::new(NullBus)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Captures published messages for assertions.
    #[derive(Default)]
    pub struct RecordingBus {
        pub messages: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl BusPublisher for RecordingBus {
        fn publish(&self, topic: &str, payload: &[u8]) {
            self.messages
                .lock()
                .expect("bus mutex")
                .push((topic.to_owned(), payload.to_vec()));
        }
    }
}
