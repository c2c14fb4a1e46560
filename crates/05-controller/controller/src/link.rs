//! Serial link abstraction.
//!
//! The communication worker is the only owner of a link. The production
//! implementation wraps a [`serialport`] handle configured 8-N-1 with a
//! short read timeout so the worker's poll loop stays responsive; tests and
//! dry runs use the in-memory [`loopback`](crate::loopback) pair instead.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::{ControllerError, ControllerResult};

/// Byte transport the communication worker drives.
///
/// `read_available` returns without blocking for longer than the link's
/// poll timeout and reports `Ok(0)` when no bytes arrived.
pub trait SerialLink: Send {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush_output(&mut self) -> io::Result<()>;
}

/// Production link over a real serial port.
pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPortLink {
    /// Opens `port` at `baud`, 8-N-1, with a 1 ms read timeout.
    pub fn open(port: &str, baud: u32) -> ControllerResult<Self> {
        let handle = serialport::new(port, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|source| ControllerError::PortOpen {
                port: port.to_owned(),
                source,
            })?;
        Ok(Self { port: handle })
    }
}

impl SerialLink for SerialPortLink {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn flush_output(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
