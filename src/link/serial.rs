//! Serial link abstraction — any byte-oriented channel to the co-processor.
//!
//! Concrete implementations:
//! - a real UART via the `serialport` crate
//! - scripted/recording doubles in the test suites
//!
//! The RPC layer is generic over `SerialLink`, so exercising the protocol
//! requires no device and no timing.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::{InitError, TransportError};

/// Byte-oriented channel to the WiFi co-processor.
pub trait SerialLink {
    /// Write all of `data` to the device.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read a single byte, waiting at most `timeout`.
    /// Returns `Ok(None)` when nothing arrived in time.
    fn try_read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError>;
}

/// A link that discards writes and never produces data.
/// Stands in wherever a bridge exists but its device is not yet open.
pub struct NullLink;

impl SerialLink for NullLink {
    fn write_all(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn try_read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, TransportError> {
        Ok(None)
    }
}

/// Real UART behind the `serialport` crate.
pub struct UartLink {
    port: Box<dyn serialport::SerialPort>,
}

impl UartLink {
    /// Open the device. The port's own timeout is re-armed per read call.
    pub fn open(device: &str, baud: u32) -> Result<Self, InitError> {
        let port = serialport::new(device, baud)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|source| InitError::SerialOpen {
                device: device.to_string(),
                source,
            })?;
        Ok(Self { port })
    }
}

impl SerialLink for UartLink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port
            .write_all(data)
            .map_err(|e| TransportError::SerialWrite(e.to_string()))
    }

    fn try_read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        if self.port.set_timeout(timeout).is_err() {
            return Err(TransportError::CoprocessorUnreachable);
        }
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(_) => Err(TransportError::CoprocessorUnreachable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_link_reads_nothing() {
        let mut link = NullLink;
        assert!(matches!(
            link.try_read_byte(Duration::from_millis(1)),
            Ok(None)
        ));
        assert!(link.write_all(&[1, 2, 3]).is_ok());
    }
}
