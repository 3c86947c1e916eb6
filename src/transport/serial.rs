//! Serial transport implementation

use super::{classify_io, Transport};
use crate::error::Result;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

/// Default read timeout; the link scheduler overrides this per request.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Serial transport for the shared half-duplex controller link
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial port at 8N1 with no flow control
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyAMA0")
    /// * `baud_rate` - Baud rate (e.g., 9600)
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;

        log::info!("Opened serial port: {} at {} baud", path, baud_rate);

        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data).map_err(classify_io)?;
        self.port.flush().map_err(classify_io)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf).map_err(classify_io)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending > 0 {
            let mut sink = vec![0u8; pending];
            self.port.read_exact(&mut sink).map_err(classify_io)?;
            log::debug!("Drained {} stale bytes from serial input", pending);
        }
        Ok(())
    }
}
