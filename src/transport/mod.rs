//! Transport layer for the shared serial link

use crate::error::{Error, Result};
use std::time::Duration;

mod mock;
mod serial;

pub use mock::{InjectedFailure, MockTransport};
pub use serial::SerialTransport;

/// Byte transport owned exclusively by the link scheduler.
///
/// Implementations surface failures in two classes: [`Error::TransientIo`]
/// for timeouts and short reads (the scheduler retries these) and anything
/// else for fatal conditions (device gone, permission denied), which put the
/// scheduler into quarantine.
pub trait Transport: Send {
    /// Write the full buffer to the device.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read exactly `buf.len()` bytes, failing with `TransientIo` on timeout.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Change the read timeout for subsequent `read_exact` calls.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Discard any unread input bytes.
    fn drain(&mut self) -> Result<()>;
}

/// Map an I/O error into the transport failure taxonomy.
///
/// Timeouts and interrupts are retriable; everything else (NotFound,
/// PermissionDenied, BrokenPipe from an unplugged adapter) is fatal.
pub(crate) fn classify_io(e: std::io::Error) -> Error {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            Error::TransientIo(e.to_string())
        }
        _ => Error::Io(e),
    }
}
