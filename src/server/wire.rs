//! Wire framing for the TCP command channel
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)       │
//! │ Big-endian u32   │ JSON                     │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! Both directions use the same framing: clients send command envelopes,
//! the daemon sends replies and broadcast events. Maximum message size is
//! 1 MiB; anything larger is treated as a protocol violation.

use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::TcpStream;

const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read one frame; `None` on a clean read timeout so callers can poll a
/// shutdown flag between frames
pub fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            return Ok(None);
        }
        Err(e) => return Err(Error::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Other(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Write one frame
pub fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len)?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}
