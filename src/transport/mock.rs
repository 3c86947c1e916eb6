//! Mock transport for testing

use super::Transport;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Failure injected into the next transport operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Timeout-class failure, retriable by the scheduler
    Transient,
    /// Device-gone failure, quarantines the link
    Fatal,
}

struct MockTransportInner {
    read_buffer: VecDeque<u8>,
    write_log: Vec<Vec<u8>>,
    /// Remaining writes that should fail, and how
    fail_writes: Option<(usize, InjectedFailure)>,
    /// Remaining reads that should fail, and how
    fail_reads: Option<(usize, InjectedFailure)>,
}

/// Deterministic transport double for link scheduler and driver tests
///
/// Clones share the same buffers, so a test can keep one handle for
/// inspection while the scheduler owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(MockTransportInner {
                read_buffer: VecDeque::new(),
                write_log: Vec::new(),
                fail_writes: None,
                fail_reads: None,
            })),
        }
    }

    /// Queue bytes to be returned by subsequent reads
    pub fn inject_read(&self, data: &[u8]) {
        self.inner.lock().read_buffer.extend(data);
    }

    /// All frames written so far, one entry per `write_all` call
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.inner.lock().write_log.clone()
    }

    /// All written bytes concatenated
    pub fn written_bytes(&self) -> Vec<u8> {
        self.inner.lock().write_log.concat()
    }

    pub fn clear_written(&self) {
        self.inner.lock().write_log.clear();
    }

    /// Make the next `count` writes fail with the given failure class
    pub fn fail_next_writes(&self, count: usize, mode: InjectedFailure) {
        self.inner.lock().fail_writes = Some((count, mode));
    }

    /// Make the next `count` reads fail with the given failure class
    pub fn fail_next_reads(&self, count: usize, mode: InjectedFailure) {
        self.inner.lock().fail_reads = Some((count, mode));
    }

    /// Clear any injected failures (simulates the device coming back)
    pub fn heal(&self) {
        let mut inner = self.inner.lock();
        inner.fail_writes = None;
        inner.fail_reads = None;
    }

    fn take_failure(slot: &mut Option<(usize, InjectedFailure)>) -> Option<InjectedFailure> {
        match slot {
            Some((remaining, mode)) => {
                let mode = *mode;
                *remaining -= 1;
                if *remaining == 0 {
                    *slot = None;
                }
                Some(mode)
            }
            None => None,
        }
    }

    fn failure_error(mode: InjectedFailure) -> Error {
        match mode {
            InjectedFailure::Transient => Error::TransientIo("injected timeout".into()),
            InjectedFailure::Fatal => Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "injected device loss",
            )),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mode) = Self::take_failure(&mut inner.fail_writes) {
            return Err(Self::failure_error(mode));
        }
        inner.write_log.push(data.to_vec());
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mode) = Self::take_failure(&mut inner.fail_reads) {
            return Err(Self::failure_error(mode));
        }
        if inner.read_buffer.len() < buf.len() {
            return Err(Error::TransientIo(format!(
                "short read: wanted {}, have {}",
                buf.len(),
                inner.read_buffer.len()
            )));
        }
        for slot in buf.iter_mut() {
            *slot = inner.read_buffer.pop_front().unwrap();
        }
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.inner.lock().read_buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_log_records_frames() {
        let mut t = MockTransport::new();
        t.write_all(&[0xAA, 12, 0x04]).unwrap();
        t.write_all(&[0xAA, 13, 0x24]).unwrap();
        assert_eq!(t.written_frames().len(), 2);
        assert_eq!(t.written_bytes(), vec![0xAA, 12, 0x04, 0xAA, 13, 0x24]);
    }

    #[test]
    fn injected_transient_failure_clears_after_count() {
        let mut t = MockTransport::new();
        t.fail_next_writes(1, InjectedFailure::Transient);
        assert!(matches!(
            t.write_all(&[0x00]),
            Err(Error::TransientIo(_))
        ));
        assert!(t.write_all(&[0x01]).is_ok());
    }

    #[test]
    fn short_read_is_transient() {
        let mut t = MockTransport::new();
        t.inject_read(&[0x10]);
        let mut buf = [0u8; 2];
        assert!(matches!(t.read_exact(&mut buf), Err(Error::TransientIo(_))));
    }
}
