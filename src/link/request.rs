//! Request and completion types for the shared-link scheduler

use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Logical servo controller on the shared serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceId {
    Dev1,
    Dev2,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Dev1 => write!(f, "dev1"),
            DeviceId::Dev2 => write!(f, "dev2"),
        }
    }
}

/// Scheduler priority classes, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Emergency,
    High,
    Normal,
    Background,
}

impl Priority {
    pub const COUNT: usize = 4;

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Priority::Emergency => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Background => 3,
        }
    }

    /// Classes eligible for opportunistic batching
    #[inline]
    pub fn batchable(self) -> bool {
        matches!(self, Priority::Normal | Priority::Background)
    }
}

/// One servo target inside a coalescable set-target request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTarget {
    pub channel: u8,
    pub target_us: u16,
}

/// A request queued for the shared serial link
///
/// Created together with its [`Ticket`]; the scheduler consumes the request
/// and resolves the ticket on completion, cancellation, or failure.
pub struct Request {
    pub device: DeviceId,
    pub priority: Priority,
    pub frame: Vec<u8>,
    pub expects_reply: bool,
    pub reply_len: usize,
    pub deadline: Option<Instant>,
    /// Present when this is a single-device set-target frame the scheduler
    /// may coalesce with its neighbors into one compound frame.
    pub batch: Option<Vec<BatchTarget>>,
    pub(crate) enqueued_at: Instant,
    pub(crate) completion: Sender<Result<Vec<u8>>>,
}

impl Request {
    pub fn new(device: DeviceId, priority: Priority, frame: Vec<u8>) -> (Self, Ticket) {
        let (tx, rx) = bounded(1);
        (
            Request {
                device,
                priority,
                frame,
                expects_reply: false,
                reply_len: 0,
                deadline: None,
                batch: None,
                enqueued_at: Instant::now(),
                completion: tx,
            },
            Ticket { rx },
        )
    }

    /// Expect a fixed-length reply after the frame is written
    pub fn with_reply(mut self, reply_len: usize) -> Self {
        self.expects_reply = true;
        self.reply_len = reply_len;
        self
    }

    /// Fail with `Timeout` if still queued at `deadline` (no side effects)
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Mark as a coalescable set-target request
    pub fn with_batch(mut self, targets: Vec<BatchTarget>) -> Self {
        self.batch = Some(targets);
        self
    }

    pub(crate) fn complete(&self, result: Result<Vec<u8>>) {
        // The caller may have dropped the ticket; that is not an error.
        let _ = self.completion.send(result);
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("device", &self.device)
            .field("priority", &self.priority)
            .field("frame_len", &self.frame.len())
            .field("expects_reply", &self.expects_reply)
            .field("batch", &self.batch.as_ref().map(|b| b.len()))
            .finish()
    }
}

/// Completion handle for a submitted request
///
/// Await the outcome with [`wait`](Self::wait) or
/// [`wait_timeout`](Self::wait_timeout); dropping the ticket detaches from
/// the request without cancelling it.
pub struct Ticket {
    rx: Receiver<Result<Vec<u8>>>,
}

impl Ticket {
    /// Block until the request completes
    pub fn wait(self) -> Result<Vec<u8>> {
        self.rx.recv().unwrap_or(Err(Error::Shutdown))
    }

    /// Block until the request completes or the timeout elapses
    pub fn wait_timeout(self, timeout: Duration) -> Result<Vec<u8>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Error::Shutdown),
        }
    }
}
