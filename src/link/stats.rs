//! Observable counters for the shared-link scheduler

use super::request::Priority;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters, updated by the worker and submitters
#[derive(Default)]
pub struct LinkStats {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) batched_frames: AtomicU64,
    pub(crate) batched_requests: AtomicU64,
    pub(crate) transport_drops: AtomicU64,
    pub(crate) depth: [AtomicUsize; Priority::COUNT],
}

impl LinkStats {
    pub(crate) fn record_depth(&self, priority: Priority, depth: usize) {
        self.depth[priority.index()].store(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let batched_requests = self.batched_requests.load(Ordering::Relaxed);
        LinkStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            batched_frames: self.batched_frames.load(Ordering::Relaxed),
            batched_requests,
            transport_drops: self.transport_drops.load(Ordering::Relaxed),
            batch_ratio: if completed > 0 {
                batched_requests as f64 / completed as f64
            } else {
                0.0
            },
            queue_depths: QueueDepths {
                emergency: self.depth[0].load(Ordering::Relaxed),
                high: self.depth[1].load(Ordering::Relaxed),
                normal: self.depth[2].load(Ordering::Relaxed),
                background: self.depth[3].load(Ordering::Relaxed),
            },
        }
    }
}

/// Point-in-time copy of the scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub batched_frames: u64,
    pub batched_requests: u64,
    pub transport_drops: u64,
    pub batch_ratio: f64,
    pub queue_depths: QueueDepths,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub emergency: usize,
    pub high: usize,
    pub normal: usize,
    pub background: usize,
}
