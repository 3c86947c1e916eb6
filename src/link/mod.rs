//! Shared-link scheduler for the half-duplex serial bus
//!
//! Both servo controllers sit on one serial port. This module owns that port
//! through a single worker thread and serializes every frame onto it:
//!
//! - Four priority classes, strict highest-first, FIFO within a class.
//! - Opportunistic batching: queue-adjacent set-target requests for the
//!   same device whose channels form a contiguous ascending run are merged
//!   into one compound frame (up to `max_batch`); the wire command
//!   addresses a literal channel range, so a channel gap ends the run.
//!   Emergency and High traffic is never batched, and preemption happens
//!   at frame boundaries only.
//! - Transient I/O failures are retried with exponential backoff; a fatal
//!   failure fails every pending request with `TransportDown` and puts the
//!   scheduler into quarantine, reopening the port once per second.
//!
//! # Thread Model
//!
//! One worker thread (`link-worker`) performs all transport I/O. Submitters
//! block only on queue capacity; they observe completion through a
//! [`Ticket`]. The queue mutex is held only for queue manipulation, never
//! across wire I/O.

mod request;
mod stats;

pub use request::{BatchTarget, DeviceId, Priority, Request, Ticket};
pub use stats::{LinkStats, LinkStatsSnapshot, QueueDepths};

use crate::bus::{AlertCode, Event, EventBus};
use crate::error::{Error, Result};
use crate::transport::Transport;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Produces a fresh transport; called at startup and on every reopen attempt
pub type TransportFactory = Box<dyn FnMut() -> Result<Box<dyn Transport>> + Send>;

/// A device driver registered with the scheduler
///
/// The scheduler stays protocol-agnostic: when it decides to coalesce
/// requests it asks the owning driver to encode the compound frame.
pub trait LinkDevice: Send + Sync {
    fn device_id(&self) -> DeviceId;

    /// Encode one compound frame carrying all of `targets`
    ///
    /// Encoders reject target sets their wire format cannot express (the
    /// servo protocol requires a contiguous channel range); the scheduler
    /// fails the affected requests instead of writing a wrong frame.
    fn encode_batch(&self, targets: &[BatchTarget]) -> Result<Vec<u8>>;
}

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Per-class queue capacity; `Emergency` ignores it
    pub queue_capacity: usize,
    /// Maximum requests coalesced into one compound frame
    pub max_batch: usize,
    /// Retries after the initial attempt on transient failures
    pub max_retries: u32,
    /// Backoff before the first retry; quadruples each retry (10/40/160 ms)
    pub retry_backoff: Duration,
    /// Read timeout for expected replies
    pub reply_timeout: Duration,
    /// Default ticket wait for requests without a reply
    pub request_timeout: Duration,
    /// Delay between reopen attempts while quarantined
    pub reopen_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_batch: 8,
            max_retries: 3,
            retry_backoff: Duration::from_millis(10),
            reply_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_millis(500),
            reopen_interval: Duration::from_secs(1),
        }
    }
}

struct Queues {
    classes: [VecDeque<Request>; Priority::COUNT],
}

impl Queues {
    fn new() -> Self {
        Self {
            classes: Default::default(),
        }
    }

    fn total_len(&self) -> usize {
        self.classes.iter().map(|q| q.len()).sum()
    }
}

struct LinkShared {
    queues: Mutex<Queues>,
    work_ready: Condvar,
    space_ready: Condvar,
    quarantined: AtomicBool,
    shutdown: AtomicBool,
    stats: LinkStats,
    devices: Mutex<HashMap<DeviceId, Arc<dyn LinkDevice>>>,
    config: LinkConfig,
    events: EventBus,
}

/// The shared serial link scheduler
pub struct LinkScheduler {
    shared: Arc<LinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LinkScheduler {
    /// Create the scheduler and start its worker thread
    ///
    /// If the initial transport open fails the scheduler starts quarantined
    /// and keeps trying to open the port.
    pub fn new(factory: TransportFactory, config: LinkConfig, events: EventBus) -> Result<Arc<Self>> {
        let shared = Arc::new(LinkShared {
            queues: Mutex::new(Queues::new()),
            work_ready: Condvar::new(),
            space_ready: Condvar::new(),
            quarantined: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            stats: LinkStats::default(),
            devices: Mutex::new(HashMap::new()),
            config,
            events,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("link-worker".to_string())
            .spawn(move || worker_loop(worker_shared, factory))
            .map_err(|e| Error::Other(format!("failed to spawn link worker: {}", e)))?;

        Ok(Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Register a device driver for compound-frame encoding
    pub fn register_device(&self, device: Arc<dyn LinkDevice>) {
        let id = device.device_id();
        self.shared.devices.lock().insert(id, device);
        log::info!("Registered link device: {}", id);
    }

    /// Submit a request, blocking while the class queue is at capacity
    pub fn submit(&self, request: Request) -> Result<()> {
        self.enqueue(request, true)
    }

    /// Submit without blocking; a full queue rejects with `Busy`
    pub fn try_submit(&self, request: Request) -> Result<()> {
        self.enqueue(request, false)
    }

    fn enqueue(&self, request: Request, blocking: bool) -> Result<()> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if shared.quarantined.load(Ordering::Relaxed) {
            return Err(Error::TransportDown);
        }

        let priority = request.priority;
        let idx = priority.index();
        let mut queues = shared.queues.lock();

        // Emergency requests must never be refused for capacity reasons.
        if priority != Priority::Emergency {
            while queues.classes[idx].len() >= shared.config.queue_capacity {
                if !blocking {
                    return Err(Error::Busy("link queue full".into()));
                }
                shared
                    .space_ready
                    .wait_for(&mut queues, Duration::from_millis(100));
                if shared.shutdown.load(Ordering::Relaxed) {
                    return Err(Error::Shutdown);
                }
                if shared.quarantined.load(Ordering::Relaxed) {
                    return Err(Error::TransportDown);
                }
            }
        }

        queues.classes[idx].push_back(request);
        shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        shared.stats.record_depth(priority, queues.classes[idx].len());
        shared.work_ready.notify_one();
        Ok(())
    }

    /// Fail every pending sub-Emergency request for `device`
    ///
    /// Used by `stop_all`: queued writes for a device being stopped must not
    /// reach the wire after the stop frame is queued.
    pub fn cancel_pending(&self, device: DeviceId) {
        let mut queues = self.shared.queues.lock();
        let mut cancelled = 0usize;
        for priority in [Priority::High, Priority::Normal, Priority::Background] {
            let idx = priority.index();
            let queue = &mut queues.classes[idx];
            let before = queue.len();
            queue.retain(|req| {
                if req.device == device {
                    req.complete(Err(Error::Busy("cancelled by stop_all".into())));
                    false
                } else {
                    true
                }
            });
            cancelled += before - queue.len();
            self.shared.stats.record_depth(priority, queue.len());
        }
        if cancelled > 0 {
            log::info!("Cancelled {} pending requests for {}", cancelled, device);
            self.shared.space_ready.notify_all();
        }
    }

    /// Whether the link is quarantined after a fatal transport failure
    pub fn is_quarantined(&self) -> bool {
        self.shared.quarantined.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Default ticket wait for fire-and-forget requests
    pub fn request_timeout(&self) -> Duration {
        self.shared.config.request_timeout
    }

    /// Default ticket wait for requests that expect a reply
    pub fn reply_timeout(&self) -> Duration {
        self.shared.config.reply_timeout
    }

    /// Stop the worker and fail anything still queued
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.work_ready.notify_all();
        self.shared.space_ready.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LinkScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One unit of wire work: a single request or a coalesced run
struct WorkItem {
    requests: Vec<Request>,
}

/// Pop the next work item: highest non-empty class, FIFO within it,
/// coalescing a run of batchable requests from the head.
///
/// Coalescing requires adjacency in the queue AND in channel number: the
/// compound wire frame addresses a literal contiguous channel range, so a
/// request only joins the run when its channel extends the run by exactly
/// one. A gap (e.g. channels 1 then 4) ends the run and the later targets
/// form their own frame.
fn pop_next_work(queues: &mut Queues, stats: &LinkStats, max_batch: usize) -> Option<WorkItem> {
    let now = Instant::now();
    for priority in [
        Priority::Emergency,
        Priority::High,
        Priority::Normal,
        Priority::Background,
    ] {
        let idx = priority.index();
        loop {
            let Some(head) = queues.classes[idx].pop_front() else {
                break;
            };
            // Deadline check happens before any wire write: expiry here has
            // no side effects.
            if head.expired(now) {
                head.complete(Err(Error::Timeout));
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut requests = vec![head];
            if priority.batchable() {
                let device = requests[0].device;
                let mut last_channel = requests[0]
                    .batch
                    .as_ref()
                    .and_then(|targets| targets.last().map(|t| t.channel));
                while requests.len() < max_batch {
                    let Some(last) = last_channel else { break };
                    let extends_run = queues.classes[idx]
                        .front()
                        .map(|next| {
                            next.device == device
                                && !next.expects_reply
                                && next
                                    .batch
                                    .as_ref()
                                    .and_then(|targets| targets.first())
                                    .map(|t| t.channel as u16 == last as u16 + 1)
                                    .unwrap_or(false)
                        })
                        .unwrap_or(false);
                    if !extends_run {
                        break;
                    }
                    let next = queues.classes[idx].pop_front().unwrap();
                    if next.expired(now) {
                        next.complete(Err(Error::Timeout));
                        stats.timeouts.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    last_channel = next
                        .batch
                        .as_ref()
                        .and_then(|targets| targets.last().map(|t| t.channel));
                    requests.push(next);
                }
            }
            stats.record_depth(priority, queues.classes[idx].len());
            return Some(WorkItem { requests });
        }
    }
    None
}

fn worker_loop(shared: Arc<LinkShared>, mut factory: TransportFactory) {
    log::info!("Link worker started");

    let mut transport = match factory() {
        Ok(t) => Some(t),
        Err(e) => {
            log::error!("Initial transport open failed: {}", e);
            None
        }
    };
    if transport.is_none() {
        enter_quarantine(&shared);
    }

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        if transport.is_none() {
            match attempt_reopen(&shared, &mut factory) {
                Some(t) => transport = Some(t),
                None => break, // shutdown during quarantine
            }
            continue;
        }

        let work = {
            let mut queues = shared.queues.lock();
            loop {
                if shared.shutdown.load(Ordering::Relaxed) {
                    break None;
                }
                if let Some(work) =
                    pop_next_work(&mut queues, &shared.stats, shared.config.max_batch)
                {
                    shared.space_ready.notify_all();
                    break Some(work);
                }
                shared
                    .work_ready
                    .wait_for(&mut queues, Duration::from_millis(100));
            }
        };

        let Some(work) = work else {
            continue;
        };

        let port = transport.as_mut().unwrap();
        match execute(&shared, port, &work) {
            ExecOutcome::Done => {}
            ExecOutcome::TransportLost => {
                transport = None;
                enter_quarantine(&shared);
            }
        }
    }

    // Fail anything left queued so no ticket waits forever.
    fail_all_pending(&shared, || Error::Shutdown);
    log::info!("Link worker exiting");
}

enum ExecOutcome {
    Done,
    TransportLost,
}

/// Write one work item, retrying transient failures with backoff
fn execute(shared: &LinkShared, transport: &mut Box<dyn Transport>, work: &WorkItem) -> ExecOutcome {
    let config = &shared.config;

    let (frame, expects_reply, reply_len) = if work.requests.len() > 1 {
        let targets: Vec<BatchTarget> = work
            .requests
            .iter()
            .flat_map(|r| r.batch.clone().unwrap_or_default())
            .collect();
        let device = work.requests[0].device;
        let encoder = shared.devices.lock().get(&device).cloned();
        match encoder {
            Some(dev) => match dev.encode_batch(&targets) {
                Ok(frame) => {
                    shared.stats.batched_frames.fetch_add(1, Ordering::Relaxed);
                    shared
                        .stats
                        .batched_requests
                        .fetch_add(work.requests.len() as u64, Ordering::Relaxed);
                    (frame, false, 0)
                }
                Err(e) => {
                    // The scheduler only merges channel-adjacent runs, so an
                    // inexpressible set here is an internal error. Fail the
                    // requests rather than write a frame that would address
                    // the wrong channels.
                    log::error!("Compound frame encode failed for {}: {}", device, e);
                    for req in &work.requests {
                        req.complete(Err(Error::Other(format!(
                            "compound frame encode failed: {}",
                            e
                        ))));
                    }
                    shared
                        .stats
                        .failed
                        .fetch_add(work.requests.len() as u64, Ordering::Relaxed);
                    return ExecOutcome::Done;
                }
            },
            None => {
                // No encoder registered: fall back to the head frame and
                // re-queue the rest individually. This should not happen in
                // a wired system; log loudly.
                log::error!("No batch encoder registered for {}", device);
                for req in work.requests.iter().skip(1) {
                    req.complete(Err(Error::Other("no batch encoder".into())));
                }
                (work.requests[0].frame.clone(), false, 0)
            }
        }
    } else {
        let req = &work.requests[0];
        (req.frame.clone(), req.expects_reply, req.reply_len)
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = transact(transport, &frame, expects_reply, reply_len, config);
        match result {
            Ok(reply) => {
                for req in &work.requests {
                    let waited = req.enqueued_at.elapsed();
                    log::trace!(
                        "Request for {} completed after {:?} (attempt {})",
                        req.device,
                        waited,
                        attempt
                    );
                    req.complete(Ok(reply.clone()));
                }
                shared
                    .stats
                    .completed
                    .fetch_add(work.requests.len() as u64, Ordering::Relaxed);
                return ExecOutcome::Done;
            }
            Err(e) if e.is_transient() => {
                shared.stats.retries.fetch_add(1, Ordering::Relaxed);
                if attempt > config.max_retries {
                    log::warn!(
                        "Request failed after {} attempts: {}",
                        attempt,
                        e
                    );
                    for req in &work.requests {
                        req.complete(Err(Error::TransportFailed));
                    }
                    shared
                        .stats
                        .failed
                        .fetch_add(work.requests.len() as u64, Ordering::Relaxed);
                    return ExecOutcome::Done;
                }
                // 10ms, 40ms, 160ms
                let backoff = config.retry_backoff * 4u32.pow(attempt - 1);
                log::debug!("Transient link failure ({}), retrying in {:?}", e, backoff);
                thread::sleep(backoff);
            }
            Err(e) => {
                log::error!("Fatal transport failure: {}", e);
                for req in &work.requests {
                    req.complete(Err(Error::TransportDown));
                }
                shared
                    .stats
                    .failed
                    .fetch_add(work.requests.len() as u64, Ordering::Relaxed);
                return ExecOutcome::TransportLost;
            }
        }
    }
}

fn transact(
    transport: &mut Box<dyn Transport>,
    frame: &[u8],
    expects_reply: bool,
    reply_len: usize,
    config: &LinkConfig,
) -> Result<Vec<u8>> {
    transport.write_all(frame)?;
    if expects_reply {
        transport.set_timeout(config.reply_timeout)?;
        let mut reply = vec![0u8; reply_len];
        transport.read_exact(&mut reply)?;
        Ok(reply)
    } else {
        Ok(Vec::new())
    }
}

fn enter_quarantine(shared: &LinkShared) {
    shared.quarantined.store(true, Ordering::Relaxed);
    shared.stats.transport_drops.fetch_add(1, Ordering::Relaxed);
    fail_all_pending(shared, || Error::TransportDown);
    shared.events.publish(Event::Alert {
        code: AlertCode::TransportDown,
        message: "serial link lost, attempting reopen".into(),
    });
    log::warn!("Link quarantined; reopening every {:?}", shared.config.reopen_interval);
}

fn fail_all_pending(shared: &LinkShared, err: impl Fn() -> Error) {
    let mut queues = shared.queues.lock();
    let pending = queues.total_len();
    for priority in [
        Priority::Emergency,
        Priority::High,
        Priority::Normal,
        Priority::Background,
    ] {
        let idx = priority.index();
        while let Some(req) = queues.classes[idx].pop_front() {
            req.complete(Err(err()));
        }
        shared.stats.record_depth(priority, 0);
    }
    if pending > 0 {
        shared.stats.failed.fetch_add(pending as u64, Ordering::Relaxed);
        log::warn!("Failed {} pending link requests", pending);
    }
    shared.space_ready.notify_all();
}

/// Reopen loop; returns None if shutdown was requested meanwhile
fn attempt_reopen(
    shared: &LinkShared,
    factory: &mut TransportFactory,
) -> Option<Box<dyn Transport>> {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return None;
        }
        thread::sleep(shared.config.reopen_interval);
        if shared.shutdown.load(Ordering::Relaxed) {
            return None;
        }
        match factory() {
            Ok(mut transport) => {
                let _ = transport.drain();
                shared.quarantined.store(false, Ordering::Relaxed);
                log::info!("Serial link reopened, leaving quarantine");
                return Some(transport);
            }
            Err(e) => {
                log::debug!("Reopen attempt failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InjectedFailure, MockTransport};

    fn test_config() -> LinkConfig {
        LinkConfig {
            reopen_interval: Duration::from_millis(10),
            ..LinkConfig::default()
        }
    }

    fn scheduler_with(mock: MockTransport, config: LinkConfig) -> Arc<LinkScheduler> {
        let factory: TransportFactory = Box::new(move || {
            let t: Box<dyn Transport> = Box::new(mock.clone());
            Ok(t)
        });
        LinkScheduler::new(factory, config, EventBus::new()).unwrap()
    }

    struct FakeDevice(DeviceId);

    impl LinkDevice for FakeDevice {
        fn device_id(&self) -> DeviceId {
            self.0
        }
        fn encode_batch(&self, targets: &[BatchTarget]) -> crate::error::Result<Vec<u8>> {
            let mut frame = vec![0xAA, 0x0C, 0x1F, targets.len() as u8];
            for t in targets {
                frame.push(t.channel);
            }
            Ok(frame)
        }
    }

    fn batchable_request(device: DeviceId, channel: u8) -> (Request, Ticket) {
        let (req, ticket) = Request::new(device, Priority::Normal, vec![0xAA, 0x0C, 0x04, channel]);
        let req = req.with_batch(vec![BatchTarget {
            channel,
            target_us: 1500,
        }]);
        (req, ticket)
    }

    #[test]
    fn single_request_completes() {
        let mock = MockTransport::new();
        let link = scheduler_with(mock.clone(), test_config());
        let (req, ticket) = Request::new(DeviceId::Dev1, Priority::Normal, vec![1, 2, 3]);
        link.submit(req).unwrap();
        ticket.wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(mock.written_frames(), vec![vec![1, 2, 3]]);
        link.shutdown();
    }

    #[test]
    fn reply_request_returns_bytes() {
        let mock = MockTransport::new();
        mock.inject_read(&[0x70, 0x17]);
        let link = scheduler_with(mock.clone(), test_config());
        let (req, ticket) = Request::new(DeviceId::Dev1, Priority::High, vec![0xAA, 12, 0x10, 0]);
        link.submit(req.with_reply(2)).unwrap();
        let reply = ticket.wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply, vec![0x70, 0x17]);
        link.shutdown();
    }

    #[test]
    fn transient_failures_retry_then_succeed() {
        let mock = MockTransport::new();
        mock.fail_next_writes(2, InjectedFailure::Transient);
        let link = scheduler_with(mock.clone(), test_config());
        let (req, ticket) = Request::new(DeviceId::Dev1, Priority::Normal, vec![9]);
        link.submit(req).unwrap();
        ticket.wait_timeout(Duration::from_secs(2)).unwrap();
        let stats = link.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(mock.written_frames(), vec![vec![9]]);
        link.shutdown();
    }

    #[test]
    fn exhausted_retries_fail_with_transport_failed() {
        let mock = MockTransport::new();
        mock.fail_next_writes(10, InjectedFailure::Transient);
        let link = scheduler_with(mock.clone(), test_config());
        let (req, ticket) = Request::new(DeviceId::Dev1, Priority::Normal, vec![9]);
        link.submit(req).unwrap();
        let err = ticket.wait_timeout(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::TransportFailed));
        assert!(!link.is_quarantined());
        link.shutdown();
    }

    #[test]
    fn fatal_failure_quarantines_and_recovers() {
        let mock = MockTransport::new();
        let link = scheduler_with(mock.clone(), test_config());

        // Queue a few requests, then kill the device under the first write.
        mock.fail_next_writes(1, InjectedFailure::Fatal);
        let mut tickets = Vec::new();
        for i in 0..5 {
            let (req, ticket) = Request::new(DeviceId::Dev1, Priority::Normal, vec![i]);
            match link.submit(req) {
                Ok(()) => tickets.push(ticket),
                // Quarantine may already have hit; that is the expected
                // fast-fail path for late submissions.
                Err(Error::TransportDown) => {}
                Err(e) => panic!("unexpected submit error: {}", e),
            }
        }
        for ticket in tickets {
            let err = ticket.wait_timeout(Duration::from_secs(2)).unwrap_err();
            assert!(matches!(err, Error::TransportDown), "got {:?}", err);
        }

        // The factory hands back the same healed mock; wait for reopen.
        let deadline = Instant::now() + Duration::from_secs(2);
        while link.is_quarantined() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!link.is_quarantined());

        let (req, ticket) = Request::new(DeviceId::Dev1, Priority::Normal, vec![0xFF]);
        link.submit(req).unwrap();
        ticket.wait_timeout(Duration::from_secs(1)).unwrap();
        link.shutdown();
    }

    #[test]
    fn emergency_pops_before_backlog() {
        let stats = LinkStats::default();
        let mut queues = Queues::new();
        for i in 0..10 {
            let (req, _t) = Request::new(DeviceId::Dev1, Priority::Background, vec![i]);
            queues.classes[Priority::Background.index()].push_back(req);
        }
        let (req, _t) = Request::new(DeviceId::Dev1, Priority::Emergency, vec![0xEE]);
        queues.classes[Priority::Emergency.index()].push_back(req);

        let work = pop_next_work(&mut queues, &stats, 8).unwrap();
        assert_eq!(work.requests.len(), 1);
        assert_eq!(work.requests[0].frame, vec![0xEE]);
    }

    #[test]
    fn contiguous_same_device_run_is_coalesced() {
        let stats = LinkStats::default();
        let mut queues = Queues::new();
        let mut tickets = Vec::new();
        for channel in 0..5 {
            let (req, t) = batchable_request(DeviceId::Dev1, channel);
            queues.classes[Priority::Normal.index()].push_back(req);
            tickets.push(t);
        }
        // A request for the other device ends the run.
        let (req, _t) = batchable_request(DeviceId::Dev2, 0);
        queues.classes[Priority::Normal.index()].push_back(req);

        let work = pop_next_work(&mut queues, &stats, 8).unwrap();
        assert_eq!(work.requests.len(), 5);
        assert!(work.requests.iter().all(|r| r.device == DeviceId::Dev1));
        assert_eq!(queues.classes[Priority::Normal.index()].len(), 1);
    }

    #[test]
    fn channel_gap_splits_coalescing_run() {
        // Channels 1, 4, 5 for one device: 1 must ship alone, 4 and 5 may
        // merge. A naive merge of all three would encode "3 targets from
        // channel 1" and steer channels 2 and 3, which were never commanded.
        let stats = LinkStats::default();
        let mut queues = Queues::new();
        let mut tickets = Vec::new();
        for channel in [1u8, 4, 5] {
            let (req, t) = batchable_request(DeviceId::Dev1, channel);
            queues.classes[Priority::Normal.index()].push_back(req);
            tickets.push(t);
        }

        let work = pop_next_work(&mut queues, &stats, 8).unwrap();
        assert_eq!(work.requests.len(), 1);
        assert_eq!(work.requests[0].batch.as_ref().unwrap()[0].channel, 1);

        let work = pop_next_work(&mut queues, &stats, 8).unwrap();
        assert_eq!(work.requests.len(), 2);
        let channels: Vec<u8> = work
            .requests
            .iter()
            .map(|r| r.batch.as_ref().unwrap()[0].channel)
            .collect();
        assert_eq!(channels, vec![4, 5]);
        assert!(queues.classes[Priority::Normal.index()].is_empty());
    }

    #[test]
    fn batch_respects_max() {
        let stats = LinkStats::default();
        let mut queues = Queues::new();
        let mut tickets = Vec::new();
        for channel in 0..12 {
            let (req, t) = batchable_request(DeviceId::Dev1, channel);
            queues.classes[Priority::Normal.index()].push_back(req);
            tickets.push(t);
        }
        let work = pop_next_work(&mut queues, &stats, 8).unwrap();
        assert_eq!(work.requests.len(), 8);
        assert_eq!(queues.classes[Priority::Normal.index()].len(), 4);
    }

    #[test]
    fn expired_deadline_times_out_before_write() {
        let mock = MockTransport::new();
        let link = scheduler_with(mock.clone(), test_config());
        let (req, ticket) = Request::new(DeviceId::Dev1, Priority::Background, vec![7]);
        let req = req.with_deadline(Instant::now() - Duration::from_millis(1));
        link.submit(req).unwrap();
        let err = ticket.wait_timeout(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // Give the worker a moment, then confirm nothing hit the wire.
        thread::sleep(Duration::from_millis(50));
        assert!(mock.written_frames().is_empty());
        link.shutdown();
    }

    #[test]
    fn batched_frames_written_as_compound() {
        let mock = MockTransport::new();
        let link = scheduler_with(mock.clone(), test_config());
        link.register_device(Arc::new(FakeDevice(DeviceId::Dev1)));

        // Stall the worker briefly so all requests queue up together.
        mock.fail_next_writes(1, InjectedFailure::Transient);
        let mut tickets = Vec::new();
        for channel in 0..4 {
            let (req, t) = batchable_request(DeviceId::Dev1, channel);
            link.submit(req).unwrap();
            tickets.push(t);
        }
        for t in tickets {
            t.wait_timeout(Duration::from_secs(2)).unwrap();
        }
        let stats = link.stats();
        assert!(stats.batched_frames >= 1, "stats: {:?}", stats);
        link.shutdown();
    }

    #[test]
    fn cancel_pending_fails_queued_requests() {
        let mock = MockTransport::new();
        // Hold the worker on retries so the queue stays populated.
        mock.fail_next_writes(3, InjectedFailure::Transient);
        let link = scheduler_with(mock.clone(), test_config());

        let (first, first_ticket) = Request::new(DeviceId::Dev1, Priority::Normal, vec![0]);
        link.submit(first).unwrap();
        let (queued, queued_ticket) = Request::new(DeviceId::Dev1, Priority::Normal, vec![1]);
        link.submit(queued).unwrap();

        link.cancel_pending(DeviceId::Dev1);
        let err = queued_ticket.wait_timeout(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        // The in-flight request still completes through its retries.
        first_ticket.wait_timeout(Duration::from_secs(2)).unwrap();
        link.shutdown();
    }

    #[test]
    fn try_submit_rejects_when_full() {
        let mock = MockTransport::new();
        // Keep the worker busy with retries while we overfill the queue.
        mock.fail_next_writes(4, InjectedFailure::Transient);
        let config = LinkConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let link = scheduler_with(mock.clone(), config);

        let (req, _t1) = Request::new(DeviceId::Dev1, Priority::Background, vec![0]);
        link.submit(req).unwrap();
        let (req, _t2) = Request::new(DeviceId::Dev1, Priority::Background, vec![1]);
        link.submit(req).unwrap();
        let (req, _t3) = Request::new(DeviceId::Dev1, Priority::Background, vec![2]);
        link.submit(req).unwrap();

        // Depending on worker progress the queue holds 2 or 3 entries; keep
        // pushing until try_submit reports Busy.
        let mut saw_busy = false;
        for i in 0..4 {
            let (req, _t) = Request::new(DeviceId::Dev1, Priority::Background, vec![3 + i]);
            if matches!(link.try_submit(req), Err(Error::Busy(_))) {
                saw_busy = true;
                break;
            }
        }
        assert!(saw_busy);
        link.shutdown();
    }
}
