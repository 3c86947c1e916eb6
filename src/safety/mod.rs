//! Safety supervisor
//!
//! Owns the authoritative [`SystemState`] and gates every actuator write.
//! Adapters cannot bypass it: the servo drivers, the stepper emitter, and the
//! scene engine all consult a [`StateView`] before touching hardware.
//!
//! # State Machine
//!
//! ```text
//! Normal <────> Failsafe          (manual toggle or power thresholds)
//!   │              │
//!   └──────┬───────┘
//!          ▼
//!      Emergency                  (software request or E-stop input edge)
//!          │
//!          ▼
//!       Normal                    (explicit clear only)
//! ```
//!
//! Entering `Emergency` runs the registered stop hooks in registration
//! order while the state lock is held, so the `state_changed` broadcast is
//! ordered before every consequence event (scene cancellation, stop frames).
//!
//! # Threshold Escalation
//!
//! The sensor sampler feeds [`Supervisor::observe_power`] each tick. A
//! voltage below `v_low` or current above `i_max` sustained for `dwell`
//! escalates Normal -> Failsafe. Recovery requires `v_low + recover_margin_v`
//! sustained for `recover`, and only reverses failsafes the supervisor
//! entered on its own; an operator-requested failsafe stays until toggled.

use crate::bus::{AlertCode, AlertSet, Event, EventBus};
use crate::error::{Error, Result};
use crate::maestro::ServoChannel;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Authoritative daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Normal,
    Failsafe,
    Emergency,
    /// Reported while the daemon is starting up, before hardware is live
    Idle,
}

impl SystemState {
    fn from_u8(v: u8) -> SystemState {
        match v {
            0 => SystemState::Normal,
            1 => SystemState::Failsafe,
            2 => SystemState::Emergency,
            _ => SystemState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SystemState::Normal => 0,
            SystemState::Failsafe => 1,
            SystemState::Emergency => 2,
            SystemState::Idle => 3,
        }
    }
}

/// Escalation thresholds for the power rails
#[derive(Debug, Clone)]
pub struct PowerThresholds {
    pub v_low: f64,
    pub i_max: f64,
    pub dwell: Duration,
    pub recover_margin_v: f64,
    pub recover: Duration,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self {
            v_low: 13.2,
            i_max: 50.0,
            dwell: Duration::from_secs(2),
            recover_margin_v: 0.4,
            recover: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct ThresholdTracker {
    breach_since: Option<Instant>,
    good_since: Option<Instant>,
    /// Whether the current failsafe was entered by threshold escalation
    /// (only those are auto-recovered)
    auto_failsafe: bool,
}

struct SupervisorInner {
    /// Ordering lock for transitions and their event publication
    state: Mutex<SystemState>,
    /// Lock-free mirror for hot-path reads (step emitter, drivers)
    state_cell: AtomicU8,
    events: EventBus,
    alerts: AlertSet,
    emergency_hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    /// Channels forced safe while in Failsafe (track motors per config)
    failsafe_channels: RwLock<HashSet<ServoChannel>>,
    thresholds: PowerThresholds,
    tracker: Mutex<ThresholdTracker>,
}

/// The safety supervisor; owns all state transitions
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        thresholds: PowerThresholds,
        failsafe_channels: HashSet<ServoChannel>,
        events: EventBus,
        alerts: AlertSet,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                state: Mutex::new(SystemState::Normal),
                state_cell: AtomicU8::new(SystemState::Normal.as_u8()),
                events,
                alerts,
                emergency_hooks: Mutex::new(Vec::new()),
                failsafe_channels: RwLock::new(failsafe_channels),
                thresholds,
                tracker: Mutex::new(ThresholdTracker::default()),
            }),
        }
    }

    /// Narrow read-side handle handed to components
    pub fn view(&self) -> StateView {
        StateView {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn current(&self) -> SystemState {
        SystemState::from_u8(self.inner.state_cell.load(Ordering::Relaxed))
    }

    /// Register a hook to run on every transition into `Emergency`
    ///
    /// Hooks run in registration order: the system wires scene cancellation
    /// first, then the servo stop-alls, then the stepper halt.
    pub fn on_emergency(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.emergency_hooks.lock().push(Box::new(hook));
    }

    /// Transition to `Emergency` and run all stop hooks
    ///
    /// Idempotent: a second request while already in `Emergency` does
    /// nothing and still reports success.
    pub fn request_emergency(&self, reason: &str) {
        let mut state = self.inner.state.lock();
        if *state == SystemState::Emergency {
            log::debug!("Emergency already active, ignoring request ({})", reason);
            return;
        }
        log::warn!("EMERGENCY STOP requested: {}", reason);
        *state = SystemState::Emergency;
        self.inner
            .state_cell
            .store(SystemState::Emergency.as_u8(), Ordering::SeqCst);
        self.inner.events.publish(Event::StateChanged {
            state: SystemState::Emergency,
        });

        // Hooks run under the state lock so their consequence events are
        // ordered after the state_changed broadcast and no write can slip
        // through a Normal window.
        for hook in self.inner.emergency_hooks.lock().iter() {
            hook();
        }
        self.inner.tracker.lock().auto_failsafe = false;
    }

    /// Leave `Emergency`; the only path back to `Normal`
    pub fn clear_emergency(&self) {
        let mut state = self.inner.state.lock();
        if *state != SystemState::Emergency {
            return;
        }
        log::info!("Emergency cleared, returning to normal");
        *state = SystemState::Normal;
        self.inner
            .state_cell
            .store(SystemState::Normal.as_u8(), Ordering::SeqCst);
        self.inner.events.publish(Event::StateChanged {
            state: SystemState::Normal,
        });
    }

    /// Toggle failsafe mode; rejected while an emergency is active
    pub fn set_failsafe(&self, enabled: bool) -> Result<()> {
        self.transition_failsafe(enabled, false)
    }

    fn transition_failsafe(&self, enabled: bool, auto: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        match (*state, enabled) {
            (SystemState::Emergency, _) => {
                return Err(Error::Busy("emergency active".into()));
            }
            (SystemState::Failsafe, true) | (SystemState::Normal, false) => return Ok(()),
            _ => {}
        }
        let next = if enabled {
            SystemState::Failsafe
        } else {
            SystemState::Normal
        };
        if enabled {
            log::warn!(
                "Failsafe {} ({})",
                "activated",
                if auto { "threshold escalation" } else { "operator" }
            );
        } else {
            log::info!("Failsafe deactivated");
        }
        *state = next;
        self.inner.state_cell.store(next.as_u8(), Ordering::SeqCst);
        self.inner.tracker.lock().auto_failsafe = auto && enabled;
        self.inner.events.publish(Event::StateChanged { state: next });
        Ok(())
    }

    /// Replace the set of channels forced safe in failsafe (config reload)
    pub fn set_failsafe_channels(&self, channels: HashSet<ServoChannel>) {
        *self.inner.failsafe_channels.write() = channels;
    }

    /// Feed one power sample; drives threshold escalation and recovery
    pub fn observe_power(&self, voltage_v: f64, current_a: f64) {
        let thresholds = &self.inner.thresholds;
        let low_voltage = voltage_v < thresholds.v_low;
        let high_current = current_a > thresholds.i_max;

        if low_voltage {
            self.inner
                .alerts
                .raise(AlertCode::LowVoltage, &format!("{:.2} V", voltage_v));
        } else if voltage_v >= thresholds.v_low + thresholds.recover_margin_v {
            self.inner.alerts.clear(AlertCode::LowVoltage);
        }
        if high_current {
            self.inner
                .alerts
                .raise(AlertCode::HighCurrent, &format!("{:.2} A", current_a));
        } else {
            self.inner.alerts.clear(AlertCode::HighCurrent);
        }

        let breach = low_voltage || high_current;
        let now = Instant::now();
        let action = {
            let state = self.current();
            let mut tracker = self.inner.tracker.lock();
            match state {
                SystemState::Normal => {
                    tracker.good_since = None;
                    if breach {
                        let since = *tracker.breach_since.get_or_insert(now);
                        let escalate = now.duration_since(since) >= thresholds.dwell;
                        escalate.then_some(true)
                    } else {
                        tracker.breach_since = None;
                        None
                    }
                }
                SystemState::Failsafe if tracker.auto_failsafe => {
                    tracker.breach_since = None;
                    let recovered = voltage_v >= thresholds.v_low + thresholds.recover_margin_v
                        && !high_current;
                    if recovered {
                        let since = *tracker.good_since.get_or_insert(now);
                        (now.duration_since(since) >= thresholds.recover).then_some(false)
                    } else {
                        tracker.good_since = None;
                        None
                    }
                }
                _ => {
                    tracker.breach_since = None;
                    tracker.good_since = None;
                    None
                }
            }
        };

        match action {
            Some(true) => {
                let _ = self.transition_failsafe(true, true);
            }
            Some(false) => {
                let _ = self.transition_failsafe(false, false);
            }
            None => {}
        }
    }
}

/// Polls the physical E-stop input and raises an emergency on assertion
///
/// The switch is normally closed to a pulled-up input: a falling edge means
/// pressed. Polling at a few milliseconds is well inside the 300 ms
/// mechanical debounce window the switch needs anyway.
pub struct EstopMonitor {
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

const ESTOP_POLL: Duration = Duration::from_millis(5);
const ESTOP_HOLDOFF: Duration = Duration::from_millis(300);

impl EstopMonitor {
    pub fn spawn(
        gpio: Arc<dyn crate::gpio::Gpio>,
        pin: u8,
        supervisor: Supervisor,
    ) -> Result<Self> {
        use crate::gpio::{PinDirection, PinPull};
        use std::sync::atomic::AtomicBool;

        gpio.configure(pin, PinDirection::Input, PinPull::Up)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let worker = std::thread::Builder::new()
            .name("estop-monitor".to_string())
            .spawn(move || {
                let mut last_level = true;
                let mut last_trigger: Option<Instant> = None;
                while !thread_shutdown.load(Ordering::Relaxed) {
                    let level = gpio.read(pin).unwrap_or(true);
                    let in_holdoff = last_trigger
                        .map(|t| t.elapsed() < ESTOP_HOLDOFF)
                        .unwrap_or(false);
                    if last_level && !level && !in_holdoff {
                        supervisor.request_emergency("physical e-stop input");
                        last_trigger = Some(Instant::now());
                    }
                    last_level = level;
                    std::thread::sleep(ESTOP_POLL);
                }
            })
            .map_err(|e| Error::Other(format!("failed to spawn e-stop monitor: {}", e)))?;

        Ok(Self {
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EstopMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Narrow read-only handle for components that must consult system state
///
/// Deliberately cheap to clone and free of any control surface, so drivers
/// cannot create transition cycles.
#[derive(Clone)]
pub struct StateView {
    inner: Arc<SupervisorInner>,
}

impl StateView {
    pub fn current(&self) -> SystemState {
        SystemState::from_u8(self.inner.state_cell.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn emergency_active(&self) -> bool {
        self.current() == SystemState::Emergency
    }

    /// Gate a servo write: emergencies block everything, failsafe blocks
    /// only the configured track-motor channels.
    pub fn check_servo_write(&self, channel: &ServoChannel) -> Result<()> {
        match self.current() {
            SystemState::Emergency => Err(Error::StateForbidsWrite),
            SystemState::Failsafe => {
                if self.inner.failsafe_channels.read().contains(channel) {
                    Err(Error::StateForbidsWrite)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Gate stepper motion: forbidden outside `Normal`
    pub fn check_stepper_motion(&self) -> Result<()> {
        match self.current() {
            SystemState::Normal => Ok(()),
            _ => Err(Error::StateForbidsWrite),
        }
    }

    /// Gate scene start: scenes only run in `Normal`
    pub fn check_scene_start(&self) -> Result<()> {
        match self.current() {
            SystemState::Normal => Ok(()),
            _ => Err(Error::StateForbidsScene),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn supervisor() -> (Supervisor, EventBus) {
        let bus = EventBus::new();
        let alerts = AlertSet::new(bus.clone());
        let sup = Supervisor::new(PowerThresholds::default(), HashSet::new(), bus.clone(), alerts);
        (sup, bus)
    }

    #[test]
    fn emergency_is_idempotent_and_runs_hooks_once_per_entry() {
        let (sup, _bus) = supervisor();
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        sup.on_emergency(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });

        sup.request_emergency("test");
        sup.request_emergency("test again");
        assert_eq!(sup.current(), SystemState::Emergency);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sup.clear_emergency();
        assert_eq!(sup.current(), SystemState::Normal);
        sup.request_emergency("second entry");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn state_changed_precedes_hook_events() {
        let (sup, bus) = supervisor();
        let hook_bus = bus.clone();
        sup.on_emergency(move || {
            hook_bus.publish(Event::SceneCancelled {
                scene: "demo".into(),
                reason: "emergency".into(),
            });
        });
        let sub = bus.subscribe();
        sup.request_emergency("ordering");

        let events = sub.drain();
        assert!(matches!(events[0], Event::StateChanged { state: SystemState::Emergency }));
        assert!(matches!(events[1], Event::SceneCancelled { .. }));
    }

    #[test]
    fn failsafe_rejected_during_emergency() {
        let (sup, _bus) = supervisor();
        sup.request_emergency("test");
        assert!(matches!(sup.set_failsafe(true), Err(Error::Busy(_))));
        sup.clear_emergency();
        sup.set_failsafe(true).unwrap();
        assert_eq!(sup.current(), SystemState::Failsafe);
    }

    #[test]
    fn failsafe_blocks_only_configured_channels() {
        let bus = EventBus::new();
        let alerts = AlertSet::new(bus.clone());
        let track: ServoChannel = "m2_ch16".parse().unwrap();
        let mut channels = HashSet::new();
        channels.insert(track);
        let sup = Supervisor::new(PowerThresholds::default(), channels, bus, alerts);
        sup.set_failsafe(true).unwrap();

        let view = sup.view();
        let head: ServoChannel = "m1_ch0".parse().unwrap();
        assert!(view.check_servo_write(&head).is_ok());
        assert!(matches!(
            view.check_servo_write(&track),
            Err(Error::StateForbidsWrite)
        ));
        assert!(matches!(
            view.check_stepper_motion(),
            Err(Error::StateForbidsWrite)
        ));
    }

    #[test]
    fn threshold_dwell_escalates_to_failsafe() {
        let bus = EventBus::new();
        let alerts = AlertSet::new(bus.clone());
        let thresholds = PowerThresholds {
            v_low: 13.2,
            i_max: 50.0,
            dwell: Duration::from_millis(20),
            recover_margin_v: 0.4,
            recover: Duration::from_millis(20),
        };
        let sup = Supervisor::new(thresholds, HashSet::new(), bus, alerts);

        sup.observe_power(12.0, 1.0);
        assert_eq!(sup.current(), SystemState::Normal);
        std::thread::sleep(Duration::from_millis(30));
        sup.observe_power(12.0, 1.0);
        assert_eq!(sup.current(), SystemState::Failsafe);

        // Hysteresis: recovery needs margin held for the recover window.
        sup.observe_power(13.8, 1.0);
        assert_eq!(sup.current(), SystemState::Failsafe);
        std::thread::sleep(Duration::from_millis(30));
        sup.observe_power(13.8, 1.0);
        assert_eq!(sup.current(), SystemState::Normal);
    }

    #[test]
    fn manual_failsafe_is_not_auto_recovered() {
        let (sup, _bus) = supervisor();
        sup.set_failsafe(true).unwrap();
        sup.observe_power(14.5, 1.0);
        std::thread::sleep(Duration::from_millis(5));
        sup.observe_power(14.5, 1.0);
        assert_eq!(sup.current(), SystemState::Failsafe);
    }

    #[test]
    fn estop_falling_edge_triggers_emergency() {
        use crate::gpio::MockGpio;
        let (sup, _bus) = supervisor();
        let gpio = MockGpio::new();
        let pin = 6;
        gpio.set_input(pin, true); // switch closed, pulled up
        let monitor = EstopMonitor::spawn(Arc::new(gpio.clone()), pin, sup.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sup.current(), SystemState::Normal);

        gpio.set_input(pin, false); // pressed
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sup.current(), SystemState::Emergency);
        monitor.shutdown();
    }

    #[test]
    fn scene_start_gated_outside_normal() {
        let (sup, _bus) = supervisor();
        let view = sup.view();
        assert!(view.check_scene_start().is_ok());
        sup.set_failsafe(true).unwrap();
        assert!(matches!(
            view.check_scene_start(),
            Err(Error::StateForbidsScene)
        ));
    }
}
