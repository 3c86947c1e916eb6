//! Stepper gantry controller
//!
//! Drives a TB6600-class stepper driver over three GPIO pins plus a limit
//! switch input. A dedicated emitter thread generates step pulses with
//! trapezoidal ramping; command submission never blocks on motion.
//!
//! # State Machine
//!
//! ```text
//! Idle ──home()──────────▶ Homing ──limit edge──▶ Idle (position 0, homed)
//! Idle ──move_to()───────▶ Moving ──target──────▶ Idle
//! Moving ──limit hit─────▶ Faulted
//! Homing ──step budget───▶ Faulted (HomingTimeout)
//! any  ──emergency stop──▶ Faulted
//! Faulted ──clear_fault()▶ Idle (homed cleared, re-home required)
//! ```
//!
//! The emitter halts only at step boundaries, never mid-pulse. Safety is
//! consulted on every boundary: an emergency observed through the
//! [`StateView`] stops the motor within one step interval.

mod profile;

pub use profile::StepProfile;

use crate::bus::{AlertCode, AlertSet};
use crate::error::{Error, Result};
use crate::gpio::{busy_wait, Gpio, PinDirection, PinPull};
use crate::safety::StateView;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Stepper hardware and motion configuration (`hardware_config.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepperConfig {
    pub steps_per_rev: u32,
    pub lead_pitch_mm: f64,
    pub max_travel_cm: f64,
    pub homing_sps: u32,
    pub normal_sps: u32,
    pub max_sps: u32,
    pub accel_sps2: u32,
    pub pulse_high_ns: u64,
    pub step_pin: u8,
    pub dir_pin: u8,
    pub enable_pin: u8,
    pub limit_pin: u8,
    pub estop_pin: u8,
    /// Consecutive active samples required to accept the limit switch
    #[serde(default = "default_debounce_samples")]
    pub debounce_samples: u32,
    /// Interval between debounce samples, microseconds
    #[serde(default = "default_debounce_interval_us")]
    pub debounce_interval_us: u64,
    /// Extra step allowance past full travel before homing gives up
    #[serde(default = "default_homing_margin_steps")]
    pub homing_margin_steps: u64,
}

fn default_debounce_samples() -> u32 {
    3
}
fn default_debounce_interval_us() -> u64 {
    500
}
fn default_homing_margin_steps() -> u64 {
    1000
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            steps_per_rev: 200,
            lead_pitch_mm: 8.0,
            max_travel_cm: 20.0,
            homing_sps: 400,
            normal_sps: 1200,
            max_sps: 2000,
            accel_sps2: 800,
            pulse_high_ns: 5_000,
            step_pin: 16,
            dir_pin: 12,
            enable_pin: 13,
            limit_pin: 26,
            estop_pin: 6,
            debounce_samples: default_debounce_samples(),
            debounce_interval_us: default_debounce_interval_us(),
            homing_margin_steps: default_homing_margin_steps(),
        }
    }
}

impl StepperConfig {
    pub fn steps_per_cm(&self) -> f64 {
        self.steps_per_rev as f64 / (self.lead_pitch_mm / 10.0)
    }

    pub fn cm_to_steps(&self, cm: f64) -> i64 {
        (cm * self.steps_per_cm()).round() as i64
    }

    pub fn steps_to_cm(&self, steps: i64) -> f64 {
        steps as f64 / self.steps_per_cm()
    }

    pub fn max_travel_steps(&self) -> i64 {
        self.cm_to_steps(self.max_travel_cm)
    }
}

/// Stepper state machine modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepperMode {
    Idle,
    Homing,
    Moving,
    Faulted,
}

impl StepperMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StepperMode::Idle,
            1 => StepperMode::Homing,
            2 => StepperMode::Moving,
            _ => StepperMode::Faulted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StepperMode::Idle => 0,
            StepperMode::Homing => 1,
            StepperMode::Moving => 2,
            StepperMode::Faulted => 3,
        }
    }
}

/// What a second `move_to` does while a move is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubmitPolicy {
    /// Replace the in-flight target when the direction matches
    Replace,
    /// Always reject with `Busy`
    Reject,
}

/// Copy of the observable stepper state for telemetry
#[derive(Debug, Clone, Serialize)]
pub struct StepperStatus {
    pub position_steps: i64,
    pub position_cm: f64,
    pub homed: bool,
    pub enabled: bool,
    pub mode: StepperMode,
    pub soft_min_steps: i64,
    pub soft_max_steps: i64,
}

#[derive(Debug, Clone, Copy)]
struct PendingMove {
    target_steps: i64,
    sps: u32,
}

struct StepperShared {
    position: AtomicI64,
    mode: AtomicU8,
    homed: AtomicBool,
    enabled: AtomicBool,
    /// Halt request, consumed by the emitter at the next step boundary
    stop: AtomicBool,
    /// Whether the pending halt is an emergency (Faulted) or benign (Idle)
    fault_on_stop: AtomicBool,
    /// Replacement target picked up between steps
    pending: Mutex<Option<PendingMove>>,
}

impl StepperShared {
    fn mode(&self) -> StepperMode {
        StepperMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    fn set_mode(&self, mode: StepperMode) {
        self.mode.store(mode.as_u8(), Ordering::SeqCst);
    }
}

enum EmitterCmd {
    Home,
    Move { target_steps: i64, sps: u32 },
}

/// Gantry stepper controller
pub struct StepperController {
    config: StepperConfig,
    gpio: Arc<dyn Gpio>,
    shared: Arc<StepperShared>,
    policy: ResubmitPolicy,
    state: StateView,
    cmd_tx: Sender<EmitterCmd>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl StepperController {
    pub fn new(
        config: StepperConfig,
        gpio: Arc<dyn Gpio>,
        state: StateView,
        alerts: AlertSet,
        policy: ResubmitPolicy,
    ) -> Result<Arc<Self>> {
        gpio.configure(config.step_pin, PinDirection::Output, PinPull::None)?;
        gpio.configure(config.dir_pin, PinDirection::Output, PinPull::None)?;
        gpio.configure(config.enable_pin, PinDirection::Output, PinPull::None)?;
        gpio.configure(config.limit_pin, PinDirection::Input, PinPull::Down)?;
        // TB6600 enable is active low; start disabled.
        gpio.write(config.enable_pin, true)?;

        let shared = Arc::new(StepperShared {
            position: AtomicI64::new(0),
            mode: AtomicU8::new(StepperMode::Idle.as_u8()),
            homed: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            fault_on_stop: AtomicBool::new(false),
            pending: Mutex::new(None),
        });

        let (cmd_tx, cmd_rx) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let emitter = Emitter {
            config: config.clone(),
            gpio: Arc::clone(&gpio),
            shared: Arc::clone(&shared),
            state: state.clone(),
            alerts,
            shutdown: Arc::clone(&shutdown),
        };
        let worker = thread::Builder::new()
            .name("step-emitter".to_string())
            .spawn(move || emitter.run(cmd_rx))
            .map_err(|e| Error::Other(format!("failed to spawn step emitter: {}", e)))?;

        log::info!(
            "Stepper controller ready: {:.1} steps/cm, travel {} steps",
            config.steps_per_cm(),
            config.max_travel_steps()
        );

        Ok(Arc::new(Self {
            config,
            gpio,
            shared,
            policy,
            state,
            cmd_tx,
            worker: Mutex::new(Some(worker)),
            shutdown,
        }))
    }

    pub fn config(&self) -> &StepperConfig {
        &self.config
    }

    /// Energize the driver
    pub fn enable(&self) -> Result<()> {
        self.gpio.write(self.config.enable_pin, false)?;
        self.shared.enabled.store(true, Ordering::SeqCst);
        log::debug!("Stepper enabled");
        Ok(())
    }

    /// De-energize the driver; any running motion halts at the next step
    pub fn disable(&self) -> Result<()> {
        self.shared.fault_on_stop.store(false, Ordering::SeqCst);
        self.shared.stop.store(true, Ordering::SeqCst);
        self.gpio.write(self.config.enable_pin, true)?;
        self.shared.enabled.store(false, Ordering::SeqCst);
        if !matches!(self.shared.mode(), StepperMode::Moving | StepperMode::Homing) {
            self.shared.stop.store(false, Ordering::SeqCst);
            self.shared.set_mode(StepperMode::Idle);
        }
        log::debug!("Stepper disabled");
        Ok(())
    }

    /// Begin the homing sequence; completion is observable via `status`
    pub fn home(&self) -> Result<()> {
        self.state.check_stepper_motion()?;
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return Err(Error::MotorDisabled);
        }
        match self.shared.mode() {
            StepperMode::Idle => {}
            StepperMode::Faulted => return Err(Error::Busy("stepper faulted".into())),
            _ => return Err(Error::Busy("motion in progress".into())),
        }
        self.dispatch(EmitterCmd::Home)
    }

    /// Hand a command to the emitter from quiescence, dropping any stale
    /// halt request left over from a stop that raced a completed motion.
    fn dispatch(&self, cmd: EmitterCmd) -> Result<()> {
        self.shared.stop.store(false, Ordering::SeqCst);
        match self.cmd_tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Busy("motion queued".into())),
            Err(TrySendError::Disconnected(_)) => Err(Error::Shutdown),
        }
    }

    /// Begin an absolute move; non-blocking
    pub fn move_to_cm(&self, target_cm: f64, sps: Option<u32>) -> Result<()> {
        self.move_to_steps(self.config.cm_to_steps(target_cm), sps)
    }

    /// Begin a relative move; non-blocking
    pub fn move_distance_cm(&self, distance_cm: f64, sps: Option<u32>) -> Result<()> {
        let current = self.shared.position.load(Ordering::Relaxed);
        self.move_to_steps(current + self.config.cm_to_steps(distance_cm), sps)
    }

    pub fn move_to_steps(&self, target_steps: i64, sps: Option<u32>) -> Result<()> {
        self.state.check_stepper_motion()?;
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return Err(Error::MotorDisabled);
        }
        if !self.shared.homed.load(Ordering::Relaxed) {
            return Err(Error::NotHomed);
        }
        let (soft_min, soft_max) = (0, self.config.max_travel_steps());
        if target_steps < soft_min || target_steps > soft_max {
            return Err(Error::OutOfRange(format!(
                "target {} steps outside {}..{} steps",
                target_steps, soft_min, soft_max
            )));
        }
        let sps = sps.unwrap_or(self.config.normal_sps).min(self.config.max_sps);

        match self.shared.mode() {
            StepperMode::Idle => self.dispatch(EmitterCmd::Move { target_steps, sps }),
            StepperMode::Moving => self.resubmit(target_steps, sps),
            StepperMode::Homing => Err(Error::Busy("homing in progress".into())),
            StepperMode::Faulted => Err(Error::Busy("stepper faulted".into())),
        }
    }

    /// Handle a second move submitted while one is in flight
    fn resubmit(&self, target_steps: i64, sps: u32) -> Result<()> {
        if self.policy == ResubmitPolicy::Reject {
            return Err(Error::Busy("move in progress".into()));
        }
        let current = self.shared.position.load(Ordering::Relaxed);
        let mut pending = self.shared.pending.lock();
        let in_flight_dir = pending
            .map(|p| p.target_steps > current)
            .unwrap_or_else(|| self.emitter_direction(current));
        let new_dir = target_steps > current;
        if new_dir != in_flight_dir {
            return Err(Error::Busy("opposing direction".into()));
        }
        *pending = Some(PendingMove { target_steps, sps });
        log::debug!("Replaced in-flight target with {} steps", target_steps);
        Ok(())
    }

    fn emitter_direction(&self, current: i64) -> bool {
        // The dir pin level mirrors the in-flight direction; high = away
        // from home = increasing position.
        self.gpio.read(self.config.dir_pin).unwrap_or(current >= 0)
    }

    /// Halt at the next step boundary
    ///
    /// `emergency` ends the motion in `Faulted`; otherwise the controller
    /// returns to `Idle` and keeps its position model.
    pub fn stop(&self, emergency: bool) {
        self.shared.pending.lock().take();
        self.shared.fault_on_stop.store(emergency, Ordering::SeqCst);
        self.shared.stop.store(true, Ordering::SeqCst);
        if emergency {
            log::warn!("Stepper emergency stop requested");
        }
        if !matches!(self.shared.mode(), StepperMode::Moving | StepperMode::Homing) {
            // Nothing running to observe the flag; clear it so the next
            // motion does not halt immediately.
            self.shared.stop.store(false, Ordering::SeqCst);
        }
    }

    /// Leave `Faulted`; the position model is no longer trusted, so homing
    /// is required before the next move
    pub fn clear_fault(&self) -> Result<()> {
        if self.shared.mode() != StepperMode::Faulted {
            return Err(Error::Busy("no fault to clear".into()));
        }
        self.shared.homed.store(false, Ordering::SeqCst);
        self.shared.set_mode(StepperMode::Idle);
        log::info!("Stepper fault cleared; re-home required");
        Ok(())
    }

    pub fn status(&self) -> StepperStatus {
        let position = self.shared.position.load(Ordering::Relaxed);
        StepperStatus {
            position_steps: position,
            position_cm: self.config.steps_to_cm(position),
            homed: self.shared.homed.load(Ordering::Relaxed),
            enabled: self.shared.enabled.load(Ordering::Relaxed),
            mode: self.shared.mode(),
            soft_min_steps: 0,
            soft_max_steps: self.config.max_travel_steps(),
        }
    }

    /// Wait for the emitter to reach a quiescent mode; test and shutdown aid
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mode = self.shared.mode();
            if matches!(mode, StepperMode::Idle | StepperMode::Faulted) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let _ = self.gpio.write(self.config.enable_pin, true);
    }
}

impl Drop for StepperController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The dedicated pulse-generation task
struct Emitter {
    config: StepperConfig,
    gpio: Arc<dyn Gpio>,
    shared: Arc<StepperShared>,
    state: StateView,
    alerts: AlertSet,
    shutdown: Arc<AtomicBool>,
}

/// Why a motion loop ended early
enum Halt {
    /// stop() or disable(); mode decided by `fault_on_stop`
    Requested,
    Emergency,
    LimitHit,
}

impl Emitter {
    fn run(self, cmd_rx: Receiver<EmitterCmd>) {
        log::info!("Step emitter started");
        while !self.shutdown.load(Ordering::Relaxed) {
            match cmd_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(EmitterCmd::Home) => self.run_home(),
                Ok(EmitterCmd::Move { target_steps, sps }) => self.run_move(target_steps, sps),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        log::info!("Step emitter exiting");
    }

    /// Boundary check between steps; `None` means keep going
    fn boundary_halt(&self) -> Option<Halt> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Some(Halt::Requested);
        }
        if self.shared.stop.swap(false, Ordering::SeqCst) {
            return Some(Halt::Requested);
        }
        if self.state.emergency_active() {
            return Some(Halt::Emergency);
        }
        None
    }

    fn finish_halt(&self, halt: Halt, context: &str) {
        match halt {
            Halt::Requested => {
                let faulted = self.shared.fault_on_stop.swap(false, Ordering::SeqCst);
                self.shared.set_mode(if faulted {
                    StepperMode::Faulted
                } else {
                    StepperMode::Idle
                });
                log::info!("Stepper {} halted on request", context);
            }
            Halt::Emergency => {
                self.shared.set_mode(StepperMode::Faulted);
                log::warn!("Stepper {} halted by emergency", context);
            }
            Halt::LimitHit => {
                self.shared.set_mode(StepperMode::Faulted);
                self.alerts.raise(
                    AlertCode::LimitUnexpected,
                    "limit switch asserted during move",
                );
            }
        }
        self.shared.pending.lock().take();
    }

    fn limit_active_debounced(&self) -> bool {
        if !self.gpio.read(self.config.limit_pin).unwrap_or(false) {
            return false;
        }
        for _ in 1..self.config.debounce_samples {
            busy_wait(Duration::from_micros(self.config.debounce_interval_us));
            if !self.gpio.read(self.config.limit_pin).unwrap_or(false) {
                return false;
            }
        }
        true
    }

    fn pause(interval: Duration) {
        // thread::sleep is far too coarse for kHz step rates; spin for the
        // short intervals and sleep only when the ramp is slow.
        if interval >= Duration::from_millis(2) {
            thread::sleep(interval);
        } else {
            busy_wait(interval);
        }
    }

    fn run_home(&self) {
        self.shared.set_mode(StepperMode::Homing);
        self.shared.homed.store(false, Ordering::SeqCst);
        log::info!("Homing: seeking limit switch at {} sps", self.config.homing_sps);

        if self.gpio.write(self.config.dir_pin, false).is_err() {
            self.shared.set_mode(StepperMode::Faulted);
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.config.homing_sps.max(1) as f64);
        let budget = self.config.max_travel_steps() as u64 + self.config.homing_margin_steps;

        for step in 0..budget {
            if let Some(halt) = self.boundary_halt() {
                self.finish_halt(halt, "homing");
                return;
            }
            if self.limit_active_debounced() {
                self.shared.position.store(0, Ordering::SeqCst);
                self.shared.homed.store(true, Ordering::SeqCst);
                self.shared.set_mode(StepperMode::Idle);
                log::info!("Homing complete after {} steps; zero established", step);
                return;
            }
            if self.gpio.pulse(self.config.step_pin, self.config.pulse_high_ns).is_err() {
                self.shared.set_mode(StepperMode::Faulted);
                return;
            }
            Self::pause(interval);
        }

        log::error!("Homing failed: limit not reached within {} steps", budget);
        self.shared.set_mode(StepperMode::Faulted);
        self.alerts.raise(AlertCode::HomingTimeout, "limit switch never asserted");
    }

    fn run_move(&self, target_steps: i64, sps: u32) {
        self.shared.set_mode(StepperMode::Moving);
        let mut target = target_steps;
        let mut speed = sps;

        'motion: loop {
            let current = self.shared.position.load(Ordering::Relaxed);
            let delta = target - current;
            if delta == 0 {
                break;
            }
            let toward_home = delta < 0;
            if self.gpio.write(self.config.dir_pin, !toward_home).is_err() {
                self.shared.set_mode(StepperMode::Faulted);
                return;
            }
            let total = delta.unsigned_abs();
            let profile = StepProfile::new(total, speed, self.config.accel_sps2);
            log::debug!(
                "Moving {} -> {} steps ({} sps peak)",
                current,
                target,
                speed
            );

            for step in 0..total {
                if let Some(halt) = self.boundary_halt() {
                    self.finish_halt(halt, "move");
                    return;
                }
                if toward_home && self.limit_active_debounced() {
                    self.finish_halt(Halt::LimitHit, "move");
                    return;
                }
                if self.gpio.pulse(self.config.step_pin, self.config.pulse_high_ns).is_err() {
                    self.shared.set_mode(StepperMode::Faulted);
                    return;
                }
                self.shared
                    .position
                    .fetch_add(if toward_home { -1 } else { 1 }, Ordering::SeqCst);

                if let Some(replacement) = self.shared.pending.lock().take() {
                    target = replacement.target_steps;
                    speed = replacement.sps;
                    continue 'motion;
                }
                Self::pause(profile.interval(step));
            }
            break;
        }

        self.shared.set_mode(StepperMode::Idle);
        log::info!(
            "Move complete at {} steps",
            self.shared.position.load(Ordering::Relaxed)
        );
    }
}
