//! GPIO abstraction for the stepper driver and E-stop input
//!
//! Mirrors the transport layer's shape: one narrow trait, one real
//! implementation, one deterministic double for tests. The stepper's step
//! emitter is the only timing-sensitive caller; `pulse` guarantees only
//! "at least the requested high time", so tight inter-step timing lives in
//! the emitter loop, not here.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPull {
    None,
    Up,
    Down,
}

/// Digital I/O primitives
pub trait Gpio: Send + Sync {
    fn configure(&self, pin: u8, direction: PinDirection, pull: PinPull) -> Result<()>;

    fn write(&self, pin: u8, level: bool) -> Result<()>;

    fn read(&self, pin: u8) -> Result<bool>;

    /// Drive the pin high for at least `high_ns`, then low
    fn pulse(&self, pin: u8, high_ns: u64) -> Result<()> {
        self.write(pin, true)?;
        busy_wait(Duration::from_nanos(high_ns));
        self.write(pin, false)
    }
}

/// Sub-microsecond waits sleep too coarsely on a stock kernel; spin instead.
/// Pulse widths here are a few microseconds, so the burned cycles are cheap.
pub(crate) fn busy_wait(duration: Duration) {
    let end = Instant::now() + duration;
    while Instant::now() < end {
        std::hint::spin_loop();
    }
}

/// GPIO via the sysfs interface
///
/// Exports pins on `configure` and talks through the `value` files. Slow by
/// memory-mapped standards but comfortably fast enough for a 2 kHz step
/// rate, and it needs no privileged mappings.
pub struct SysfsGpio {
    root: PathBuf,
    exported: Mutex<HashMap<u8, PinDirection>>,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self::with_root("/sys/class/gpio")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exported: Mutex::new(HashMap::new()),
        }
    }

    fn pin_path(&self, pin: u8, file: &str) -> PathBuf {
        self.root.join(format!("gpio{}", pin)).join(file)
    }

    fn check_direction(&self, pin: u8, wanted: PinDirection) -> Result<()> {
        match self.exported.lock().get(&pin) {
            Some(direction) if *direction == wanted => Ok(()),
            Some(_) => Err(Error::Other(format!(
                "gpio {} configured with the wrong direction",
                pin
            ))),
            None => Err(Error::Other(format!("gpio {} not configured", pin))),
        }
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl Gpio for SysfsGpio {
    fn configure(&self, pin: u8, direction: PinDirection, _pull: PinPull) -> Result<()> {
        // Pull resistors are not controllable through sysfs; external
        // hardware provides them on this board.
        let pin_dir = self.root.join(format!("gpio{}", pin));
        if !pin_dir.exists() {
            let mut export = fs::OpenOptions::new()
                .write(true)
                .open(self.root.join("export"))?;
            write!(export, "{}", pin)?;
        }
        let value = match direction {
            PinDirection::Input => "in",
            PinDirection::Output => "out",
        };
        fs::write(self.pin_path(pin, "direction"), value)?;
        self.exported.lock().insert(pin, direction);
        log::debug!("Configured gpio {} as {}", pin, value);
        Ok(())
    }

    fn write(&self, pin: u8, level: bool) -> Result<()> {
        self.check_direction(pin, PinDirection::Output)?;
        fs::write(self.pin_path(pin, "value"), if level { "1" } else { "0" })?;
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<bool> {
        let raw = fs::read_to_string(self.pin_path(pin, "value"))?;
        Ok(raw.trim() == "1")
    }
}

/// A scripted input change applied after a pin has been pulsed N times
struct PulseTrigger {
    watch_pin: u8,
    after_pulses: u64,
    set_pin: u8,
    level: bool,
}

#[derive(Default)]
struct MockGpioInner {
    directions: HashMap<u8, PinDirection>,
    levels: HashMap<u8, bool>,
    pulse_counts: HashMap<u8, u64>,
    write_log: Vec<(u8, bool)>,
    triggers: Vec<PulseTrigger>,
}

/// Deterministic GPIO double
///
/// Input levels are scripted directly or keyed off pulse counts, which lets
/// homing tests assert "the limit switch goes active after N step pulses"
/// without any real timing.
#[derive(Clone, Default)]
pub struct MockGpio {
    inner: Arc<Mutex<MockGpioInner>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an input level immediately
    pub fn set_input(&self, pin: u8, level: bool) {
        self.inner.lock().levels.insert(pin, level);
    }

    /// Set `set_pin` to `level` once `watch_pin` has been pulsed
    /// `after_pulses` times (counted from now)
    pub fn set_input_after_pulses(&self, watch_pin: u8, after_pulses: u64, set_pin: u8, level: bool) {
        let mut inner = self.inner.lock();
        let base = inner.pulse_counts.get(&watch_pin).copied().unwrap_or(0);
        inner.triggers.push(PulseTrigger {
            watch_pin,
            after_pulses: base + after_pulses,
            set_pin,
            level,
        });
    }

    pub fn pulse_count(&self, pin: u8) -> u64 {
        self.inner.lock().pulse_counts.get(&pin).copied().unwrap_or(0)
    }

    pub fn level(&self, pin: u8) -> bool {
        self.inner.lock().levels.get(&pin).copied().unwrap_or(false)
    }

    pub fn write_log(&self) -> Vec<(u8, bool)> {
        self.inner.lock().write_log.clone()
    }
}

impl Gpio for MockGpio {
    fn configure(&self, pin: u8, direction: PinDirection, _pull: PinPull) -> Result<()> {
        self.inner.lock().directions.insert(pin, direction);
        Ok(())
    }

    fn write(&self, pin: u8, level: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.levels.insert(pin, level);
        inner.write_log.push((pin, level));
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<bool> {
        Ok(self.inner.lock().levels.get(&pin).copied().unwrap_or(false))
    }

    fn pulse(&self, pin: u8, _high_ns: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let count = inner.pulse_counts.entry(pin).or_insert(0);
        *count += 1;
        let count = *count;

        let mut fired = Vec::new();
        inner.triggers.retain(|trigger| {
            if trigger.watch_pin == pin && count >= trigger.after_pulses {
                fired.push((trigger.set_pin, trigger.level));
                false
            } else {
                true
            }
        });
        for (set_pin, level) in fired {
            inner.levels.insert(set_pin, level);
        }
        Ok(())
    }
}
