//! Analog sensor sampling
//!
//! Reads the battery voltage and two motor-current channels from an I²C ADC
//! at a fixed cadence and converts raw counts to engineering units through
//! per-channel linear calibrations. Readings feed both the telemetry
//! snapshot and the safety supervisor's threshold escalation.
//!
//! Failure policy: a failed read keeps the last good values and marks them
//! stale; more than `max_failures` consecutive failures raise the
//! `SensorDegraded` alert. Individual command paths never see sensor errors.

use crate::bus::{AlertCode, AlertSet};
use crate::error::{Error, Result};
use crate::safety::Supervisor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Raw ADC access; one implementation per bus technology plus a test double
pub trait Adc: Send {
    /// Read one raw conversion from the given input channel
    fn read_raw(&mut self, channel: u8) -> Result<u16>;
}

/// Linear calibration: `engineering = scale * raw + offset`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Calibration {
    pub scale: f64,
    pub offset: f64,
}

impl Calibration {
    pub fn apply(&self, raw: u16) -> f64 {
        self.scale * raw as f64 + self.offset
    }
}

/// One sampled input: ADC channel plus its calibration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdcInput {
    pub channel: u8,
    pub calibration: Calibration,
}

/// Sensor block of `hardware_config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// I²C bus device (e.g., "/dev/i2c-1")
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: String,
    /// ADC slave address
    #[serde(default = "default_adc_address")]
    pub adc_address: u16,
    #[serde(default = "default_sample_hz")]
    pub sample_hz: f64,
    pub voltage: AdcInput,
    pub current_ch1: AdcInput,
    pub current_ch2: AdcInput,
    /// Consecutive failures before `SensorDegraded` is raised
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_i2c_bus() -> String {
    "/dev/i2c-1".to_string()
}
fn default_adc_address() -> u16 {
    0x48
}
fn default_sample_hz() -> f64 {
    5.0
}
fn default_max_failures() -> u32 {
    10
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            i2c_bus: default_i2c_bus(),
            adc_address: default_adc_address(),
            sample_hz: default_sample_hz(),
            // Battery through an 11:1 divider on AIN0; ACS712-30A style
            // current sensors on AIN1/AIN2 (raw counts at 4.096 V FSR).
            voltage: AdcInput {
                channel: 0,
                calibration: Calibration {
                    scale: 11.0 * 4.096 / 32768.0,
                    offset: 0.0,
                },
            },
            current_ch1: AdcInput {
                channel: 1,
                calibration: Calibration {
                    scale: 4.096 / 32768.0 / 0.066,
                    offset: -2.5 / 0.066,
                },
            },
            current_ch2: AdcInput {
                channel: 2,
                calibration: Calibration {
                    scale: 4.096 / 32768.0 / 0.066,
                    offset: -2.5 / 0.066,
                },
            },
            max_failures: default_max_failures(),
        }
    }
}

/// Latest engineering-unit readings
#[derive(Debug, Clone, Default, Serialize)]
pub struct PowerReadings {
    pub voltage_v: f64,
    pub current_a_ch1: f64,
    pub current_a_ch2: f64,
    /// Values are the last good sample, not a fresh one
    pub stale: bool,
}

/// Periodic sampler thread over an [`Adc`]
pub struct SensorSampler {
    shared: Arc<Mutex<PowerReadings>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SensorSampler {
    pub fn spawn(
        config: SensorConfig,
        mut adc: Box<dyn Adc>,
        supervisor: Supervisor,
        alerts: AlertSet,
    ) -> Result<Self> {
        let shared = Arc::new(Mutex::new(PowerReadings::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_shared = Arc::clone(&shared);
        let thread_shutdown = Arc::clone(&shutdown);
        let interval = Duration::from_secs_f64(1.0 / config.sample_hz.max(0.1));

        let worker = thread::Builder::new()
            .name("sensor-sampler".to_string())
            .spawn(move || {
                let mut consecutive_failures: u32 = 0;
                log::info!(
                    "Sensor sampler started at {:.1} Hz",
                    1.0 / interval.as_secs_f64()
                );
                while !thread_shutdown.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    match sample_once(&config, adc.as_mut()) {
                        Ok(readings) => {
                            if consecutive_failures > config.max_failures {
                                alerts.clear(AlertCode::SensorDegraded);
                            }
                            consecutive_failures = 0;
                            supervisor.observe_power(
                                readings.voltage_v,
                                readings.current_a_ch1.max(readings.current_a_ch2),
                            );
                            *thread_shared.lock() = readings;
                        }
                        Err(e) => {
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            log::debug!(
                                "Sensor read failed ({} consecutive): {}",
                                consecutive_failures,
                                e
                            );
                            thread_shared.lock().stale = true;
                            if consecutive_failures > config.max_failures {
                                alerts.raise(
                                    AlertCode::SensorDegraded,
                                    &format!("{} consecutive ADC failures", consecutive_failures),
                                );
                            }
                        }
                    }
                    let elapsed = started.elapsed();
                    if elapsed < interval {
                        thread::sleep(interval - elapsed);
                    }
                }
                log::info!("Sensor sampler exiting");
            })
            .map_err(|e| Error::Other(format!("failed to spawn sensor sampler: {}", e)))?;

        Ok(Self {
            shared,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Latest readings by value
    pub fn snapshot(&self) -> PowerReadings {
        self.shared.lock().clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SensorSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sample_once(config: &SensorConfig, adc: &mut dyn Adc) -> Result<PowerReadings> {
    let voltage_raw = adc.read_raw(config.voltage.channel)?;
    let current1_raw = adc.read_raw(config.current_ch1.channel)?;
    let current2_raw = adc.read_raw(config.current_ch2.channel)?;
    Ok(PowerReadings {
        voltage_v: config.voltage.calibration.apply(voltage_raw),
        current_a_ch1: config.current_ch1.calibration.apply(current1_raw),
        current_a_ch2: config.current_ch2.calibration.apply(current2_raw),
        stale: false,
    })
}

/// ADS1115 over Linux I²C, single-shot conversions
#[cfg(target_os = "linux")]
pub struct Ads1115Adc {
    file: std::fs::File,
}

#[cfg(target_os = "linux")]
mod ads1115 {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    const I2C_SLAVE: i32 = 0x0703;
    nix::ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE);

    const REG_CONVERSION: u8 = 0x00;
    const REG_CONFIG: u8 = 0x01;

    impl Ads1115Adc {
        pub fn open(bus_path: &str, address: u16) -> Result<Self> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(bus_path)?;
            unsafe { i2c_set_slave(file.as_raw_fd(), address as i32) }
                .map_err(|e| Error::Other(format!("I2C_SLAVE ioctl failed: {}", e)))?;
            log::info!("Opened ADS1115 on {} at 0x{:02x}", bus_path, address);
            Ok(Self { file })
        }
    }

    impl Adc for Ads1115Adc {
        fn read_raw(&mut self, channel: u8) -> Result<u16> {
            // Single-shot, AINx vs GND, +-4.096 V, 128 SPS, comparator off.
            let mux = 0x4000u16 | ((channel as u16 & 0x3) << 12);
            let config: u16 = 0x8000 | mux | 0x0200 | 0x0100 | 0x0080 | 0x0003;
            self.file
                .write_all(&[REG_CONFIG, (config >> 8) as u8, config as u8])?;
            // 128 SPS conversion takes ~8 ms.
            std::thread::sleep(Duration::from_millis(9));
            self.file.write_all(&[REG_CONVERSION])?;
            let mut raw = [0u8; 2];
            self.file.read_exact(&mut raw)?;
            Ok(i16::from_be_bytes(raw).max(0) as u16)
        }
    }
}

#[derive(Default)]
struct MockAdcInner {
    values: std::collections::HashMap<u8, u16>,
    fail_next: u32,
}

/// Deterministic ADC double
#[derive(Clone, Default)]
pub struct MockAdc {
    inner: Arc<Mutex<MockAdcInner>>,
}

impl MockAdc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_raw(&self, channel: u8, value: u16) {
        self.inner.lock().values.insert(channel, value);
    }

    /// Fail the next `count` reads with a bus error
    pub fn fail_next(&self, count: u32) {
        self.inner.lock().fail_next = count;
    }
}

impl Adc for MockAdc {
    fn read_raw(&mut self, channel: u8) -> Result<u16> {
        let mut inner = self.inner.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(Error::Other("injected bus failure".into()));
        }
        Ok(inner.values.get(&channel).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::safety::PowerThresholds;
    use std::collections::HashSet;

    fn fast_config() -> SensorConfig {
        SensorConfig {
            sample_hz: 200.0,
            max_failures: 3,
            voltage: AdcInput {
                channel: 0,
                calibration: Calibration { scale: 0.001, offset: 0.0 },
            },
            current_ch1: AdcInput {
                channel: 1,
                calibration: Calibration { scale: 0.01, offset: -1.0 },
            },
            current_ch2: AdcInput {
                channel: 2,
                calibration: Calibration { scale: 0.01, offset: -1.0 },
            },
            ..SensorConfig::default()
        }
    }

    fn rig(config: SensorConfig, adc: MockAdc) -> (SensorSampler, AlertSet) {
        let bus = EventBus::new();
        let alerts = AlertSet::new(bus.clone());
        let supervisor = Supervisor::new(
            PowerThresholds::default(),
            HashSet::new(),
            bus,
            alerts.clone(),
        );
        let sampler =
            SensorSampler::spawn(config, Box::new(adc), supervisor, alerts.clone()).unwrap();
        (sampler, alerts)
    }

    #[test]
    fn calibration_is_linear() {
        let cal = Calibration { scale: 0.5, offset: -3.0 };
        assert!((cal.apply(10) - 2.0).abs() < f64::EPSILON);
        assert!((cal.apply(0) + 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sampler_converts_to_engineering_units() {
        let adc = MockAdc::new();
        adc.set_raw(0, 14_800); // 14.8 V
        adc.set_raw(1, 250); // 1.5 A
        adc.set_raw(2, 100); // 0.0 A
        let (sampler, _alerts) = rig(fast_config(), adc);

        std::thread::sleep(Duration::from_millis(50));
        let readings = sampler.snapshot();
        assert!((readings.voltage_v - 14.8).abs() < 1e-9);
        assert!((readings.current_a_ch1 - 1.5).abs() < 1e-9);
        assert!((readings.current_a_ch2 - 0.0).abs() < 1e-9);
        assert!(!readings.stale);
        sampler.shutdown();
    }

    #[test]
    fn failures_keep_last_good_and_mark_stale() {
        let adc = MockAdc::new();
        adc.set_raw(0, 14_800);
        adc.set_raw(1, 250);
        adc.set_raw(2, 250);
        let (sampler, alerts) = rig(fast_config(), adc.clone());

        std::thread::sleep(Duration::from_millis(50));
        assert!(!sampler.snapshot().stale);

        adc.fail_next(u32::MAX);
        std::thread::sleep(Duration::from_millis(80));
        let readings = sampler.snapshot();
        assert!(readings.stale);
        // Last good values survive the failure window.
        assert!((readings.voltage_v - 14.8).abs() < 1e-9);
        assert!(alerts.is_active(AlertCode::SensorDegraded));
        sampler.shutdown();
    }

    #[test]
    fn degraded_alert_clears_on_recovery() {
        let adc = MockAdc::new();
        adc.set_raw(0, 14_800);
        adc.set_raw(1, 250);
        adc.set_raw(2, 250);
        let (sampler, alerts) = rig(fast_config(), adc.clone());

        adc.fail_next(30);
        std::thread::sleep(Duration::from_millis(80));
        assert!(alerts.is_active(AlertCode::SensorDegraded));

        std::thread::sleep(Duration::from_millis(100));
        assert!(!alerts.is_active(AlertCode::SensorDegraded));
        assert!(!sampler.snapshot().stale);
        sampler.shutdown();
    }
}
