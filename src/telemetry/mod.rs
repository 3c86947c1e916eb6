//! Telemetry aggregation
//!
//! A ticker thread composes a [`TelemetrySnapshot`] at a fixed cadence from
//! the observable state of the other components and publishes it on the
//! event bus. Snapshots are plain values; subscribers never share state with
//! the components being observed. `t_ms` is strictly increasing across
//! consecutive snapshots even if the OS clock misbehaves, because it derives
//! from a monotonic start instant with a last-value floor.

use crate::bus::{AlertCode, AlertSet, Event, EventBus};
use crate::error::{Error, Result};
use crate::maestro::ServoController;
use crate::safety::{SystemState, Supervisor};
use crate::sensors::SensorSampler;
use crate::stepper::{StepperController, StepperStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One consistent observation of the whole system
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// Milliseconds since daemon start; strictly increasing
    pub t_ms: u64,
    pub voltage_v: f64,
    pub current_a_ch1: f64,
    pub current_a_ch2: f64,
    /// Sensor values are held over from the last good sample
    pub sensors_stale: bool,
    /// Last commanded target per known servo channel
    pub servo_positions: BTreeMap<String, u16>,
    pub stepper: StepperStatus,
    pub state: SystemState,
    pub alerts: Vec<AlertCode>,
}

/// Periodic snapshot publisher
pub struct TelemetryAggregator {
    latest: Arc<Mutex<Option<TelemetrySnapshot>>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        interval: Duration,
        servos: Vec<Arc<ServoController>>,
        stepper: Arc<StepperController>,
        sampler: Arc<SensorSampler>,
        supervisor: Supervisor,
        alerts: AlertSet,
        events: EventBus,
    ) -> Result<Self> {
        let latest = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_latest = Arc::clone(&latest);
        let thread_shutdown = Arc::clone(&shutdown);

        let worker = thread::Builder::new()
            .name("telemetry-ticker".to_string())
            .spawn(move || {
                let start = Instant::now();
                let mut last_t_ms: u64 = 0;
                log::info!("Telemetry ticker started at {:?} cadence", interval);

                while !thread_shutdown.load(Ordering::Relaxed) {
                    let tick_started = Instant::now();

                    let t_ms = (start.elapsed().as_millis() as u64).max(last_t_ms + 1);
                    last_t_ms = t_ms;

                    let power = sampler.snapshot();
                    let mut servo_positions = BTreeMap::new();
                    for servo in &servos {
                        servo_positions.extend(servo.positions());
                    }

                    let snapshot = TelemetrySnapshot {
                        t_ms,
                        voltage_v: power.voltage_v,
                        current_a_ch1: power.current_a_ch1,
                        current_a_ch2: power.current_a_ch2,
                        sensors_stale: power.stale,
                        servo_positions,
                        stepper: stepper.status(),
                        state: supervisor.current(),
                        alerts: alerts.active(),
                    };

                    *thread_latest.lock() = Some(snapshot.clone());
                    events.publish(Event::Telemetry(snapshot));

                    let elapsed = tick_started.elapsed();
                    if elapsed < interval {
                        thread::sleep(interval - elapsed);
                    }
                }
                log::info!("Telemetry ticker exiting");
            })
            .map_err(|e| Error::Other(format!("failed to spawn telemetry ticker: {}", e)))?;

        Ok(Self {
            latest,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Latest published snapshot, for one-shot queries
    pub fn latest(&self) -> Option<TelemetrySnapshot> {
        self.latest.lock().clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TelemetryAggregator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
