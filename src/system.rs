//! Root system assembly
//!
//! [`System`] owns every component and wires them together at startup: no
//! module-level state anywhere. Adapters get a [`Dispatcher`] and the event
//! bus; nothing else reaches into component internals.
//!
//! Emergency fan-out order is fixed here: scene cancellation first (so the
//! `scene_cancelled` broadcast follows `state_changed` immediately), then
//! `stop_all` on both servo devices, then the stepper halt.

use crate::audio::{AudioPlayer, AudioSink, ProcessSink};
use crate::bus::{AlertSet, EventBus};
use crate::config::ConfigStore;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::gpio::{Gpio, SysfsGpio};
use crate::link::{DeviceId, LinkConfig, LinkScheduler, TransportFactory};
use crate::maestro::{ServoBatchEncoder, ServoController};
use crate::safety::{EstopMonitor, Supervisor};
use crate::scenes::SceneEngine;
use crate::sensors::{Adc, SensorSampler};
use crate::stepper::{ResubmitPolicy, StepperController};
use crate::telemetry::TelemetryAggregator;
use crate::transport::{SerialTransport, Transport};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The fully wired daemon
pub struct System {
    pub config: Arc<ConfigStore>,
    pub events: EventBus,
    pub alerts: AlertSet,
    pub supervisor: Supervisor,
    pub link: Arc<LinkScheduler>,
    pub servos: BTreeMap<DeviceId, Arc<ServoController>>,
    pub stepper: Arc<StepperController>,
    pub sampler: Arc<SensorSampler>,
    pub audio: Arc<AudioPlayer>,
    pub scenes: Arc<SceneEngine>,
    pub telemetry: Arc<TelemetryAggregator>,
    estop: Option<EstopMonitor>,
}

impl System {
    /// Assemble against real hardware as described by the config
    pub fn new(config: ConfigStore) -> Result<System> {
        let serial = config.hardware.serial.clone();
        let factory: TransportFactory = Box::new(move || {
            let transport: Box<dyn Transport> =
                Box::new(SerialTransport::open(&serial.port, serial.baud)?);
            Ok(transport)
        });

        let gpio: Arc<dyn Gpio> = Arc::new(SysfsGpio::new());
        #[cfg(target_os = "linux")]
        let adc: Box<dyn Adc> = Box::new(crate::sensors::Ads1115Adc::open(
            &config.hardware.sensors.i2c_bus,
            config.hardware.sensors.adc_address,
        )?);
        #[cfg(not(target_os = "linux"))]
        let adc: Box<dyn Adc> = Box::new(crate::sensors::MockAdc::new());

        let sink: Arc<dyn AudioSink> = Arc::new(ProcessSink::new(&config.hardware.audio.player));
        Self::assemble(config, factory, gpio, adc, sink, true)
    }

    /// Assemble with injected hardware backends; used by tests and by the
    /// bench mode that runs without a robot attached
    pub fn with_hardware(
        config: ConfigStore,
        factory: TransportFactory,
        gpio: Arc<dyn Gpio>,
        adc: Box<dyn Adc>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<System> {
        Self::assemble(config, factory, gpio, adc, sink, false)
    }

    fn assemble(
        config: ConfigStore,
        factory: TransportFactory,
        gpio: Arc<dyn Gpio>,
        adc: Box<dyn Adc>,
        sink: Arc<dyn AudioSink>,
        monitor_estop: bool,
    ) -> Result<System> {
        let config = Arc::new(config);
        let events = EventBus::new();
        let alerts = AlertSet::new(events.clone());

        let supervisor = Supervisor::new(
            config.hardware.safety.thresholds(),
            config.hardware.safety.failsafe_channels.iter().copied().collect(),
            events.clone(),
            alerts.clone(),
        );

        let link_config = LinkConfig {
            queue_capacity: config.hardware.serial.queue_capacity,
            max_batch: config.hardware.serial.max_batch,
            ..LinkConfig::default()
        };
        let link = LinkScheduler::new(factory, link_config, events.clone())?;

        let mut servos = BTreeMap::new();
        for (device, device_number) in [
            (DeviceId::Dev1, config.hardware.serial.dev1_number),
            (DeviceId::Dev2, config.hardware.serial.dev2_number),
        ] {
            let servo = ServoController::new(
                device,
                device_number,
                Arc::clone(&link),
                Arc::clone(&config.servo),
                supervisor.view(),
            );
            link.register_device(ServoBatchEncoder::new(device, device_number));
            servos.insert(device, servo);
        }

        let stepper = StepperController::new(
            config.hardware.stepper.clone(),
            Arc::clone(&gpio),
            supervisor.view(),
            alerts.clone(),
            ResubmitPolicy::Replace,
        )?;

        let sampler = Arc::new(SensorSampler::spawn(
            config.hardware.sensors.clone(),
            adc,
            supervisor.clone(),
            alerts.clone(),
        )?);

        let audio = AudioPlayer::new(&config.hardware.audio.directory, sink);
        audio.set_volume(config.hardware.audio.volume);

        let scenes = SceneEngine::new(
            Arc::clone(&config.scenes),
            Arc::clone(&config.servo),
            servos.clone(),
            Arc::clone(&audio),
            supervisor.view(),
            events.clone(),
        )?;

        let telemetry = Arc::new(TelemetryAggregator::spawn(
            config.hardware.telemetry_interval(),
            servos.values().cloned().collect(),
            Arc::clone(&stepper),
            Arc::clone(&sampler),
            supervisor.clone(),
            alerts.clone(),
            events.clone(),
        )?);

        // Emergency fan-out, in broadcast order.
        {
            let scenes = Arc::clone(&scenes);
            supervisor.on_emergency(move || {
                scenes.cancel("emergency");
            });
        }
        for servo in servos.values() {
            let servo = Arc::clone(servo);
            supervisor.on_emergency(move || {
                if let Err(e) = servo.stop_all() {
                    log::error!("stop_all for {} failed during emergency: {}", servo.device(), e);
                }
            });
        }
        {
            let stepper = Arc::clone(&stepper);
            supervisor.on_emergency(move || {
                stepper.stop(true);
            });
        }

        let estop = if monitor_estop {
            Some(EstopMonitor::spawn(
                Arc::clone(&gpio),
                config.hardware.stepper.estop_pin,
                supervisor.clone(),
            )?)
        } else {
            None
        };

        log::info!("System assembled: 2 servo devices, stepper, sensors, scenes");

        Ok(System {
            config,
            events,
            alerts,
            supervisor,
            link,
            servos,
            stepper,
            sampler,
            audio,
            scenes,
            telemetry,
            estop,
        })
    }

    /// Build the command router for adapters
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.servos.clone(),
            Arc::clone(&self.stepper),
            Arc::clone(&self.scenes),
            Arc::clone(&self.audio),
            self.supervisor.clone(),
            Arc::clone(&self.telemetry),
            Arc::clone(&self.link),
            Arc::clone(&self.config),
        )
    }

    /// Orderly shutdown: stop producers first, then the link
    pub fn shutdown(&self) {
        log::info!("Shutting down system");
        if let Some(estop) = &self.estop {
            estop.shutdown();
        }
        self.scenes.shutdown();
        self.telemetry.shutdown();
        self.sampler.shutdown();
        self.stepper.shutdown();
        self.audio.stop();
        self.link.shutdown();
        log::info!("System shutdown complete");
    }
}
