//! Scene execution engine
//!
//! Runs one scene at a time on a dedicated worker thread:
//!
//! 1. `t = 0`: dispatch every servo move (grouped per device so the link
//!    scheduler can coalesce them) and start any onboard subscripts.
//! 2. `t = delay_s`: the audio cue fires (scheduled through the player's
//!    delayed start). Audio problems are logged, never fatal.
//! 3. `t = duration_s`: the scene completes.
//!
//! Cancellation is cooperative: frames already handed to the scheduler
//! complete, audio stops, and servos stay at their last commanded positions.

use super::{Scene, SceneCatalog};
use crate::audio::AudioPlayer;
use crate::bus::{Event, EventBus};
use crate::error::{Error, Result};
use crate::link::{DeviceId, Priority};
use crate::maestro::{MoveSpec, ServoConfig, ServoController};
use crate::safety::StateView;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll granularity for the scene clock
const SCENE_TICK: Duration = Duration::from_millis(10);

/// Budget for getting the opening servo frames onto the link
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(250);

struct EngineInner {
    catalog: Arc<RwLock<SceneCatalog>>,
    servo_config: Arc<RwLock<ServoConfig>>,
    servos: BTreeMap<DeviceId, Arc<ServoController>>,
    audio: Arc<AudioPlayer>,
    state: StateView,
    events: EventBus,
    /// Name of the scene currently playing or queued to play
    active: Mutex<Option<String>>,
    cancel: AtomicBool,
    shutdown: AtomicBool,
}

/// The scene engine
pub struct SceneEngine {
    inner: Arc<EngineInner>,
    cmd_tx: Sender<Scene>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SceneEngine {
    pub fn new(
        catalog: Arc<RwLock<SceneCatalog>>,
        servo_config: Arc<RwLock<ServoConfig>>,
        servos: BTreeMap<DeviceId, Arc<ServoController>>,
        audio: Arc<AudioPlayer>,
        state: StateView,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let inner = Arc::new(EngineInner {
            catalog,
            servo_config,
            servos,
            audio,
            state,
            events,
            active: Mutex::new(None),
            cancel: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let (cmd_tx, cmd_rx) = bounded::<Scene>(1);
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("scene-engine".to_string())
            .spawn(move || scene_loop(worker_inner, cmd_rx))
            .map_err(|e| Error::Other(format!("failed to spawn scene engine: {}", e)))?;

        Ok(Arc::new(Self {
            inner,
            cmd_tx,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Start a scene by name
    ///
    /// A scene already in flight rejects with `SceneBusy` unless `replace`
    /// is set, which cancels it first (stop frames and audio stop included).
    pub fn play(&self, name: &str, replace: bool) -> Result<()> {
        self.inner.state.check_scene_start()?;

        let scene = self
            .inner
            .catalog
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownScene(name.to_string()))?;

        {
            let mut active = self.inner.active.lock();
            if let Some(current) = active.clone() {
                if !replace {
                    return Err(Error::SceneBusy(current));
                }
                drop(active);
                self.cancel("replaced");
                // Wait for the worker to acknowledge before re-claiming.
                let deadline = Instant::now() + Duration::from_millis(500);
                loop {
                    if self.inner.active.lock().is_none() {
                        break;
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::SceneBusy(current.clone()));
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                active = self.inner.active.lock();
            }
            *active = Some(name.to_string());
        }

        self.inner.cancel.store(false, Ordering::SeqCst);
        // A transition may have landed while we claimed the slot; re-check so
        // a cancel flag raised by the supervisor hook cannot be wiped above.
        if let Err(e) = self.inner.state.check_scene_start() {
            self.inner.active.lock().take();
            return Err(e);
        }

        match self.cmd_tx.send_timeout(scene, Duration::from_millis(500)) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.inner.active.lock().take();
                Err(Error::Busy("scene engine not accepting work".into()))
            }
        }
    }

    /// Play a random scene of the given category
    pub fn play_random(&self, category: &str, replace: bool) -> Result<String> {
        let name = self
            .inner
            .catalog
            .read()
            .random_by_category(category)
            .ok_or_else(|| Error::UnknownScene(format!("category:{}", category)))?;
        self.play(&name, replace)?;
        Ok(name)
    }

    /// Cancel the active scene, if any
    ///
    /// Idempotent: stops audio, lets in-flight frames complete, leaves the
    /// servos where they are, and emits `scene_cancelled` exactly once.
    /// Returns whether a scene was actually cancelled.
    pub fn cancel(&self, reason: &str) -> bool {
        let Some(scene) = self.inner.active.lock().clone() else {
            return false;
        };
        self.inner.cancel.store(true, Ordering::SeqCst);
        self.inner.audio.stop();
        self.inner.events.publish(Event::SceneCancelled {
            scene: scene.clone(),
            reason: reason.to_string(),
        });
        log::info!("Scene '{}' cancelled ({})", scene, reason);
        true
    }

    /// Name of the scene currently playing
    pub fn active_scene(&self) -> Option<String> {
        self.inner.active.lock().clone()
    }

    /// Wait for the engine to go idle; test and shutdown aid
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.inner.active.lock().is_some() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SceneEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scene_loop(inner: Arc<EngineInner>, cmd_rx: Receiver<Scene>) {
    log::info!("Scene engine started");
    while !inner.shutdown.load(Ordering::Relaxed) {
        match cmd_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(scene) => {
                run_scene(&inner, &scene);
                inner.active.lock().take();
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!("Scene engine exiting");
}

fn run_scene(inner: &EngineInner, scene: &Scene) {
    let name = inner
        .active
        .lock()
        .clone()
        .unwrap_or_else(|| scene.label.clone());
    log::info!(
        "Playing scene '{}' ({:.1}s, {} servo moves)",
        name,
        scene.duration_s,
        scene.servos.len()
    );
    inner.events.publish(Event::SceneStarted { scene: name.clone() });
    let started = Instant::now();

    // Opening dispatch: servo moves grouped per device, then subscripts.
    if let Err(e) = dispatch_moves(inner, scene) {
        log::error!("Scene '{}' dispatch failed: {}", name, e);
        inner.events.publish(Event::SceneError {
            scene: name.clone(),
            reason: e.to_string(),
        });
        return;
    }
    dispatch_scripts(inner, scene);

    // Audio cue; problems are non-fatal to the scene.
    if let Some(cue) = &scene.audio {
        let delay = Duration::from_secs_f64(cue.delay_s.max(0.0));
        if let Err(e) = inner.audio.play(&cue.clip, delay) {
            log::warn!("Scene '{}' audio cue failed: {}", name, e);
        }
    }

    // Monitor until the scene clock runs out or cancellation lands.
    let duration = Duration::from_secs_f64(scene.duration_s.max(0.0));
    while started.elapsed() < duration {
        if inner.cancel.load(Ordering::Relaxed) {
            // cancel() already emitted the event and stopped audio.
            return;
        }
        thread::sleep(SCENE_TICK);
    }

    log::info!("Scene '{}' completed in {:.2?}", name, started.elapsed());
    inner.events.publish(Event::SceneCompleted { scene: name });
}

fn dispatch_moves(inner: &EngineInner, scene: &Scene) -> Result<()> {
    let mut per_device: BTreeMap<DeviceId, Vec<MoveSpec>> = BTreeMap::new();
    {
        let config = inner.servo_config.read();
        for (channel, servo_move) in &scene.servos {
            // Scenes may omit acceleration; the channel's configured default
            // applies when present.
            let default_accel = config
                .limits(channel)
                .ok()
                .and_then(|limits| limits.accel);
            per_device.entry(channel.device).or_default().push(MoveSpec {
                channel: channel.channel,
                target_us: servo_move.target,
                speed: servo_move.speed,
                accel: servo_move.acceleration.or(default_accel),
            });
        }
    }

    for (device, moves) in per_device {
        let Some(servo) = inner.servos.get(&device) else {
            return Err(Error::Other(format!("no controller for {}", device)));
        };
        servo.set_targets(&moves, Priority::Normal, DISPATCH_TIMEOUT)?;
        log::debug!("Scene dispatched {} moves to {}", moves.len(), device);
    }
    Ok(())
}

fn dispatch_scripts(inner: &EngineInner, scene: &Scene) {
    let Some(scripts) = &scene.scripts else {
        return;
    };
    let pairs = [
        (DeviceId::Dev1, scripts.dev1),
        (DeviceId::Dev2, scripts.dev2),
    ];
    for (device, subscript) in pairs {
        let Some(subscript) = subscript else { continue };
        match inner.servos.get(&device) {
            Some(servo) => {
                if let Err(e) = servo.run_subscript(subscript) {
                    log::warn!("Subscript {} on {} failed: {}", subscript, device, e);
                }
            }
            None => log::warn!("Scene references unknown device {}", device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MockSink;
    use crate::bus::AlertSet;
    use crate::link::{LinkConfig, LinkScheduler, TransportFactory};
    use crate::maestro::{ChannelLimits, ServoBatchEncoder};
    use crate::safety::{PowerThresholds, Supervisor, SystemState};
    use crate::scenes::{AudioCue, ServoMove};
    use crate::transport::{MockTransport, Transport};
    use std::collections::HashSet;

    struct Rig {
        mock: MockTransport,
        link: Arc<LinkScheduler>,
        supervisor: Supervisor,
        bus: EventBus,
        sink: MockSink,
        servo1: Arc<ServoController>,
        engine: Arc<SceneEngine>,
        _audio_dir: tempfile::TempDir,
    }

    fn scene(duration_s: f64, audio: Option<AudioCue>) -> Scene {
        let mut servos = BTreeMap::new();
        servos.insert(
            "m1_ch0".parse().unwrap(),
            ServoMove {
                target: 1600,
                speed: Some(40),
                acceleration: None,
            },
        );
        Scene {
            label: "Test Scene".into(),
            duration_s,
            audio,
            scripts: None,
            servos,
            categories: vec!["Misc".into()],
            emoji: None,
        }
    }

    fn rig(catalog: SceneCatalog) -> Rig {
        let mock = MockTransport::new();
        let factory_mock = mock.clone();
        let factory: TransportFactory = Box::new(move || {
            let t: Box<dyn Transport> = Box::new(factory_mock.clone());
            Ok(t)
        });
        let bus = EventBus::new();
        let link = LinkScheduler::new(factory, LinkConfig::default(), bus.clone()).unwrap();
        link.register_device(ServoBatchEncoder::new(DeviceId::Dev1, 12));

        let mut servo_config = ServoConfig::default();
        servo_config.channels.insert(
            "m1_ch0".parse().unwrap(),
            ChannelLimits {
                min_us: 1000,
                max_us: 2000,
                home_us: 1500,
                name: "head_pan".into(),
                accel: Some(25),
            },
        );
        let servo_config = Arc::new(RwLock::new(servo_config));

        let alerts = AlertSet::new(bus.clone());
        let supervisor = Supervisor::new(
            PowerThresholds::default(),
            HashSet::new(),
            bus.clone(),
            alerts,
        );

        let servo1 = ServoController::new(
            DeviceId::Dev1,
            12,
            Arc::clone(&link),
            Arc::clone(&servo_config),
            supervisor.view(),
        );

        let audio_dir = tempfile::tempdir().unwrap();
        std::fs::File::create(audio_dir.path().join("beep.wav")).unwrap();
        let sink = MockSink::new();
        let audio = AudioPlayer::new(audio_dir.path(), Arc::new(sink.clone()));

        let mut servos = BTreeMap::new();
        servos.insert(DeviceId::Dev1, Arc::clone(&servo1));
        let engine = SceneEngine::new(
            Arc::new(RwLock::new(catalog)),
            servo_config,
            servos,
            audio,
            supervisor.view(),
            bus.clone(),
        )
        .unwrap();

        Rig {
            mock,
            link,
            supervisor,
            bus,
            sink,
            servo1,
            engine,
            _audio_dir: audio_dir,
        }
    }

    #[test]
    fn scene_moves_servos_and_completes() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("quick".into(), scene(0.1, None));
        let r = rig(catalog);
        let sub = r.bus.subscribe();

        r.engine.play("quick", false).unwrap();
        assert!(r.engine.wait_idle(Duration::from_secs(2)));

        // The cached position reflects the scene's target.
        assert_eq!(r.servo1.get_position(0).unwrap(), 1600);
        let events = sub.drain();
        assert!(matches!(events.first(), Some(Event::SceneStarted { .. })));
        assert!(matches!(events.last(), Some(Event::SceneCompleted { .. })));
        r.engine.shutdown();
        r.link.shutdown();
    }

    #[test]
    fn busy_scene_rejects_unless_replace() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("long".into(), scene(5.0, None));
        catalog.scenes.insert("short".into(), scene(0.05, None));
        let r = rig(catalog);

        r.engine.play("long", false).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let err = r.engine.play("short", false).unwrap_err();
        assert!(matches!(err, Error::SceneBusy(_)));

        // replace=true cancels the active scene and starts the new one.
        r.engine.play("short", true).unwrap();
        assert!(r.engine.wait_idle(Duration::from_secs(2)));
        r.engine.shutdown();
        r.link.shutdown();
    }

    #[test]
    fn cancel_emits_event_and_leaves_positions() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("long".into(), scene(5.0, None));
        let r = rig(catalog);
        let sub = r.bus.subscribe();

        r.engine.play("long", false).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(r.engine.cancel("operator"));
        assert!(r.engine.wait_idle(Duration::from_secs(2)));

        // Servo stays at the scene's commanded position: no retract frames.
        assert_eq!(r.servo1.get_position(0).unwrap(), 1600);
        let events = sub.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::SceneCancelled { reason, .. } if reason == "operator")));
        assert!(!events.iter().any(|e| matches!(e, Event::SceneCompleted { .. })));

        // Cancelling again is a no-op.
        assert!(!r.engine.cancel("again"));
        r.engine.shutdown();
        r.link.shutdown();
    }

    #[test]
    fn audio_cue_fires_after_delay() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert(
            "with_audio".into(),
            scene(
                0.3,
                Some(AudioCue {
                    clip: "beep".into(),
                    delay_s: 0.05,
                }),
            ),
        );
        let r = rig(catalog);
        r.engine.play("with_audio", false).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(r.sink.started().is_empty());
        assert!(r.engine.wait_idle(Duration::from_secs(2)));
        assert_eq!(r.sink.started().len(), 1);
        r.engine.shutdown();
        r.link.shutdown();
    }

    #[test]
    fn missing_audio_clip_does_not_abort_scene() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert(
            "ghost_audio".into(),
            scene(
                0.1,
                Some(AudioCue {
                    clip: "missing".into(),
                    delay_s: 0.0,
                }),
            ),
        );
        let r = rig(catalog);
        let sub = r.bus.subscribe();
        r.engine.play("ghost_audio", false).unwrap();
        assert!(r.engine.wait_idle(Duration::from_secs(2)));
        let events = sub.drain();
        assert!(events.iter().any(|e| matches!(e, Event::SceneCompleted { .. })));
        assert!(!events.iter().any(|e| matches!(e, Event::SceneError { .. })));
        r.engine.shutdown();
        r.link.shutdown();
    }

    #[test]
    fn scene_start_forbidden_outside_normal() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("quick".into(), scene(0.1, None));
        let r = rig(catalog);
        r.supervisor.set_failsafe(true).unwrap();
        let err = r.engine.play("quick", false).unwrap_err();
        assert!(matches!(err, Error::StateForbidsScene));
        r.engine.shutdown();
        r.link.shutdown();
    }

    #[test]
    fn unknown_scene_is_rejected() {
        let r = rig(SceneCatalog::default());
        let err = r.engine.play("ghost", false).unwrap_err();
        assert!(matches!(err, Error::UnknownScene(_)));
        r.engine.shutdown();
        r.link.shutdown();
    }

    #[test]
    fn emergency_cancels_scene_via_supervisor_hook() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("long".into(), scene(5.0, None));
        let r = rig(catalog);
        let engine = Arc::clone(&r.engine);
        r.supervisor.on_emergency(move || {
            engine.cancel("emergency");
        });
        let sub = r.bus.subscribe();

        r.engine.play("long", false).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        r.supervisor.request_emergency("test");
        assert!(r.engine.wait_idle(Duration::from_secs(2)));

        let events = sub.drain();
        let state_idx = events
            .iter()
            .position(|e| matches!(e, Event::StateChanged { state: SystemState::Emergency }))
            .expect("state change event");
        let cancel_idx = events
            .iter()
            .position(|e| matches!(e, Event::SceneCancelled { .. }))
            .expect("cancel event");
        assert!(state_idx < cancel_idx);
        r.engine.shutdown();
        r.link.shutdown();
    }
}
