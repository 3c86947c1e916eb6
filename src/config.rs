//! Configuration loading and hot reload
//!
//! # Files
//!
//! All configuration is JSON, living in one directory:
//!
//! - `hardware_config.json` — serial link, stepper, sensors, audio, safety
//!   thresholds, network bind address, timing. Read once at startup;
//!   changing it requires a restart because it owns device handles.
//! - `servo_config.json` — per-channel limits and labels. Hot-reloadable;
//!   limit changes apply to the next command.
//! - `scenes_config.json` — the scene catalog. Hot-reloadable; edits apply
//!   to the next `play`.
//!
//! # Reload Semantics
//!
//! `reload(name)` parses and validates the file, then swaps the shared
//! config atomically. Any validation problem rejects the reload with the
//! full list of errors and keeps the previous configuration active.

use crate::error::{Error, Result};
use crate::maestro::{ChannelLimits, ServoChannel, ServoConfig};
use crate::safety::PowerThresholds;
use crate::scenes::SceneCatalog;
use crate::sensors::SensorConfig;
use crate::stepper::StepperConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const HARDWARE_CONFIG: &str = "hardware_config.json";
pub const SERVO_CONFIG: &str = "servo_config.json";
pub const SCENES_CONFIG: &str = "scenes_config.json";

/// Shared serial link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialLinkConfig {
    /// Serial port shared by both servo controllers
    ///
    /// **Format**: device path (e.g., "/dev/ttyAMA0", "COM3")
    pub port: String,

    /// Baud rate; the controller family default is 9600 8N1
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Protocol device number of controller 1
    #[serde(default = "default_dev1_number")]
    pub dev1_number: u8,

    /// Protocol device number of controller 2
    #[serde(default = "default_dev2_number")]
    pub dev2_number: u8,

    /// Maximum set-target requests coalesced into one compound frame
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Per-class scheduler queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_baud() -> u32 {
    9600
}
fn default_dev1_number() -> u8 {
    12
}
fn default_dev2_number() -> u8 {
    13
}
fn default_max_batch() -> usize {
    8
}
fn default_queue_capacity() -> usize {
    64
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".to_string(),
            baud: default_baud(),
            dev1_number: default_dev1_number(),
            dev2_number: default_dev2_number(),
            max_batch: default_max_batch(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Audio subsystem settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_audio_dir")]
    pub directory: String,
    /// Binary used to play clips
    #[serde(default = "default_audio_player")]
    pub player: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

fn default_audio_dir() -> String {
    "audio".to_string()
}
fn default_audio_player() -> String {
    "aplay".to_string()
}
fn default_volume() -> f32 {
    0.7
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            directory: default_audio_dir(),
            player: default_audio_player(),
            volume: default_volume(),
        }
    }
}

/// Safety thresholds and failsafe channel set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_v_low")]
    pub v_low: f64,
    #[serde(default = "default_i_max")]
    pub i_max: f64,
    #[serde(default = "default_dwell_s")]
    pub dwell_s: f64,
    #[serde(default = "default_recover_margin_v")]
    pub recover_margin_v: f64,
    #[serde(default = "default_recover_s")]
    pub recover_s: f64,
    /// Channels forced safe while in failsafe (the drive tracks)
    #[serde(default)]
    pub failsafe_channels: Vec<ServoChannel>,
}

fn default_v_low() -> f64 {
    13.2
}
fn default_i_max() -> f64 {
    50.0
}
fn default_dwell_s() -> f64 {
    2.0
}
fn default_recover_margin_v() -> f64 {
    0.4
}
fn default_recover_s() -> f64 {
    5.0
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            v_low: default_v_low(),
            i_max: default_i_max(),
            dwell_s: default_dwell_s(),
            recover_margin_v: default_recover_margin_v(),
            recover_s: default_recover_s(),
            failsafe_channels: Vec::new(),
        }
    }
}

impl SafetyConfig {
    pub fn thresholds(&self) -> PowerThresholds {
        PowerThresholds {
            v_low: self.v_low,
            i_max: self.i_max,
            dwell: Duration::from_secs_f64(self.dwell_s),
            recover_margin_v: self.recover_margin_v,
            recover: Duration::from_secs_f64(self.recover_s),
        }
    }
}

/// Loop cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
}

fn default_telemetry_interval_ms() -> u64 {
    200
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: default_telemetry_interval_ms(),
        }
    }
}

/// Network settings for the command channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP bind address for clients
    ///
    /// **Format**: "host:port"
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8766".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// Root hardware configuration (`hardware_config.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub serial: SerialLinkConfig,
    #[serde(default)]
    pub stepper: StepperConfig,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl HardwareConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.timing.telemetry_interval_ms.max(10))
    }
}

/// All loaded configuration with shared, atomically swappable parts
#[derive(Debug)]
pub struct ConfigStore {
    directory: PathBuf,
    pub hardware: HardwareConfig,
    pub servo: Arc<RwLock<ServoConfig>>,
    pub scenes: Arc<RwLock<SceneCatalog>>,
}

impl ConfigStore {
    /// Load all configuration from `directory`
    ///
    /// A missing hardware config falls back to defaults with a warning so a
    /// bench setup can boot; missing servo/scene files start empty.
    pub fn load(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();

        let hardware: HardwareConfig = match read_json(&directory.join(HARDWARE_CONFIG)) {
            Ok(Some(config)) => config,
            Ok(None) => {
                log::warn!("{} not found, using defaults", HARDWARE_CONFIG);
                HardwareConfig::default()
            }
            Err(e) => return Err(e),
        };

        let servo: ServoConfig = match read_json(&directory.join(SERVO_CONFIG)) {
            Ok(Some(config)) => config,
            Ok(None) => {
                log::warn!("{} not found, starting with no channels", SERVO_CONFIG);
                ServoConfig::default()
            }
            Err(e) => return Err(e),
        };
        let problems = servo.problems();
        if !problems.is_empty() {
            return Err(Error::ConfigInvalid(problems));
        }

        let scenes: SceneCatalog = match read_json(&directory.join(SCENES_CONFIG)) {
            Ok(Some(catalog)) => catalog,
            Ok(None) => {
                log::warn!("{} not found, starting with no scenes", SCENES_CONFIG);
                SceneCatalog::default()
            }
            Err(e) => return Err(e),
        };
        let problems = scenes.problems(&servo);
        if !problems.is_empty() {
            return Err(Error::ConfigInvalid(problems));
        }

        log::info!(
            "Configuration loaded: {} servo channels, {} scenes",
            servo.channels.len(),
            scenes.scenes.len()
        );

        Ok(Self {
            directory,
            hardware,
            servo: Arc::new(RwLock::new(servo)),
            scenes: Arc::new(RwLock::new(scenes)),
        })
    }

    /// Re-read one config file and swap it in atomically
    ///
    /// `name` is the file name (e.g. "servo_config.json"). Validation
    /// failures reject the reload and keep the prior config.
    pub fn reload(&self, name: &str) -> Result<()> {
        match name {
            SERVO_CONFIG => {
                let incoming: ServoConfig = read_json(&self.directory.join(SERVO_CONFIG))?
                    .ok_or_else(|| Error::ConfigInvalid(vec![format!("{} missing", name)]))?;
                let problems = incoming.problems();
                if !problems.is_empty() {
                    return Err(Error::ConfigInvalid(problems));
                }
                *self.servo.write() = incoming;
                log::info!("Reloaded {}", name);
                Ok(())
            }
            SCENES_CONFIG => {
                let incoming: SceneCatalog = read_json(&self.directory.join(SCENES_CONFIG))?
                    .ok_or_else(|| Error::ConfigInvalid(vec![format!("{} missing", name)]))?;
                let problems = incoming.problems(&self.servo.read());
                if !problems.is_empty() {
                    return Err(Error::ConfigInvalid(problems));
                }
                *self.scenes.write() = incoming;
                log::info!("Reloaded {}", name);
                Ok(())
            }
            HARDWARE_CONFIG => Err(Error::ConfigInvalid(vec![
                "hardware config owns device handles; restart to apply".to_string(),
            ])),
            other => Err(Error::ConfigInvalid(vec![format!(
                "unknown config file: {}",
                other
            )])),
        }
    }

    /// Update one channel's limits, validate, persist, and swap
    pub fn set_channel_limits(&self, channel: ServoChannel, limits: ChannelLimits) -> Result<()> {
        let problems = limits.problems(&channel);
        if !problems.is_empty() {
            return Err(Error::ConfigInvalid(problems));
        }
        let updated = {
            let mut servo = self.servo.write();
            servo.channels.insert(channel, limits);
            servo.clone()
        };
        write_json(&self.directory.join(SERVO_CONFIG), &updated)?;
        log::info!("Updated limits for {}", channel);
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value = serde_json::from_str(&content).map_err(|e| {
        Error::ConfigInvalid(vec![format!("{}: {}", path.display(), e)])
    })?;
    Ok(Some(value))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn servo_json() -> &'static str {
        r#"{
            "m1_ch0": {"min_us": 1000, "max_us": 2000, "home_us": 1500, "name": "head_pan"},
            "m2_ch3": {"min_us": 1200, "max_us": 1800, "home_us": 1500, "name": "arm_left", "accel": 30}
        }"#
    }

    #[test]
    fn load_reads_all_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(HARDWARE_CONFIG),
            r#"{"serial": {"port": "/dev/ttyUSB0"}}"#,
        )
        .unwrap();
        fs::write(dir.path().join(SERVO_CONFIG), servo_json()).unwrap();
        fs::write(
            dir.path().join(SCENES_CONFIG),
            r#"{"wave": {"label": "Wave", "duration_s": 1.5,
                 "servos": {"m1_ch0": {"target": 1600}}}}"#,
        )
        .unwrap();

        let store = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(store.hardware.serial.port, "/dev/ttyUSB0");
        assert_eq!(store.hardware.serial.baud, 9600);
        assert_eq!(store.servo.read().channels.len(), 2);
        assert!(store.scenes.read().get("wave").is_some());
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(store.hardware.serial.dev1_number, 12);
        assert_eq!(store.hardware.serial.dev2_number, 13);
        assert!(store.servo.read().channels.is_empty());
    }

    #[test]
    fn invalid_servo_config_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SERVO_CONFIG),
            r#"{"m1_ch0": {"min_us": 100, "max_us": 2000, "home_us": 1500, "name": "bad"}}"#,
        )
        .unwrap();
        let err = ConfigStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn scene_referencing_unknown_channel_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SERVO_CONFIG), servo_json()).unwrap();
        fs::write(
            dir.path().join(SCENES_CONFIG),
            r#"{"bad": {"label": "Bad", "duration_s": 1.0,
                 "servos": {"m2_ch9": {"target": 1500}}}}"#,
        )
        .unwrap();
        assert!(ConfigStore::load(dir.path()).is_err());
    }

    #[test]
    fn failed_reload_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SERVO_CONFIG), servo_json()).unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(store.servo.read().channels.len(), 2);

        fs::write(
            dir.path().join(SERVO_CONFIG),
            r#"{"m1_ch0": {"min_us": 2000, "max_us": 1000, "home_us": 1500, "name": "inverted"}}"#,
        )
        .unwrap();
        let err = store.reload(SERVO_CONFIG).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert_eq!(store.servo.read().channels.len(), 2);
    }

    #[test]
    fn successful_reload_swaps_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SERVO_CONFIG), servo_json()).unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();

        fs::write(
            dir.path().join(SERVO_CONFIG),
            r#"{"m1_ch0": {"min_us": 1100, "max_us": 1900, "home_us": 1500, "name": "head_pan"}}"#,
        )
        .unwrap();
        store.reload(SERVO_CONFIG).unwrap();
        let servo = store.servo.read();
        assert_eq!(servo.channels.len(), 1);
        let limits = servo.limits(&"m1_ch0".parse().unwrap()).unwrap();
        assert_eq!(limits.min_us, 1100);
    }

    #[test]
    fn set_channel_limits_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SERVO_CONFIG), servo_json()).unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();

        store
            .set_channel_limits(
                "m1_ch5".parse().unwrap(),
                ChannelLimits {
                    min_us: 1000,
                    max_us: 1800,
                    home_us: 1200,
                    name: "eye_left".into(),
                    accel: None,
                },
            )
            .unwrap();

        // A fresh load sees the persisted entry.
        let reloaded = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.servo.read().channels.len(), 3);
    }

    #[test]
    fn invalid_limits_update_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        let err = store
            .set_channel_limits(
                "m1_ch0".parse().unwrap(),
                ChannelLimits {
                    min_us: 500,
                    max_us: 2000,
                    home_us: 1500,
                    name: "bad".into(),
                    accel: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn hardware_reload_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        assert!(store.reload(HARDWARE_CONFIG).is_err());
        assert!(store.reload("bogus.json").is_err());
    }
}
