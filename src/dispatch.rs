//! Command envelope and dispatch
//!
//! Clients talk JSON over the framed TCP channel. Every inbound message is
//! an [`Inbound`] envelope: a `type` tag, the command fields, and an
//! optional `id` echoed back in the [`Reply`] so adapters can correlate
//! structured errors with the message that caused them. Components never
//! translate errors; the dispatcher attaches the error kind verbatim.

use crate::audio::AudioPlayer;
use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::link::{DeviceId, LinkScheduler, Priority};
use crate::maestro::{ChannelLimits, ServoChannel, ServoController};
use crate::safety::Supervisor;
use crate::scenes::SceneEngine;
use crate::stepper::StepperController;
use crate::telemetry::TelemetryAggregator;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Commands accepted over the message channel
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Servo {
        channel: String,
        position: u16,
        #[serde(default)]
        speed: Option<u8>,
        #[serde(default)]
        acceleration: Option<u8>,
        #[serde(default)]
        priority: Option<Priority>,
    },
    Scene {
        scene_name: String,
        #[serde(default)]
        replace: bool,
    },
    SceneStop,
    PlayRandomScene {
        category: String,
        #[serde(default)]
        replace: bool,
    },
    StepperMove {
        #[serde(default)]
        position_cm: Option<f64>,
        #[serde(default)]
        distance_cm: Option<f64>,
        #[serde(default)]
        speed: Option<u32>,
    },
    StepperHome,
    StepperEnable,
    StepperDisable,
    StepperClearFault,
    EmergencyStop,
    ClearEmergency,
    EnableFailsafe,
    DisableFailsafe,
    GetTelemetry,
    GetSceneList,
    GetServoConfig {
        #[serde(default)]
        channel: Option<String>,
    },
    SetServoConfig {
        channel: String,
        limits: ChannelLimits,
    },
    GetLinkStats,
    GetAudioList,
    SetVolume {
        volume: f32,
    },
    AudioStop,
    ReloadConfig {
        name: String,
    },
}

/// One inbound message: optional correlation id plus the command
#[derive(Debug, Clone, Deserialize)]
pub struct Inbound {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub command: Command,
}

/// Structured reply to one inbound message
#[derive(Debug, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Reply {
    fn ok(id: Option<u64>, data: Option<serde_json::Value>) -> Self {
        Reply {
            id,
            ok: true,
            error: None,
            kind: None,
            data,
        }
    }

    fn err(id: Option<u64>, error: &Error) -> Self {
        Reply {
            id,
            ok: false,
            error: Some(error.to_string()),
            kind: Some(error.kind()),
            data: None,
        }
    }
}

/// Routes inbound commands to the owning component
#[derive(Clone)]
pub struct Dispatcher {
    servos: BTreeMap<DeviceId, Arc<ServoController>>,
    stepper: Arc<StepperController>,
    scenes: Arc<SceneEngine>,
    audio: Arc<AudioPlayer>,
    supervisor: Supervisor,
    telemetry: Arc<TelemetryAggregator>,
    link: Arc<LinkScheduler>,
    config: Arc<ConfigStore>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        servos: BTreeMap<DeviceId, Arc<ServoController>>,
        stepper: Arc<StepperController>,
        scenes: Arc<SceneEngine>,
        audio: Arc<AudioPlayer>,
        supervisor: Supervisor,
        telemetry: Arc<TelemetryAggregator>,
        link: Arc<LinkScheduler>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            servos,
            stepper,
            scenes,
            audio,
            supervisor,
            telemetry,
            link,
            config,
        }
    }

    /// Handle one message; always produces a reply
    pub fn handle(&self, inbound: Inbound) -> Reply {
        let id = inbound.id;
        match self.execute(inbound.command) {
            Ok(data) => Reply::ok(id, data),
            Err(e) => {
                log::debug!("Command failed: {}", e);
                Reply::err(id, &e)
            }
        }
    }

    /// Parse a raw JSON payload and handle it
    pub fn handle_raw(&self, payload: &[u8]) -> Reply {
        match serde_json::from_slice::<Inbound>(payload) {
            Ok(inbound) => self.handle(inbound),
            Err(e) => Reply::err(None, &Error::Json(e)),
        }
    }

    fn servo_for(&self, channel: &ServoChannel) -> Result<&Arc<ServoController>> {
        self.servos
            .get(&channel.device)
            .ok_or_else(|| Error::UnknownChannel(channel.to_string()))
    }

    fn execute(&self, command: Command) -> Result<Option<serde_json::Value>> {
        match command {
            Command::Servo {
                channel,
                position,
                speed,
                acceleration,
                priority,
            } => {
                let address: ServoChannel = channel.parse()?;
                let servo = self.servo_for(&address)?;
                if let Some(speed) = speed {
                    servo.set_speed(address.channel, speed)?;
                }
                if let Some(accel) = acceleration {
                    servo.set_acceleration(address.channel, accel)?;
                }
                servo.set_target(address.channel, position, priority.unwrap_or(Priority::Normal))?;
                Ok(None)
            }

            Command::Scene { scene_name, replace } => {
                self.scenes.play(&scene_name, replace)?;
                Ok(None)
            }
            Command::SceneStop => {
                let cancelled = self.scenes.cancel("requested");
                Ok(Some(json!({ "cancelled": cancelled })))
            }
            Command::PlayRandomScene { category, replace } => {
                let name = self.scenes.play_random(&category, replace)?;
                Ok(Some(json!({ "scene_name": name })))
            }

            Command::StepperMove {
                position_cm,
                distance_cm,
                speed,
            } => {
                match (position_cm, distance_cm) {
                    (Some(position), _) => self.stepper.move_to_cm(position, speed)?,
                    (None, Some(distance)) => self.stepper.move_distance_cm(distance, speed)?,
                    (None, None) => {
                        return Err(Error::Other(
                            "stepper_move needs position_cm or distance_cm".into(),
                        ))
                    }
                }
                Ok(None)
            }
            Command::StepperHome => {
                self.stepper.home()?;
                Ok(None)
            }
            Command::StepperEnable => {
                self.stepper.enable()?;
                Ok(None)
            }
            Command::StepperDisable => {
                self.stepper.disable()?;
                Ok(None)
            }
            Command::StepperClearFault => {
                self.stepper.clear_fault()?;
                Ok(None)
            }

            Command::EmergencyStop => {
                // Always reports success once actuators are halted, even if
                // the system was already in Emergency.
                self.supervisor.request_emergency("operator request");
                Ok(None)
            }
            Command::ClearEmergency => {
                self.supervisor.clear_emergency();
                Ok(None)
            }
            Command::EnableFailsafe => {
                self.supervisor.set_failsafe(true)?;
                Ok(None)
            }
            Command::DisableFailsafe => {
                self.supervisor.set_failsafe(false)?;
                Ok(None)
            }

            Command::GetTelemetry => {
                let snapshot = self
                    .telemetry
                    .latest()
                    .ok_or_else(|| Error::Other("no telemetry snapshot yet".into()))?;
                Ok(Some(serde_json::to_value(snapshot)?))
            }
            Command::GetSceneList => {
                let summaries = self.config.scenes.read().summaries();
                Ok(Some(serde_json::to_value(summaries)?))
            }
            Command::GetServoConfig { channel } => match channel {
                Some(channel) => {
                    let address: ServoChannel = channel.parse()?;
                    let servo = self.config.servo.read();
                    let limits = servo.limits(&address)?;
                    Ok(Some(serde_json::to_value(limits)?))
                }
                None => {
                    let servo = self.config.servo.read();
                    Ok(Some(serde_json::to_value(&*servo)?))
                }
            },
            Command::SetServoConfig { channel, limits } => {
                let address: ServoChannel = channel.parse()?;
                self.config.set_channel_limits(address, limits)?;
                Ok(None)
            }
            Command::GetLinkStats => Ok(Some(serde_json::to_value(self.link.stats())?)),

            Command::GetAudioList => Ok(Some(serde_json::to_value(self.audio.clip_names())?)),
            Command::SetVolume { volume } => {
                self.audio.set_volume(volume);
                Ok(None)
            }
            Command::AudioStop => {
                self.audio.stop();
                Ok(None)
            }

            Command::ReloadConfig { name } => {
                self.config.reload(&name)?;
                Ok(None)
            }
        }
    }
}
