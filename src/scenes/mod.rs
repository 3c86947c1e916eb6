//! Scene catalog
//!
//! A scene is a named, time-bounded program of synchronized servo moves with
//! an optional audio cue and optional onboard-script triggers. The catalog
//! loads from `scenes_config.json`, is immutable within a run, and is
//! swapped atomically on reload.

mod engine;

pub use engine::SceneEngine;

use crate::maestro::{ServoChannel, ServoConfig};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Audio cue played `delay_s` seconds into the scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioCue {
    pub clip: String,
    #[serde(default)]
    pub delay_s: f64,
}

/// Onboard script subroutines started at scene dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneScripts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev1: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev2: Option<u8>,
}

/// One servo's move within a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoMove {
    pub target: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<u8>,
}

/// A declarative scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub label: String,
    pub duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioCue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts: Option<SceneScripts>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servos: BTreeMap<ServoChannel, ServoMove>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}

/// A compact catalog entry for `get_scene_list` replies
#[derive(Debug, Clone, Serialize)]
pub struct SceneSummary {
    pub name: String,
    pub label: String,
    pub duration_s: f64,
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    pub has_audio: bool,
}

/// The scene catalog (`scenes_config.json`), keyed by scene name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneCatalog {
    pub scenes: BTreeMap<String, Scene>,
}

impl SceneCatalog {
    pub fn get(&self, name: &str) -> Option<&Scene> {
        self.scenes.get(name)
    }

    pub fn summaries(&self) -> Vec<SceneSummary> {
        self.scenes
            .iter()
            .map(|(name, scene)| SceneSummary {
                name: name.clone(),
                label: scene.label.clone(),
                duration_s: scene.duration_s,
                categories: scene.categories.clone(),
                emoji: scene.emoji.clone(),
                has_audio: scene.audio.is_some(),
            })
            .collect()
    }

    /// Scene names carrying the given category (case-insensitive)
    pub fn by_category(&self, category: &str) -> Vec<String> {
        self.scenes
            .iter()
            .filter(|(_, scene)| {
                scene
                    .categories
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(category))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Pick one scene of the category at random
    pub fn random_by_category(&self, category: &str) -> Option<String> {
        let candidates = self.by_category(category);
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    /// Validation problems across the catalog against the servo config;
    /// empty means valid
    pub fn problems(&self, servo_config: &ServoConfig) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, scene) in &self.scenes {
            if scene.duration_s <= 0.0 {
                problems.push(format!("{}: duration must be positive", name));
            }
            if let Some(audio) = &scene.audio {
                if audio.delay_s < 0.0 {
                    problems.push(format!("{}: audio delay must not be negative", name));
                }
                if audio.delay_s > scene.duration_s {
                    problems.push(format!(
                        "{}: audio delay {}s exceeds duration {}s",
                        name, audio.delay_s, scene.duration_s
                    ));
                }
            }
            for (channel, servo_move) in &scene.servos {
                match servo_config.limits(channel) {
                    Ok(limits) => {
                        if limits.check_target(channel, servo_move.target).is_err() {
                            problems.push(format!(
                                "{}: {} target {} us outside {}..{} us",
                                name, channel, servo_move.target, limits.min_us, limits.max_us
                            ));
                        }
                    }
                    Err(_) => {
                        problems.push(format!("{}: unknown channel {}", name, channel));
                    }
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maestro::ChannelLimits;

    fn channel_limits() -> ServoConfig {
        let mut config = ServoConfig::default();
        config.channels.insert(
            "m1_ch0".parse().unwrap(),
            ChannelLimits {
                min_us: 1000,
                max_us: 2000,
                home_us: 1500,
                name: "head_pan".into(),
                accel: None,
            },
        );
        config
    }

    fn sample_scene() -> Scene {
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
            label: "Happy Beep".into(),
            duration_s: 2.5,
            audio: Some(AudioCue {
                clip: "beep".into(),
                delay_s: 0.5,
            }),
            scripts: Some(SceneScripts {
                dev1: Some(3),
                dev2: None,
            }),
            servos,
            categories: vec!["Happy".into()],
            emoji: Some("🤖".into()),
        }
    }

    #[test]
    fn catalog_round_trips_through_json() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("happy_beep".into(), sample_scene());
        let json = serde_json::to_string_pretty(&catalog).unwrap();
        let parsed: SceneCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, catalog);
    }

    #[test]
    fn valid_scene_has_no_problems() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("happy_beep".into(), sample_scene());
        assert!(catalog.problems(&channel_limits()).is_empty());
    }

    #[test]
    fn unknown_channel_is_flagged() {
        let mut scene = sample_scene();
        scene.servos.insert(
            "m2_ch9".parse().unwrap(),
            ServoMove {
                target: 1500,
                speed: None,
                acceleration: None,
            },
        );
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("bad".into(), scene);
        let problems = catalog.problems(&channel_limits());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("unknown channel"));
    }

    #[test]
    fn audio_delay_beyond_duration_is_flagged() {
        let mut scene = sample_scene();
        scene.audio = Some(AudioCue {
            clip: "beep".into(),
            delay_s: 3.0,
        });
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("late_audio".into(), scene);
        let problems = catalog.problems(&channel_limits());
        assert!(problems.iter().any(|p| p.contains("audio delay")));
    }

    #[test]
    fn out_of_limit_target_is_flagged() {
        let mut scene = sample_scene();
        scene.servos.insert(
            "m1_ch0".parse().unwrap(),
            ServoMove {
                target: 2100,
                speed: None,
                acceleration: None,
            },
        );
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("too_far".into(), scene);
        assert!(!catalog.problems(&channel_limits()).is_empty());
    }

    #[test]
    fn category_lookup_is_case_insensitive() {
        let mut catalog = SceneCatalog::default();
        catalog.scenes.insert("happy_beep".into(), sample_scene());
        assert_eq!(catalog.by_category("happy"), vec!["happy_beep"]);
        assert!(catalog.by_category("sad").is_empty());
        assert_eq!(
            catalog.random_by_category("HAPPY"),
            Some("happy_beep".to_string())
        );
    }
}
