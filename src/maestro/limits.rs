//! Per-channel servo limits and addressing

use crate::error::{Error, Result};
use crate::link::DeviceId;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Hardware-legal servo pulse range in microseconds
pub const MIN_PULSE_US: u16 = 992;
pub const MAX_PULSE_US: u16 = 2000;

/// Channels per controller
pub const CHANNELS_PER_DEVICE: u8 = 18;

/// Address of one servo output: controller plus channel number
///
/// Rendered as `m1_ch0` .. `m2_ch17`; the parser also accepts the `d1_ch0`
/// spelling used by some clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServoChannel {
    pub device: DeviceId,
    pub channel: u8,
}

impl ServoChannel {
    pub fn new(device: DeviceId, channel: u8) -> Self {
        Self { device, channel }
    }
}

impl fmt::Display for ServoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dev = match self.device {
            DeviceId::Dev1 => 1,
            DeviceId::Dev2 => 2,
        };
        write!(f, "m{}_ch{}", dev, self.channel)
    }
}

impl FromStr for ServoChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        fn bad(s: &str) -> Error {
            Error::UnknownChannel(s.to_string())
        }
        let (dev_part, ch_part) = s.split_once('_').ok_or_else(|| bad(s))?;

        let device = match dev_part {
            "m1" | "d1" => DeviceId::Dev1,
            "m2" | "d2" => DeviceId::Dev2,
            _ => return Err(bad(s)),
        };
        let channel: u8 = ch_part
            .strip_prefix("ch")
            .ok_or_else(|| bad(s))?
            .parse()
            .map_err(|_| bad(s))?;
        if channel >= CHANNELS_PER_DEVICE {
            return Err(bad(s));
        }
        Ok(ServoChannel { device, channel })
    }
}

impl Serialize for ServoChannel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServoChannel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ChannelVisitor;

        impl<'de> Visitor<'de> for ChannelVisitor {
            type Value = ServoChannel;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a servo channel like \"m1_ch0\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ServoChannel, E> {
                v.parse().map_err(|_| E::custom(format!("invalid servo channel: {}", v)))
            }
        }

        deserializer.deserialize_str(ChannelVisitor)
    }
}

/// Soft limits and metadata for one servo channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLimits {
    pub min_us: u16,
    pub max_us: u16,
    pub home_us: u16,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel: Option<u8>,
}

impl ChannelLimits {
    /// Validation problems for this entry, empty when well-formed
    pub fn problems(&self, channel: &ServoChannel) -> Vec<String> {
        let mut problems = Vec::new();
        if self.min_us < MIN_PULSE_US || self.max_us > MAX_PULSE_US {
            problems.push(format!(
                "{}: limits {}..{} outside hardware range {}..{}",
                channel, self.min_us, self.max_us, MIN_PULSE_US, MAX_PULSE_US
            ));
        }
        if self.min_us > self.max_us {
            problems.push(format!(
                "{}: min_us {} above max_us {}",
                channel, self.min_us, self.max_us
            ));
        }
        if self.home_us < self.min_us || self.home_us > self.max_us {
            problems.push(format!(
                "{}: home_us {} outside {}..{}",
                channel, self.home_us, self.min_us, self.max_us
            ));
        }
        problems
    }

    /// Check a commanded target against this channel's soft limits
    ///
    /// Violations are rejected, never clamped: the caller must see that
    /// their intent was refused.
    pub fn check_target(&self, channel: &ServoChannel, target_us: u16) -> Result<()> {
        if target_us < self.min_us || target_us > self.max_us {
            return Err(Error::OutOfRange(format!(
                "{}: target {} us outside {}..{} us",
                channel, target_us, self.min_us, self.max_us
            )));
        }
        Ok(())
    }
}

/// The full per-channel servo configuration (`servo_config.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServoConfig {
    pub channels: BTreeMap<ServoChannel, ChannelLimits>,
}

impl ServoConfig {
    pub fn limits(&self, channel: &ServoChannel) -> Result<&ChannelLimits> {
        self.channels
            .get(channel)
            .ok_or_else(|| Error::UnknownChannel(channel.to_string()))
    }

    /// All validation problems across the config; empty means valid
    pub fn problems(&self) -> Vec<String> {
        self.channels
            .iter()
            .flat_map(|(channel, limits)| limits.problems(channel))
            .collect()
    }
}
