//! Error types for YantraIO
//!
//! # Error Recovery Strategies
//!
//! ## Rejections (No Side Effects)
//!
//! - **`OutOfRange`**: The request violated a validated domain (servo pulse
//!   width, stepper target, scene address). Nothing was written to hardware;
//!   correct the request and resubmit.
//!
//! - **`Busy` / `SceneBusy`**: A conflicting operation is active. Wait for it
//!   to finish or cancel it first.
//!
//! - **`StateForbidsScene` / `StateForbidsWrite`**: The safety supervisor is
//!   not in `Normal` state. Clear the emergency or failsafe condition first.
//!
//! - **`NotHomed` / `MotorDisabled`**: Stepper preconditions not met. Home or
//!   enable the motor before commanding motion.
//!
//! ## Transport Errors (Link Layer Handles Retry)
//!
//! - **`TransientIo`**: A read or write timed out or returned short. The link
//!   scheduler retries these with backoff; callers never see this directly
//!   unless they bypass the scheduler.
//!
//! - **`TransportFailed`**: Retries were exhausted for one request. The link
//!   itself is still considered healthy.
//!
//! - **`TransportDown`**: The serial device failed fatally. All pending
//!   requests fail with this error and the scheduler quarantines the link,
//!   attempting to reopen it once per second. Submissions fail fast until
//!   the link recovers.
//!
//! ## Faults (Require Operator Action)
//!
//! - **`HomingTimeout`**: Limit switch never asserted within the homing step
//!   budget. The stepper enters `Faulted`; check the mechanism, then
//!   `clear_fault` and re-home.
//!
//! - **`LimitUnexpected`**: Limit switch asserted during a normal move. Same
//!   recovery as above.
//!
//! ## Configuration Errors (Fix and Reload)
//!
//! - **`ConfigInvalid`**: A config file failed validation. The previous
//!   configuration stays active; the variant carries every problem found.

use thiserror::Error;

/// Errors that can occur in YantraIO
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("scene already playing: {0}")]
    SceneBusy(String),

    #[error("system state forbids scene start")]
    StateForbidsScene,

    #[error("system state forbids actuator write")]
    StateForbidsWrite,

    #[error("deadline expired before completion")]
    Timeout,

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("transport failed after retries")]
    TransportFailed,

    #[error("transport down, link quarantined")]
    TransportDown,

    #[error("stepper not homed")]
    NotHomed,

    #[error("stepper motor disabled")]
    MotorDisabled,

    #[error("homing timed out before limit switch asserted")]
    HomingTimeout,

    #[error("limit switch asserted during move")]
    LimitUnexpected,

    #[error("config invalid: {}", .0.join("; "))]
    ConfigInvalid(Vec<String>),

    #[error("audio clip not found: {0}")]
    AudioMissing(String),

    #[error("unknown scene: {0}")]
    UnknownScene(String),

    #[error("unknown servo channel: {0}")]
    UnknownChannel(String),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("thread panic")]
    ThreadPanic,

    #[error("daemon shutting down")]
    Shutdown,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short machine-readable kind string attached to command replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::OutOfRange(_) => "out_of_range",
            Error::Busy(_) => "busy",
            Error::SceneBusy(_) => "scene_busy",
            Error::StateForbidsScene => "state_forbids_scene",
            Error::StateForbidsWrite => "state_forbids_write",
            Error::Timeout => "timeout",
            Error::TransientIo(_) => "transient_io",
            Error::TransportFailed => "transport_failed",
            Error::TransportDown => "transport_down",
            Error::NotHomed => "not_homed",
            Error::MotorDisabled => "motor_disabled",
            Error::HomingTimeout => "homing_timeout",
            Error::LimitUnexpected => "limit_unexpected",
            Error::ConfigInvalid(_) => "config_invalid",
            Error::AudioMissing(_) => "audio_missing",
            Error::UnknownScene(_) => "unknown_scene",
            Error::UnknownChannel(_) => "unknown_channel",
            Error::Serial(_) => "serial",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::ThreadPanic => "thread_panic",
            Error::Shutdown => "shutdown",
            Error::Other(_) => "other",
        }
    }

    /// Whether the link scheduler should retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
