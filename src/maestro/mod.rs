//! Maestro-compatible servo controller driver
//!
//! Two controller boards share one serial link; each gets a
//! [`ServoController`] instance speaking the compact wire protocol through
//! the link scheduler. The driver validates every target against the
//! per-channel soft limits before anything reaches the wire — violations are
//! rejected, never clamped, so user intent stays visible.

pub mod protocol;

mod limits;

pub use limits::{
    ChannelLimits, ServoChannel, ServoConfig, CHANNELS_PER_DEVICE, MAX_PULSE_US, MIN_PULSE_US,
};

use crate::error::{Error, Result};
use crate::link::{BatchTarget, DeviceId, LinkDevice, LinkScheduler, Priority, Request, Ticket};
use crate::safety::StateView;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One servo move inside a scene dispatch
#[derive(Debug, Clone, Copy)]
pub struct MoveSpec {
    pub channel: u8,
    pub target_us: u16,
    pub speed: Option<u8>,
    pub accel: Option<u8>,
}

/// Driver for one servo controller on the shared link
pub struct ServoController {
    device: DeviceId,
    device_number: u8,
    link: Arc<LinkScheduler>,
    config: Arc<RwLock<ServoConfig>>,
    state: StateView,
    /// Last successfully commanded target per channel, in microseconds
    cache: Mutex<BTreeMap<u8, u16>>,
}

impl ServoController {
    pub fn new(
        device: DeviceId,
        device_number: u8,
        link: Arc<LinkScheduler>,
        config: Arc<RwLock<ServoConfig>>,
        state: StateView,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            device_number,
            link,
            config,
            state,
            cache: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn address(&self, channel: u8) -> ServoChannel {
        ServoChannel::new(self.device, channel)
    }

    /// Validate a target against soft limits without touching hardware
    pub fn validate_target(&self, channel: u8, target_us: u16) -> Result<()> {
        let address = self.address(channel);
        let config = self.config.read();
        config.limits(&address)?.check_target(&address, target_us)
    }

    /// Command one channel to a target pulse width
    ///
    /// The request is coalescable: the scheduler may merge it with queued
    /// targets for this device whose channels form a contiguous run into
    /// one compound frame.
    pub fn set_target(&self, channel: u8, target_us: u16, priority: Priority) -> Result<()> {
        let address = self.address(channel);
        self.state.check_servo_write(&address)?;
        self.validate_target(channel, target_us)?;

        let frame = protocol::set_target(self.device_number, channel, target_us);
        let (request, ticket) = Request::new(self.device, priority, frame);
        let request = request.with_batch(vec![BatchTarget { channel, target_us }]);
        self.link.submit(request)?;
        ticket.wait_timeout(self.link.request_timeout())?;

        self.cache.lock().insert(channel, target_us);
        log::debug!("{}: target {} us", address, target_us);
        Ok(())
    }

    pub fn set_speed(&self, channel: u8, speed: u8) -> Result<()> {
        let address = self.address(channel);
        self.state.check_servo_write(&address)?;
        let frame = protocol::set_speed(self.device_number, channel, speed);
        self.fire(frame, Priority::Normal)
    }

    pub fn set_acceleration(&self, channel: u8, accel: u8) -> Result<()> {
        let address = self.address(channel);
        self.state.check_servo_write(&address)?;
        let frame = protocol::set_acceleration(self.device_number, channel, accel);
        self.fire(frame, Priority::Normal)
    }

    /// Last commanded target, polling the device on a cache miss
    pub fn get_position(&self, channel: u8) -> Result<u16> {
        if let Some(cached) = self.cache.lock().get(&channel).copied() {
            return Ok(cached);
        }

        let frame = protocol::get_position(self.device_number, channel);
        let (request, ticket) = Request::new(self.device, Priority::Background, frame);
        self.link
            .submit(request.with_reply(protocol::POSITION_REPLY_LEN))?;
        let reply = ticket.wait_timeout(self.link.reply_timeout())?;
        let position = protocol::decode_position(&reply)
            .ok_or_else(|| Error::Other(format!("bad position reply: {:?}", reply)))?;
        self.cache.lock().insert(channel, position);
        Ok(position)
    }

    /// Dispatch a set of scene moves
    ///
    /// The whole set is validated first so a single bad target rejects the
    /// dispatch before any frame is queued. Speed and acceleration frames go
    /// out ahead of the coalescable target requests, matching device
    /// semantics (speed applies to the next target). Targets on
    /// channel-adjacent moves may merge into compound frames downstream;
    /// runs with channel gaps ship as separate frames.
    pub fn set_targets(&self, moves: &[MoveSpec], priority: Priority, timeout: Duration) -> Result<()> {
        for spec in moves {
            let address = self.address(spec.channel);
            self.state.check_servo_write(&address)?;
            self.validate_target(spec.channel, spec.target_us)?;
        }

        let mut tickets: Vec<Ticket> = Vec::with_capacity(moves.len());
        for spec in moves {
            if let Some(speed) = spec.speed {
                let frame = protocol::set_speed(self.device_number, spec.channel, speed);
                let (request, _ticket) = Request::new(self.device, priority, frame);
                self.link.submit(request)?;
            }
            if let Some(accel) = spec.accel {
                let frame = protocol::set_acceleration(self.device_number, spec.channel, accel);
                let (request, _ticket) = Request::new(self.device, priority, frame);
                self.link.submit(request)?;
            }
            let frame = protocol::set_target(self.device_number, spec.channel, spec.target_us);
            let (request, ticket) = Request::new(self.device, priority, frame);
            let request = request.with_batch(vec![BatchTarget {
                channel: spec.channel,
                target_us: spec.target_us,
            }]);
            self.link.submit(request)?;
            tickets.push(ticket);
        }

        for (ticket, spec) in tickets.into_iter().zip(moves) {
            ticket.wait_timeout(timeout)?;
            self.cache.lock().insert(spec.channel, spec.target_us);
        }
        Ok(())
    }

    /// Start a subroutine in the device's onboard script
    pub fn run_subscript(&self, subscript: u8) -> Result<()> {
        let frame = protocol::run_subscript(self.device_number, subscript);
        self.fire(frame, Priority::Normal)
    }

    /// Emergency-class stop: cancels this device's queued writes and halts
    /// any running script
    ///
    /// Deliberately not gated on system state — this is the action the
    /// supervisor takes when entering Emergency.
    pub fn stop_all(&self) -> Result<()> {
        self.link.cancel_pending(self.device);
        let frame = protocol::stop_script(self.device_number);
        let (request, ticket) = Request::new(self.device, Priority::Emergency, frame);
        self.link.submit(request)?;
        ticket.wait_timeout(self.link.request_timeout())?;
        log::info!("{}: stop_all dispatched", self.device);
        Ok(())
    }

    /// Snapshot of cached positions for telemetry, keyed by channel name
    pub fn positions(&self) -> BTreeMap<String, u16> {
        self.cache
            .lock()
            .iter()
            .map(|(channel, us)| (self.address(*channel).to_string(), *us))
            .collect()
    }

    fn fire(&self, frame: Vec<u8>, priority: Priority) -> Result<()> {
        let (request, ticket) = Request::new(self.device, priority, frame);
        self.link.submit(request)?;
        ticket.wait_timeout(self.link.request_timeout())?;
        Ok(())
    }
}

/// Compound-frame encoder registered with the link scheduler
pub struct ServoBatchEncoder {
    device: DeviceId,
    device_number: u8,
}

impl ServoBatchEncoder {
    pub fn new(device: DeviceId, device_number: u8) -> Arc<Self> {
        Arc::new(Self {
            device,
            device_number,
        })
    }
}

impl LinkDevice for ServoBatchEncoder {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn encode_batch(&self, targets: &[BatchTarget]) -> Result<Vec<u8>> {
        protocol::set_multiple_targets(self.device_number, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{AlertSet, EventBus};
    use crate::link::{LinkConfig, TransportFactory};
    use crate::safety::{PowerThresholds, Supervisor};
    use crate::transport::{MockTransport, Transport};
    use std::collections::HashSet;

    struct Rig {
        mock: MockTransport,
        link: Arc<LinkScheduler>,
        supervisor: Supervisor,
        servo: Arc<ServoController>,
    }

    fn rig() -> Rig {
        let mock = MockTransport::new();
        let factory_mock = mock.clone();
        let factory: TransportFactory = Box::new(move || {
            let t: Box<dyn Transport> = Box::new(factory_mock.clone());
            Ok(t)
        });
        let bus = EventBus::new();
        let link = LinkScheduler::new(factory, LinkConfig::default(), bus.clone()).unwrap();

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
        config.channels.insert(
            "m1_ch1".parse().unwrap(),
            ChannelLimits {
                min_us: 1100,
                max_us: 1900,
                home_us: 1400,
                name: "head_tilt".into(),
                accel: Some(20),
            },
        );
        let config = Arc::new(RwLock::new(config));

        let alerts = AlertSet::new(bus.clone());
        let supervisor =
            Supervisor::new(PowerThresholds::default(), HashSet::new(), bus, alerts);
        let servo = ServoController::new(
            DeviceId::Dev1,
            12,
            Arc::clone(&link),
            config,
            supervisor.view(),
        );
        link.register_device(ServoBatchEncoder::new(DeviceId::Dev1, 12));

        Rig {
            mock,
            link,
            supervisor,
            servo,
        }
    }

    #[test]
    fn out_of_range_target_writes_nothing() {
        let r = rig();
        let err = r.servo.set_target(0, 2001, Priority::Normal).unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(r.mock.written_frames().is_empty());
        r.link.shutdown();
    }

    #[test]
    fn boundary_target_accepted_and_cached() {
        let r = rig();
        r.servo.set_target(0, 2000, Priority::Normal).unwrap();
        assert_eq!(r.servo.get_position(0).unwrap(), 2000);
        assert_eq!(
            r.mock.written_frames(),
            vec![protocol::set_target(12, 0, 2000)]
        );
        r.link.shutdown();
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let r = rig();
        let err = r.servo.set_target(9, 1500, Priority::Normal).unwrap_err();
        assert!(matches!(err, Error::UnknownChannel(_)));
        r.link.shutdown();
    }

    #[test]
    fn get_position_polls_on_cache_miss() {
        let r = rig();
        // Reply: 1500 us = 6000 quarter-us, little-endian
        r.mock.inject_read(&6000u16.to_le_bytes());
        assert_eq!(r.servo.get_position(1).unwrap(), 1500);
        // Second read comes from cache; no further frames
        let frames_before = r.mock.written_frames().len();
        assert_eq!(r.servo.get_position(1).unwrap(), 1500);
        assert_eq!(r.mock.written_frames().len(), frames_before);
        r.link.shutdown();
    }

    #[test]
    fn emergency_blocks_targets_but_not_stop_all() {
        let r = rig();
        r.supervisor.request_emergency("test");
        let err = r.servo.set_target(0, 1500, Priority::Normal).unwrap_err();
        assert!(matches!(err, Error::StateForbidsWrite));
        r.servo.stop_all().unwrap();
        assert_eq!(r.mock.written_frames(), vec![protocol::stop_script(12)]);
        r.link.shutdown();
    }

    #[test]
    fn scene_dispatch_validates_whole_set_first() {
        let r = rig();
        let moves = [
            MoveSpec { channel: 0, target_us: 1500, speed: Some(40), accel: None },
            MoveSpec { channel: 1, target_us: 2050, speed: None, accel: None },
        ];
        let err = r
            .servo
            .set_targets(&moves, Priority::Normal, Duration::from_millis(250))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(r.mock.written_frames().is_empty());
        r.link.shutdown();
    }

    #[test]
    fn scene_dispatch_sends_speed_before_target() {
        let r = rig();
        let moves = [MoveSpec {
            channel: 1,
            target_us: 1400,
            speed: Some(30),
            accel: Some(15),
        }];
        r.servo
            .set_targets(&moves, Priority::Normal, Duration::from_millis(250))
            .unwrap();
        let frames = r.mock.written_frames();
        assert_eq!(frames[0], protocol::set_speed(12, 1, 30));
        assert_eq!(frames[1], protocol::set_acceleration(12, 1, 15));
        // Depending on worker timing the lone target ships as a plain
        // set-target frame or a one-element compound frame; both byte
        // layouts are exact and legal.
        let single = protocol::set_target(12, 1, 1400);
        let compound = protocol::set_multiple_targets(
            12,
            &[BatchTarget { channel: 1, target_us: 1400 }],
        )
        .unwrap();
        let last = frames.last().unwrap();
        assert!(
            *last == single || *last == compound,
            "unexpected target frame: {:?}",
            last
        );
        r.link.shutdown();
    }
}
