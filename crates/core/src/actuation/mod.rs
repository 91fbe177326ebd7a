mod simulated;

pub use simulated::{DriverCall, SimulatedDriver};

use crate::error::HardwareFault;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub const HEAD_POWER: u8 = 80;
pub const HEAD_RAMP: Duration = Duration::from_millis(500);
pub const TAIL_POWER: u8 = 80;
pub const TAIL_FLAP: Duration = Duration::from_millis(200);

/// Logical actuator functions of the figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Mouth,
    Head,
    Tail,
}

/// Physical motor ports. Port C is only populated on classic hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    A,
    B,
    C,
}

impl Port {
    pub(crate) fn index(self) -> usize {
        match self {
            Port::A => 0,
            Port::B => 1,
            Port::C => 2,
        }
    }
}

/// Where a logical channel is wired, and whether it runs the motor backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wiring {
    pub port: Port,
    pub reversed: bool,
}

/// True when the `classic` feature gives the tail its own motor.
pub const DEDICATED_TAIL: bool = cfg!(feature = "classic");

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Mouth, Channel::Head, Channel::Tail];

    /// Physical wiring, fixed at build time. Without a dedicated tail motor
    /// the tail is the head motor driven in reverse.
    pub const fn wiring(self) -> Wiring {
        match self {
            Channel::Mouth => Wiring { port: Port::A, reversed: false },
            Channel::Head => Wiring { port: Port::B, reversed: false },
            Channel::Tail if DEDICATED_TAIL => Wiring { port: Port::C, reversed: false },
            Channel::Tail => Wiring { port: Port::B, reversed: true },
        }
    }
}

/// Snapshot of one motor port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActuatorState {
    /// Deadline of a timed drive; `None` while held or idle.
    pub active_until: Option<Instant>,
    pub current_power: u8,
}

impl ActuatorState {
    pub fn is_active_at(&self, now: Instant) -> bool {
        self.current_power > 0 && self.active_until.is_none_or(|until| now < until)
    }
}

/// Exclusive owner of the motor ports.
///
/// `drive` blocks for the duration of the timed ramp. With `auto_brake` the
/// channel is braked afterwards; without it the channel stays energized until
/// an explicit `brake`. Braking an idle channel is a no-op.
pub trait ActuationDriver: Send + Sync {
    fn drive(
        &self,
        channel: Channel,
        power: u8,
        duration: Duration,
        auto_brake: bool,
    ) -> Result<(), HardwareFault>;

    fn brake(&self, channel: Channel) -> Result<(), HardwareFault>;

    fn is_active(&self, channel: Channel) -> bool;

    fn state(&self, channel: Channel) -> ActuatorState;

    /// Brakes every channel, logging instead of failing.
    fn stop_all(&self) {
        for channel in Channel::ALL {
            if let Err(e) = self.brake(channel) {
                error!(?channel, "failed to brake: {}", e);
            }
        }
    }
}

fn spawn_detached(name: &str, job: impl FnOnce() + Send + 'static) {
    if let Err(e) = std::thread::Builder::new().name(name.to_string()).spawn(job) {
        error!("failed to spawn {} task: {}", name, e);
    }
}

/// One fixed-duration tail flap on its own thread; never joined.
pub fn spawn_tail_flap(driver: &Arc<dyn ActuationDriver>, duration: Duration) {
    let driver = driver.clone();
    spawn_detached("tail-flap", move || {
        if let Err(e) = driver.drive(Channel::Tail, TAIL_POWER, duration, true) {
            warn!("tail flap failed: {}", e);
        }
    });
}

/// Ramps the head out and leaves it held until someone brakes it.
pub fn spawn_head_extend(driver: &Arc<dyn ActuationDriver>) {
    let driver = driver.clone();
    spawn_detached("head-hold", move || {
        debug!("extending head");
        if let Err(e) = driver.drive(Channel::Head, HEAD_POWER, HEAD_RAMP, false) {
            warn!("head extend failed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_wiring_follows_hardware_variant() {
        let tail = Channel::Tail.wiring();
        if DEDICATED_TAIL {
            assert_eq!(tail, Wiring { port: Port::C, reversed: false });
        } else {
            assert_eq!(tail, Wiring { port: Port::B, reversed: true });
        }
        assert_eq!(Channel::Mouth.wiring().port, Port::A);
    }

    #[test]
    fn held_state_stays_active_until_braked() {
        let now = Instant::now();
        let held = ActuatorState { active_until: None, current_power: 80 };
        assert!(held.is_active_at(now + Duration::from_secs(3600)));

        let timed = ActuatorState { active_until: Some(now + Duration::from_millis(10)), current_power: 50 };
        assert!(timed.is_active_at(now));
        assert!(!timed.is_active_at(now + Duration::from_millis(10)));
        assert!(!ActuatorState::default().is_active_at(now));
    }
}
