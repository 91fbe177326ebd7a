use super::{ActuationDriver, ActuatorState, Channel, Port};
use crate::error::HardwareFault;
use crate::lock;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Drive {
        channel: Channel,
        power: u8,
        duration: Duration,
        auto_brake: bool,
    },
    Brake(Channel),
}

#[derive(Debug, Default, Clone, Copy)]
struct PortState {
    state: ActuatorState,
    reversed: bool,
    /// Bumped on every drive/brake so a finished ramp only brakes its own drive.
    generation: u64,
}

/// Motor driver without hardware: tracks port state and logs every command.
///
/// In real-time mode `drive` sleeps through the ramp like a physical driver.
/// The recording mode returns immediately and keeps a call log, which is what
/// the tests use to observe the playback consumer.
pub struct SimulatedDriver {
    realtime: bool,
    ports: Mutex<[PortState; 3]>,
    calls: Mutex<Vec<DriverCall>>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self {
            realtime: true,
            ports: Mutex::new([PortState::default(); 3]),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn recording() -> Self {
        Self {
            realtime: false,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.calls).clone()
    }

    pub fn drives(&self, channel: Channel) -> Vec<(u8, Duration, bool)> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                DriverCall::Drive { channel: c, power, duration, auto_brake } if *c == channel => {
                    Some((*power, *duration, *auto_brake))
                }
                _ => None,
            })
            .collect()
    }

    pub fn brakes(&self, channel: Channel) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| **call == DriverCall::Brake(channel))
            .count()
    }

    /// Whether the port behind `channel` currently spins backwards.
    pub fn is_reversed(&self, channel: Channel) -> bool {
        lock(&self.ports)[channel.wiring().port.index()].reversed
    }

    fn port(channel: Channel) -> Port {
        channel.wiring().port
    }
}

impl ActuationDriver for SimulatedDriver {
    fn drive(
        &self,
        channel: Channel,
        power: u8,
        duration: Duration,
        auto_brake: bool,
    ) -> Result<(), HardwareFault> {
        let power = power.min(100);
        lock(&self.calls).push(DriverCall::Drive { channel, power, duration, auto_brake });

        let wiring = channel.wiring();
        let now = Instant::now();
        let generation = {
            let mut ports = lock(&self.ports);
            let port = &mut ports[wiring.port.index()];
            port.generation += 1;
            port.reversed = wiring.reversed;
            port.state = ActuatorState {
                active_until: auto_brake.then(|| now + duration),
                current_power: power,
            };
            port.generation
        };
        debug!(?channel, power, ?duration, auto_brake, "drive");

        if self.realtime {
            std::thread::sleep(duration);
            if auto_brake {
                let mut ports = lock(&self.ports);
                let port = &mut ports[wiring.port.index()];
                if port.generation == generation {
                    port.state = ActuatorState::default();
                }
            }
        }
        Ok(())
    }

    fn brake(&self, channel: Channel) -> Result<(), HardwareFault> {
        lock(&self.calls).push(DriverCall::Brake(channel));
        let mut ports = lock(&self.ports);
        let port = &mut ports[Self::port(channel).index()];
        if port.state.current_power > 0 {
            debug!(?channel, "brake");
        }
        port.generation += 1;
        port.state = ActuatorState::default();
        Ok(())
    }

    fn is_active(&self, channel: Channel) -> bool {
        self.state(channel).is_active_at(Instant::now())
    }

    fn state(&self, channel: Channel) -> ActuatorState {
        lock(&self.ports)[Self::port(channel).index()].state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brake_on_idle_channel_is_a_noop() {
        let driver = SimulatedDriver::recording();
        assert!(driver.brake(Channel::Mouth).is_ok());
        assert!(driver.brake(Channel::Mouth).is_ok());
        assert!(!driver.is_active(Channel::Mouth));
        driver.stop_all();
        assert_eq!(driver.brakes(Channel::Head), 1);
    }

    #[test]
    fn held_drive_stays_active_until_brake() {
        let driver = SimulatedDriver::recording();
        driver
            .drive(Channel::Head, 80, Duration::from_millis(500), false)
            .unwrap();
        assert!(driver.is_active(Channel::Head));
        assert_eq!(driver.state(Channel::Head).current_power, 80);

        driver.brake(Channel::Head).unwrap();
        assert!(!driver.is_active(Channel::Head));
    }

    #[test]
    fn realtime_auto_brake_releases_after_ramp() {
        let driver = SimulatedDriver::new();
        driver
            .drive(Channel::Mouth, 50, Duration::from_millis(5), true)
            .unwrap();
        assert!(!driver.is_active(Channel::Mouth));
        assert_eq!(driver.drives(Channel::Mouth), vec![(50, Duration::from_millis(5), true)]);
    }

    #[test]
    fn two_motor_tail_reverses_head_port() {
        let driver = SimulatedDriver::recording();
        driver
            .drive(Channel::Tail, 80, Duration::from_millis(200), true)
            .unwrap();
        assert!(driver.is_active(Channel::Tail));
        assert_eq!(driver.is_reversed(Channel::Tail), !super::super::DEDICATED_TAIL);
    }
}
