use super::{Envelope, interp};
use crate::actuation::{ActuationDriver, Channel};
use crate::config::MouthConfig;
use crate::error::HardwareFault;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MouthAction {
    /// Silence with no open window: the mouth was braked shut.
    Close,
    Flap { power: u8, duration: Duration },
    /// Debounced, or loud enough to keep open but not to flap.
    Hold,
}

/// Envelope follower that turns speech chunks into mouth flaps.
pub struct EnvelopeMouthSync {
    config: MouthConfig,
    smoothed: f32,
    last_flap: Option<Instant>,
    open_until: Option<Instant>,
}

impl EnvelopeMouthSync {
    pub fn new(config: MouthConfig) -> Self {
        Self {
            config,
            smoothed: 0.0,
            last_flap: None,
            open_until: None,
        }
    }

    /// Decides and applies the mouth command for one chunk.
    pub fn on_chunk(
        &mut self,
        pcm: &[i16],
        chunk_span: Duration,
        now: Instant,
        driver: &dyn ActuationDriver,
    ) -> Result<MouthAction, HardwareFault> {
        let action = self.assess(pcm, chunk_span, now);
        match action {
            MouthAction::Close => driver.brake(Channel::Mouth)?,
            MouthAction::Flap { power, duration } => {
                driver.drive(Channel::Mouth, power, duration, false)?
            }
            MouthAction::Hold => {}
        }
        Ok(action)
    }

    pub fn assess(&mut self, pcm: &[i16], chunk_span: Duration, now: Instant) -> MouthAction {
        if pcm.is_empty() {
            return MouthAction::Hold;
        }
        let envelope = Envelope::of(pcm);
        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        self.smoothed = alpha * envelope.rms + (1.0 - alpha) * self.smoothed;
        let level = self.smoothed;
        trace!(rms = envelope.rms, peak = envelope.peak, level, "mouth envelope");

        let window_open = self.open_until.is_some_and(|until| now < until);
        if level < self.config.threshold / 2.0 && !window_open {
            self.open_until = None;
            return MouthAction::Close;
        }
        if level <= self.config.threshold {
            return MouthAction::Hold;
        }
        if self
            .last_flap
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.min_flap_gap)
        {
            return MouthAction::Hold;
        }

        let normalized = (level / 32768.0).clamp(0.0, 1.0);
        let range = self.config.normalized_range;
        let power = interp(normalized, range, self.config.power_range).clamp(0.0, 100.0) as u8;
        let (min_ms, _) = self.config.duration_range_ms;
        let span_ms = chunk_span.as_secs_f32() * 1000.0;
        let duration_ms = interp(normalized, range, self.config.duration_range_ms)
            .max(min_ms)
            .min(span_ms);
        let duration = Duration::from_secs_f32(duration_ms / 1000.0);

        self.last_flap = Some(now);
        self.open_until = Some(now + duration);
        MouthAction::Flap { power, duration }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::SimulatedDriver;

    fn constant(amplitude: i16) -> Vec<i16> {
        vec![amplitude; 1200]
    }

    #[test]
    fn quiet_end_of_range_flaps_at_minimum() {
        // 0.005 of full scale sits below the default threshold, so lower it.
        let mut sync = EnvelopeMouthSync::new(MouthConfig {
            threshold: 100.0,
            ..MouthConfig::default()
        });
        let driver = SimulatedDriver::recording();
        let action = sync
            .on_chunk(&constant(164), Duration::from_millis(50), Instant::now(), &driver)
            .unwrap();

        let drives = driver.drives(Channel::Mouth);
        assert_eq!(drives.len(), 1);
        let (power, duration, auto_brake) = drives[0];
        assert_eq!(power, 25);
        assert_eq!(duration.as_millis(), 15);
        assert!(!auto_brake);
        assert!(matches!(action, MouthAction::Flap { power: 25, .. }));
    }

    #[test]
    fn loud_end_of_range_flaps_at_maximum() {
        let mut sync = EnvelopeMouthSync::new(MouthConfig::default());
        let driver = SimulatedDriver::recording();
        sync.on_chunk(&constant(4916), Duration::from_millis(100), Instant::now(), &driver)
            .unwrap();

        let drives = driver.drives(Channel::Mouth);
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].0, 100);
        assert_eq!(drives[0].1.as_millis(), 70);
    }

    #[test]
    fn flap_duration_is_clamped_to_chunk_span() {
        let mut sync = EnvelopeMouthSync::new(MouthConfig::default());
        let driver = SimulatedDriver::recording();
        sync.on_chunk(&constant(4916), Duration::from_millis(50), Instant::now(), &driver)
            .unwrap();
        assert_eq!(driver.drives(Channel::Mouth)[0].1.as_millis(), 50);
    }

    #[test]
    fn silence_brakes_without_driving() {
        let mut sync = EnvelopeMouthSync::new(MouthConfig::default());
        let driver = SimulatedDriver::recording();
        let action = sync
            .on_chunk(&constant(300), Duration::from_millis(50), Instant::now(), &driver)
            .unwrap();

        assert_eq!(action, MouthAction::Close);
        assert_eq!(driver.brakes(Channel::Mouth), 1);
        assert!(driver.drives(Channel::Mouth).is_empty());
    }

    #[test]
    fn silence_inside_open_window_does_not_close() {
        let mut sync = EnvelopeMouthSync::new(MouthConfig::default());
        let now = Instant::now();
        assert!(matches!(
            sync.assess(&constant(4000), Duration::from_millis(50), now),
            MouthAction::Flap { .. }
        ));
        assert_eq!(
            sync.assess(&constant(0), Duration::from_millis(50), now + Duration::from_millis(5)),
            MouthAction::Hold
        );
    }

    #[test]
    fn flaps_respect_minimum_gap() {
        let mut sync = EnvelopeMouthSync::new(MouthConfig::default());
        let now = Instant::now();
        let span = Duration::from_millis(50);
        assert!(matches!(sync.assess(&constant(4000), span, now), MouthAction::Flap { .. }));
        assert_eq!(
            sync.assess(&constant(4000), span, now + Duration::from_millis(50)),
            MouthAction::Hold
        );
        assert!(matches!(
            sync.assess(&constant(4000), span, now + Duration::from_millis(100)),
            MouthAction::Flap { .. }
        ));
    }
}
