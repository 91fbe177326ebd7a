//! Timers that end a quiet turn and keep stuck motors from burning out.

use crate::actuation::{ActuationDriver, Channel, TAIL_FLAP, spawn_tail_flap};
use crate::config::{IdleConfig, MotorWatchdogConfig};
use crate::error::HardwareFault;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdleVerdict {
    Quiet,
    /// Counted idle time is running; `progress` goes from 0 to 1 at timeout.
    Impatient { counted: Duration, progress: f32 },
    TimedOut,
}

/// Ends a turn once neither the mic nor playback has been active for a while.
#[derive(Debug, Clone)]
pub struct IdleWatchdog {
    config: IdleConfig,
}

impl IdleWatchdog {
    pub fn new(config: IdleConfig) -> Self {
        Self { config }
    }

    pub fn assess(&self, idle: Duration) -> IdleVerdict {
        let counted = idle.saturating_sub(self.config.offset);
        if counted <= self.config.impatience_after {
            return IdleVerdict::Quiet;
        }
        if counted > self.config.timeout {
            return IdleVerdict::TimedOut;
        }
        let progress = (counted.as_secs_f32() / self.config.timeout.as_secs_f32()).min(1.0);
        IdleVerdict::Impatient { counted, progress }
    }

    pub fn progress_bar(&self, progress: f32) -> String {
        let width = self.config.bar_width;
        let filled = ((width as f32 * progress) as usize).min(width);
        format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
    }

    /// Polls until the turn goes inactive or times out. Returns true on
    /// timeout, which happens at most once per call.
    pub async fn run(
        &self,
        last_activity: impl Fn() -> Instant,
        mut active: watch::Receiver<bool>,
        driver: Arc<dyn ActuationDriver>,
    ) -> bool {
        debug!("idle watchdog started");
        let mut last_cue: Option<Instant> = None;
        while *active.borrow() {
            let now = Instant::now();
            match self.assess(now.saturating_duration_since(last_activity())) {
                IdleVerdict::Quiet => {}
                IdleVerdict::Impatient { counted, progress } => {
                    info!(
                        "{:?} timeout: {} {:.1}s",
                        self.config.timeout,
                        self.progress_bar(progress),
                        counted.as_secs_f32()
                    );
                    if last_cue.is_none_or(|at| now.duration_since(at) >= self.config.cue_interval) {
                        spawn_tail_flap(&driver, TAIL_FLAP);
                        last_cue = Some(now);
                    }
                }
                IdleVerdict::TimedOut => {
                    info!("no activity for {:?}, ending turn", self.config.timeout);
                    return true;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll) => {}
                changed = active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        false
    }
}

/// Force-brakes any channel that has been energized longer than the ceiling.
pub struct MotorWatchdog {
    config: MotorWatchdogConfig,
    driver: Arc<dyn ActuationDriver>,
    active_since: [Option<Instant>; 3],
}

impl MotorWatchdog {
    pub fn new(config: MotorWatchdogConfig, driver: Arc<dyn ActuationDriver>) -> Self {
        Self {
            config,
            driver,
            active_since: [None; 3],
        }
    }

    /// One sweep at `now`; returns the channels that were braked.
    pub fn check(&mut self, now: Instant) -> Vec<Channel> {
        let mut braked = Vec::new();
        for (i, channel) in Channel::ALL.into_iter().enumerate() {
            if !self.driver.is_active(channel) {
                self.active_since[i] = None;
                continue;
            }
            let since = *self.active_since[i].get_or_insert(now);
            let active_for = now.saturating_duration_since(since);
            if active_for <= self.config.ceiling {
                continue;
            }
            warn!("{}, braking", HardwareFault::Stuck { channel, active_for });
            if let Err(e) = self.driver.brake(channel) {
                warn!(?channel, "forced brake failed: {}", e);
            }
            self.active_since[i] = None;
            braked.push(channel);
        }
        braked
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            interval.tick().await;
            self.check(Instant::now());
        }
    }
}
