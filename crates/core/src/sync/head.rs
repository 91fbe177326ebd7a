use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A head extension relative to the song start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadMove {
    pub start: Duration,
    pub duration: Duration,
}

/// What the consumer must do to the head after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeadTick {
    /// The active window ended: brake the head.
    pub release: bool,
    /// A move fired: extend and hold for this long.
    pub extend: Option<Duration>,
}

/// Fires time-indexed head moves, one at a time.
///
/// A move whose start was missed still fires for whatever is left of its
/// window; a move whose whole window has already passed is dropped.
#[derive(Debug, Clone, Default)]
pub struct HeadScheduler {
    pending: VecDeque<HeadMove>,
    active_until: Option<Instant>,
}

impl HeadScheduler {
    pub fn new(mut moves: Vec<HeadMove>) -> Self {
        moves.sort_by_key(|m| m.start);
        Self {
            pending: moves.into(),
            active_until: None,
        }
    }

    pub fn is_extended(&self) -> bool {
        self.active_until.is_some()
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn tick(&mut self, now: Instant, start: Instant) -> HeadTick {
        let mut tick = HeadTick::default();
        if let Some(until) = self.active_until {
            if now < until {
                return tick;
            }
            self.active_until = None;
            tick.release = true;
        }

        let elapsed = now.saturating_duration_since(start);
        while let Some(next) = self.pending.front().copied() {
            if next.start > elapsed {
                break;
            }
            self.pending.pop_front();
            let end = next.start.saturating_add(next.duration);
            if end <= elapsed {
                debug!(start = ?next.start, "head move missed entirely, dropping");
                continue;
            }
            let hold = end - elapsed;
            let Some(until) = now.checked_add(hold) else {
                warn!(start = ?next.start, ?hold, "head move ends out of clock range, dropping");
                continue;
            };
            self.active_until = Some(until);
            tick.extend = Some(hold);
            break;
        }
        tick
    }

    /// Forgets the active window, e.g. after the head was braked externally.
    pub fn reset_active(&mut self) {
        self.active_until = None;
    }
}
