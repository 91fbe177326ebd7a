use crate::actuation::{ActuationDriver, Channel, HEAD_POWER, HEAD_RAMP, TAIL_FLAP, TAIL_POWER};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const FIRST_TARGET: std::ops::Range<usize> = 150_000..300_000;
const NEXT_TARGET: std::ops::Range<usize> = 80_000..160_000;

/// Occasional head/tail fidget while the fish is talking.
pub(super) struct Interlude {
    counted: usize,
    target: usize,
    busy: Arc<AtomicBool>,
}

impl Interlude {
    pub fn new() -> Self {
        Self {
            counted: 0,
            target: rand::thread_rng().gen_range(FIRST_TARGET),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Counts played speech samples; starts a fidget once the target is reached.
    pub fn advance(&mut self, samples: usize, driver: &Arc<dyn ActuationDriver>) -> bool {
        self.counted += samples;
        if self.counted < self.target {
            return false;
        }
        self.counted = 0;
        self.target = rand::thread_rng().gen_range(NEXT_TARGET);
        if self.busy.swap(true, Ordering::AcqRel) {
            return false;
        }

        let busy = self.busy.clone();
        let driver = driver.clone();
        let spawned = std::thread::Builder::new()
            .name("interlude".to_string())
            .spawn(move || {
                fidget(driver.as_ref());
                busy.store(false, Ordering::Release);
            });
        if let Err(e) = spawned {
            warn!("failed to spawn interlude: {}", e);
            self.busy.store(false, Ordering::Release);
            return false;
        }
        true
    }
}

fn fidget(driver: &dyn ActuationDriver) {
    let mut rng = rand::thread_rng();
    debug!("interlude");
    if let Err(e) = driver.brake(Channel::Head) {
        warn!("interlude: {}", e);
        return;
    }
    std::thread::sleep(Duration::from_secs_f64(rng.gen_range(0.2..2.0)));

    for _ in 0..rng.gen_range(1..=3) {
        if let Err(e) = driver.drive(Channel::Tail, TAIL_POWER, TAIL_FLAP, true) {
            warn!("interlude: {}", e);
            return;
        }
        std::thread::sleep(Duration::from_secs_f64(rng.gen_range(0.25..0.9)));
    }

    if rng.gen_bool(0.9) {
        if let Err(e) = driver.drive(Channel::Head, HEAD_POWER, HEAD_RAMP, false) {
            warn!("interlude: {}", e);
        }
    }
}
