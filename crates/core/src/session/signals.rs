use crate::clock::ActivityClock;
use crate::sync::rms;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::trace;

const MIC_BACKLOG: usize = 64;

/// Per-turn flags shared between the session loop, the mic callback and the
/// idle watchdog. Each flag has one writer.
pub(crate) struct TurnSignals {
    active: watch::Sender<bool>,
    ready: AtomicBool,
    mic_enabled: AtomicBool,
    user_spoke: AtomicBool,
    interrupt: AtomicBool,
    /// Last mic speech or inbound assistant audio.
    pub activity: ActivityClock,
    silence_threshold: f32,
    frames: mpsc::Sender<Vec<i16>>,
}

impl TurnSignals {
    pub fn new(silence_threshold: f32) -> (Self, mpsc::Receiver<Vec<i16>>) {
        let (frames, rx) = mpsc::channel(MIC_BACKLOG);
        let signals = Self {
            active: watch::channel(false).0,
            ready: AtomicBool::new(false),
            mic_enabled: AtomicBool::new(false),
            user_spoke: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            activity: ActivityClock::new(),
            silence_threshold,
            frames,
        };
        (signals, rx)
    }

    /// Marks a fresh turn active with the mic open and nothing heard yet.
    pub fn activate(&self) {
        self.ready.store(false, Ordering::Release);
        self.user_spoke.store(false, Ordering::Release);
        self.interrupt.store(false, Ordering::Release);
        self.mic_enabled.store(true, Ordering::Release);
        self.activity.touch();
        self.active.send_replace(true);
    }

    /// Returns whether the turn was active before.
    pub fn deactivate(&self) -> bool {
        self.mic_enabled.store(false, Ordering::Release);
        self.active.send_replace(false)
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_mic_enabled(&self, enabled: bool) {
        self.mic_enabled.store(enabled, Ordering::Release);
    }

    pub fn mic_enabled(&self) -> bool {
        self.mic_enabled.load(Ordering::Acquire)
    }

    pub fn user_spoke(&self) -> bool {
        self.user_spoke.load(Ordering::Acquire)
    }

    pub fn set_user_spoke(&self, spoke: bool) {
        self.user_spoke.store(spoke, Ordering::Release);
    }

    pub fn raise_interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::AcqRel)
    }
}

/// Entry point for captured microphone audio.
///
/// Cheap to clone and safe to call from an audio callback thread; frames are
/// dropped rather than blocking when the session falls behind.
#[derive(Clone)]
pub struct MicInput {
    signals: Arc<TurnSignals>,
}

impl MicInput {
    pub(crate) fn new(signals: Arc<TurnSignals>) -> Self {
        Self { signals }
    }

    /// Takes one mono PCM16 frame at the source rate. Returns whether it was
    /// queued for the assistant.
    pub fn push(&self, pcm: Vec<i16>) -> bool {
        let signals = &self.signals;
        if !signals.is_active() || !signals.mic_enabled() {
            return false;
        }
        let level = rms(&pcm);
        if level > signals.silence_threshold {
            signals.activity.touch();
            signals.set_user_spoke(true);
        }
        if !signals.is_ready() {
            return false;
        }
        match signals.frames.try_send(pcm) {
            Ok(()) => true,
            Err(e) => {
                trace!("dropping mic frame: {}", e);
                false
            }
        }
    }
}
