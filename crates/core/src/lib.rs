//! Audio-driven actuation and conversational turn control for a singing fish.
//!
//! The real-time side lives in [`playback`]: one consumer thread owns the
//! output sink and every actuator while it runs. The asynchronous side lives
//! in [`session`] and talks to it only through the playback queue and its
//! drain/activity signals.

pub mod actuation;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod cues;
pub mod error;
pub mod personality;
pub mod playback;
pub mod realtime_api;
pub mod session;
pub mod songs;
pub mod sync;
pub mod watchdog;
mod wav;

pub use actuation::{ActuationDriver, ActuatorState, Channel, SimulatedDriver};
pub use error::{
    ConfigFault, ConnectivityFault, FormatFault, HardwareFault, PlaybackError, ProtocolFault,
    SessionError, StreamFault,
};
pub use playback::{PlaybackEngine, PlaybackItem};
pub use session::{SessionController, SessionState};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
