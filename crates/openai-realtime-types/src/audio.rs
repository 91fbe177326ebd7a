mod consts;
mod turn_detection;

pub use consts::*;
pub use turn_detection::{ServerVadTurnDetection, TurnDetection};

/// Audio data encoded as base64 (PCM16 little-endian, mono, 24kHz)
pub type Base64EncodedAudioBytes = String;
