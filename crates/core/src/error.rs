use crate::actuation::Channel;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareFault {
    #[error("{channel:?} channel unavailable: {reason}")]
    Unavailable { channel: Channel, reason: String },
    #[error("{channel:?} channel stuck active for {active_for:?}")]
    Stuck { channel: Channel, active_for: Duration },
}

#[derive(Debug, Error)]
pub enum StreamFault {
    #[error("failed to open output sink: {0}")]
    Open(String),
    #[error("failed to write to output sink: {0}")]
    Write(String),
    #[error("resampler failure: {0}")]
    Resampler(String),
}

#[derive(Debug, Error)]
pub enum ProtocolFault {
    #[error("the conversation service rejected the credential")]
    InvalidCredential,
    #[error("remote error {code:?}: {message}")]
    Remote { code: Option<String>, message: String },
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolFault {
    /// Builds a remote fault, promoting the credential code to its own kind.
    pub fn from_remote(code: Option<&str>, message: &str) -> Self {
        match code {
            Some("invalid_api_key") => ProtocolFault::InvalidCredential,
            _ => ProtocolFault::Remote {
                code: code.map(str::to_string),
                message: message.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
#[error("could not reach the conversation service: {0}")]
pub struct ConnectivityFault(pub String);

/// A metadata field that failed to parse; the field falls back to its default.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid value {value:?} for {field}")]
pub struct ConfigFault {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Error)]
#[error("{}: expected {expected}, found {found}", path.display())]
pub struct FormatFault {
    pub path: PathBuf,
    pub expected: String,
    pub found: String,
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Stream(#[from] StreamFault),
    #[error(transparent)]
    Hardware(#[from] HardwareFault),
    #[error(transparent)]
    Format(#[from] FormatFault),
    #[error("wav i/o on {}: {source}", path.display())]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("song {0:?} not found")]
    UnknownSong(String),
    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolFault),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityFault),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error(transparent)]
    Hardware(#[from] HardwareFault),
    #[error("no open connection")]
    NotConnected,
    #[error("a session is already running")]
    Busy,
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
