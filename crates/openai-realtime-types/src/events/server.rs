//! Payloads of the server events the client models. Fields the client never
//! reads are left out; serde skips them on the way in.

mod error;
mod resources;

pub use error::ErrorDetails;
pub use resources::{ResponseResource, ResponseStatusDetails, SessionResource, Usage};

/// `error`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEvent {
    error: ErrorDetails,
}

impl ErrorEvent {
    pub fn error(&self) -> &ErrorDetails {
        &self.error
    }
}

/// `session.created` and `session.updated`: the server's view of the session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionEvent {
    session: SessionResource,
}

impl SessionEvent {
    pub fn session(&self) -> &SessionResource {
        &self.session
    }
}

/// `input_audio_buffer.speech_started`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SpeechStartedEvent {
    /// Milliseconds into the buffered audio where speech was detected
    audio_start_ms: i32,
}

impl SpeechStartedEvent {
    pub fn audio_start_ms(&self) -> i32 {
        self.audio_start_ms
    }
}

/// `response.created` and `response.done`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseEvent {
    response: ResponseResource,
}

impl ResponseEvent {
    pub fn response(&self) -> &ResponseResource {
        &self.response
    }
}

/// A streamed fragment: text, transcript, or base64 PCM16 for audio deltas.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeltaEvent {
    delta: String,
}

impl DeltaEvent {
    pub fn delta(&self) -> &str {
        &self.delta
    }
}

/// `response.audio_transcript.done`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TranscriptDoneEvent {
    transcript: String,
}

impl TranscriptDoneEvent {
    pub fn transcript(&self) -> &str {
        &self.transcript
    }
}

/// `response.function_call_arguments.done`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionCallDoneEvent {
    call_id: String,
    /// Absent on some older server builds
    #[serde(default)]
    name: Option<String>,
    /// JSON text, not yet parsed
    arguments: String,
}

impl FunctionCallDoneEvent {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }
}
