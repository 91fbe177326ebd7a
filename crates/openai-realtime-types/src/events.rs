pub mod server;

use crate::Item;
use crate::audio::Base64EncodedAudioBytes;
use crate::session::Session;
use server::*;

/// Messages sent to the server. Fieldless variants go out as a bare
/// `{"type": ...}` object.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: Session },
    /// Base64 PCM16 appended to the server-side input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: Base64EncodedAudioBytes },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: Item },
    #[serde(rename = "response.create")]
    ResponseCreate,
    #[serde(rename = "session.end")]
    SessionEnd,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Synthesized by the client when the socket closes.
    #[serde(rename = "close")]
    Close { reason: Option<String> },
    #[serde(rename = "error")]
    Error(ErrorEvent),
    #[serde(rename = "session.created")]
    SessionCreated(SessionEvent),
    #[serde(rename = "session.updated")]
    SessionUpdated(SessionEvent),
    #[serde(rename = "input_audio_buffer.speech_started")]
    InputAudioBufferSpeechStarted(SpeechStartedEvent),
    #[serde(rename = "response.created")]
    ResponseCreated(ResponseEvent),
    #[serde(rename = "response.done")]
    ResponseDone(ResponseEvent),
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta(DeltaEvent),
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta(DeltaEvent),
    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone(TranscriptDoneEvent),
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta(DeltaEvent),
    #[serde(rename = "response.function_call_arguments.done")]
    ResponseFunctionCallArgumentsDone(FunctionCallDoneEvent),
    /// Any event kind this crate does not model.
    #[serde(other)]
    Unhandled,
}
