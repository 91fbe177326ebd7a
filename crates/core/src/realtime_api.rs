use crate::error::SessionError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A function the assistant may call, advertised when the session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// Everything the provider needs to configure a new session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub instructions: String,
    pub voice: String,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub call_id: String,
    /// Raw JSON arguments as sent by the assistant.
    pub arguments: String,
}

/// Error details attached to a finished response.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnError {
    pub kind: Option<String>,
    pub message: String,
}

/// Provider-neutral view of the inbound stream, reduced to what the session
/// acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// The remote session accepted its configuration; mic audio may flow.
    SessionReady,
    /// Assistant speech, mono PCM16 at the source rate.
    AudioDelta(Vec<i16>),
    TextDelta(String),
    TranscriptDelta(String),
    TranscriptDone,
    FunctionCall(FunctionCall),
    TurnComplete { error: Option<TurnError> },
    ProtocolError { code: Option<String>, message: String },
    Closed { reason: Option<String> },
}

/// Outbound half of an open connection.
#[async_trait]
pub trait RealtimeApi: Send + Sync {
    async fn append_input_audio(&self, pcm: Vec<i16>) -> Result<(), SessionError>;

    async fn commit_input_audio(&self) -> Result<(), SessionError>;

    /// Adds a user text message to the conversation.
    async fn send_text(&self, text: String) -> Result<(), SessionError>;

    async fn create_response(&self) -> Result<(), SessionError>;

    async fn end_session(&self) -> Result<(), SessionError>;

    /// Closes the connection. Closing twice is fine.
    async fn close(&self);
}

pub struct Connection {
    pub api: Arc<dyn RealtimeApi>,
    pub events: mpsc::Receiver<InboundEvent>,
}

/// Opens configured connections to a conversation provider.
///
/// Failures to reach the provider come back as
/// [`SessionError::Connectivity`]; a rejected key as
/// [`crate::ProtocolFault::InvalidCredential`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, setup: &SessionSetup) -> Result<Connection, SessionError>;
}
