use async_trait::async_trait;
use billy_core::error::{ConnectivityFault, ProtocolFault, SessionError};
use billy_core::realtime_api::{
    Connection, Connector, FunctionCall, InboundEvent, RealtimeApi, SessionSetup, TurnError,
};
use billy_native_utils::audio;
use openai_realtime::types::audio::{AudioFormat, TurnDetection, Voice};
use openai_realtime::types::events::ServerEvent;
use openai_realtime::types::session::SessionConfigurator;
use openai_realtime::types::tools::FunctionTool;
use openai_realtime::types::{MessageItem, MessageRole, Session};
use openai_realtime::{Client, ClientError, ServerRx};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

const CLIENT_CAPACITY: usize = 1024;
const EVENT_BACKLOG: usize = 256;

/// Opens realtime sessions against the OpenAI websocket API.
pub struct OpenAiConnector {
    api_key: SecretString,
    model: String,
}

impl OpenAiConnector {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Connector for OpenAiConnector {
    async fn open(&self, setup: &SessionSetup) -> Result<Connection, SessionError> {
        let config = openai_realtime::Config::builder()
            .with_api_key(self.api_key.expose_secret())
            .with_model(&self.model)
            .build();
        let mut client = openai_realtime::connect_with_config(CLIENT_CAPACITY, config)
            .await
            .map_err(client_error)?;
        // Subscribe before configuring so session.updated is not missed.
        let server_events = client.server_events().map_err(client_error)?;
        let session = session_for(setup);
        debug!("Session config: {:?}", serde_json::to_string(&session));
        client.update_session(session).await.map_err(client_error)?;
        info!(model = %self.model, "connected to realtime api");

        let (tx, events) = mpsc::channel(EVENT_BACKLOG);
        tokio::spawn(forward_events(server_events, tx));
        Ok(Connection {
            api: Arc::new(OpenAiLink {
                client: Mutex::new(client),
            }),
            events,
        })
    }
}

fn client_error(e: ClientError) -> SessionError {
    match e {
        ClientError::Unauthorized => ProtocolFault::InvalidCredential.into(),
        other => ConnectivityFault(other.to_string()).into(),
    }
}

/// Audio in and out, text and audio modalities, server VAD and the tools.
pub fn session_for(setup: &SessionSetup) -> Session {
    let Ok(voice) = setup.voice.parse::<Voice>();
    let tools = setup
        .tools
        .iter()
        .map(|tool| FunctionTool::new(&tool.name, &tool.description, tool.parameters.clone()).into())
        .collect();
    SessionConfigurator::new()
        .with_modalities_enable_audio()
        .with_instructions(&setup.instructions)
        .with_voice(voice)
        .with_audio_format(AudioFormat::Pcm16)
        .with_turn_detection_enable(TurnDetection::default())
        .with_tools(tools)
        .build()
}

async fn forward_events(mut server_events: ServerRx, tx: mpsc::Sender<InboundEvent>) {
    loop {
        let event = match server_events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("session fell behind, {} server events dropped", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let closing = matches!(event, ServerEvent::Close { .. });
        if let Some(inbound) = map_server_event(event) {
            if tx.send(inbound).await.is_err() {
                debug!("session stopped listening, ending event forwarder");
                break;
            }
        }
        if closing {
            break;
        }
    }
}

/// Translates one wire event into what the session cares about.
pub fn map_server_event(event: ServerEvent) -> Option<InboundEvent> {
    match event {
        ServerEvent::Close { reason } => Some(InboundEvent::Closed { reason }),
        ServerEvent::Error(e) => Some(InboundEvent::ProtocolError {
            code: e.error().code().map(str::to_string),
            message: e.error().message().to_string(),
        }),
        ServerEvent::SessionCreated(data) => {
            debug!(id = data.session().id(), "session created");
            None
        }
        ServerEvent::SessionUpdated(_) => Some(InboundEvent::SessionReady),
        ServerEvent::InputAudioBufferSpeechStarted(data) => {
            debug!(at_ms = data.audio_start_ms(), "user speech started");
            None
        }
        ServerEvent::ResponseCreated(data) => {
            debug!(id = data.response().id(), "response created");
            None
        }
        ServerEvent::ResponseTextDelta(data) => Some(InboundEvent::TextDelta(data.delta().to_string())),
        ServerEvent::ResponseAudioTranscriptDelta(data) => {
            Some(InboundEvent::TranscriptDelta(data.delta().to_string()))
        }
        ServerEvent::ResponseAudioTranscriptDone(data) => {
            debug!("assistant said: {:?}", data.transcript());
            Some(InboundEvent::TranscriptDone)
        }
        ServerEvent::ResponseAudioDelta(data) => match audio::decode_i16(data.delta()) {
            Ok(pcm) => Some(InboundEvent::AudioDelta(pcm)),
            Err(e) => {
                warn!("dropping undecodable audio delta: {}", e);
                None
            }
        },
        ServerEvent::ResponseFunctionCallArgumentsDone(data) => match data.name() {
            Some(name) => Some(InboundEvent::FunctionCall(FunctionCall {
                name: name.to_string(),
                call_id: data.call_id().to_string(),
                arguments: data.arguments().to_string(),
            })),
            None => {
                warn!(call_id = data.call_id(), "function call without a name");
                None
            }
        },
        ServerEvent::ResponseDone(data) => {
            let response = data.response();
            let error = (response.status() == Some("failed")).then(|| TurnError {
                kind: response
                    .error()
                    .map(|e| e.error_type().to_string())
                    .or_else(|| response.status_details().and_then(|d| d.kind()).map(str::to_string)),
                message: response
                    .error()
                    .map(|e| e.message().to_string())
                    .unwrap_or_else(|| "response failed".to_string()),
            });
            Some(InboundEvent::TurnComplete { error })
        }
        ServerEvent::Unhandled => None,
    }
}

/// The live half of a connection. The client sits behind an async mutex
/// because its send methods take `&mut self`.
struct OpenAiLink {
    client: Mutex<Client>,
}

#[async_trait]
impl RealtimeApi for OpenAiLink {
    async fn append_input_audio(&self, pcm: Vec<i16>) -> Result<(), SessionError> {
        let encoded = audio::encode_i16(&pcm);
        self.client
            .lock()
            .await
            .append_input_audio_buffer(encoded)
            .await
            .map_err(client_error)
    }

    async fn commit_input_audio(&self) -> Result<(), SessionError> {
        self.client.lock().await.commit_input_audio_buffer().await.map_err(client_error)
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        let item = MessageItem::builder()
            .with_role(MessageRole::User)
            .with_input_text(&text)
            .build();
        self.client
            .lock()
            .await
            .create_conversation_item(item.into())
            .await
            .map_err(client_error)
    }

    async fn create_response(&self) -> Result<(), SessionError> {
        self.client.lock().await.create_response().await.map_err(client_error)
    }

    async fn end_session(&self) -> Result<(), SessionError> {
        self.client.lock().await.end_session().await.map_err(client_error)
    }

    async fn close(&self) {
        let mut client = self.client.lock().await;
        let stats = client.stats();
        debug!(responses = stats.responses(), "closing realtime connection");
        client.disconnect();
    }
}
