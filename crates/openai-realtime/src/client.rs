use crate::types;
use futures_util::{SinkExt, StreamExt};
use openai_realtime_types::audio::Base64EncodedAudioBytes;
use openai_realtime_types::session::Session;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};

mod config;
mod consts;
mod stats;
mod utils;

pub use config::{Config, ConfigBuilder};
pub use stats::Stats;

pub type ClientTx = tokio::sync::mpsc::Sender<types::ClientEvent>;
type ServerTx = tokio::sync::broadcast::Sender<types::ServerEvent>;
pub type ServerRx = tokio::sync::broadcast::Receiver<types::ServerEvent>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("server rejected the api key")]
    Unauthorized,
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
    #[error("outbound event channel closed")]
    ChannelClosed,
}

/// Handle to one websocket session. Outbound events go through a bounded
/// channel to a writer task; inbound events are fanned out over a broadcast.
pub struct Client {
    capacity: usize,
    config: Config,
    c_tx: Option<ClientTx>,
    s_tx: Option<ServerTx>,
    stats: Arc<Mutex<Stats>>,
}

impl Client {
    fn new(capacity: usize, config: Config) -> Self {
        Self {
            capacity,
            config,
            c_tx: None,
            s_tx: None,
            stats: Arc::new(Mutex::new(Stats::default())),
        }
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        if self.c_tx.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let request = utils::build_request(&self.config)?;
        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => stream,
            Err(tungstenite::Error::Http(response)) if response.status().as_u16() == 401 => {
                return Err(ClientError::Unauthorized);
            }
            Err(e) => return Err(e.into()),
        };

        let (mut write, mut read) = ws_stream.split();
        let (c_tx, mut c_rx) = tokio::sync::mpsc::channel::<types::ClientEvent>(self.capacity);
        let (s_tx, _) = tokio::sync::broadcast::channel(self.capacity);

        self.c_tx = Some(c_tx);
        self.s_tx = Some(s_tx.clone());

        // Writer: drains outbound events until every sender is gone, then closes the socket.
        tokio::spawn(async move {
            while let Some(event) = c_rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::error!("failed to send message: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to serialize event: {}", e);
                    }
                }
            }
            if let Err(e) = write.close().await {
                tracing::debug!("websocket close: {}", e);
            }
        });

        let stats = self.stats.clone();
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(message) = read.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!("failed to read message: {}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                };
                match message {
                    Message::Text(text) => {
                        let event = match serde_json::from_str::<types::ServerEvent>(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::error!("failed to deserialize event: {}, text=> {:?}", e, text);
                                continue;
                            }
                        };
                        if let types::ServerEvent::ResponseDone(done) = &event {
                            if let Some(usage) = done.response().usage() {
                                match stats.lock() {
                                    Ok(mut guard) => guard.update_usage(
                                        usage.total_tokens(),
                                        usage.input_tokens(),
                                        usage.output_tokens(),
                                    ),
                                    Err(_) => tracing::error!("failed to update stats"),
                                }
                                tracing::debug!(
                                    total_tokens = usage.total_tokens(),
                                    input_tokens = usage.input_tokens(),
                                    output_tokens = usage.output_tokens(),
                                    "response usage"
                                );
                            }
                        }
                        // No subscribers is not an error; the session may be tearing down.
                        let _ = s_tx.send(event);
                    }
                    Message::Binary(bin) => {
                        tracing::warn!("unexpected binary message: {} bytes", bin.len());
                    }
                    Message::Close(frame) => {
                        tracing::info!("connection closed: {:?}", frame);
                        reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    _ => {}
                }
            }
            let _ = s_tx.send(types::ServerEvent::Close { reason });
        });
        Ok(())
    }

    /// Subscribe to server events. Subscribe before sending the first request
    /// so no reply is missed.
    pub fn server_events(&self) -> Result<ServerRx, ClientError> {
        match self.s_tx {
            Some(ref tx) => Ok(tx.subscribe()),
            None => Err(ClientError::NotConnected),
        }
    }

    pub fn stats(&self) -> Stats {
        match self.stats.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.c_tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    async fn send_client_event(&mut self, event: types::ClientEvent) -> Result<(), ClientError> {
        match self.c_tx {
            Some(ref tx) => tx.send(event).await.map_err(|_| ClientError::ChannelClosed),
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn update_session(&mut self, config: Session) -> Result<(), ClientError> {
        self.send_client_event(types::ClientEvent::SessionUpdate { session: config })
            .await
    }

    pub async fn append_input_audio_buffer(
        &mut self,
        audio: Base64EncodedAudioBytes,
    ) -> Result<(), ClientError> {
        self.send_client_event(types::ClientEvent::InputAudioBufferAppend { audio })
            .await
    }

    pub async fn commit_input_audio_buffer(&mut self) -> Result<(), ClientError> {
        self.send_client_event(types::ClientEvent::InputAudioBufferCommit).await
    }

    pub async fn create_conversation_item(&mut self, item: types::Item) -> Result<(), ClientError> {
        self.send_client_event(types::ClientEvent::ConversationItemCreate { item })
            .await
    }

    pub async fn create_response(&mut self) -> Result<(), ClientError> {
        self.send_client_event(types::ClientEvent::ResponseCreate).await
    }

    pub async fn end_session(&mut self) -> Result<(), ClientError> {
        self.send_client_event(types::ClientEvent::SessionEnd).await
    }

    /// Drops the outbound channel; the writer task flushes and closes the socket.
    pub fn disconnect(&mut self) {
        if self.c_tx.take().is_some() {
            tracing::debug!("disconnecting realtime client");
        }
        self.s_tx = None;
    }
}

pub async fn connect_with_config(capacity: usize, config: Config) -> Result<Client, ClientError> {
    let mut client = Client::new(capacity, config);
    client.connect().await?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconnected_client_rejects_events() {
        let mut client = Client::new(8, Config::builder().with_api_key("sk-test").build());
        assert!(!client.is_connected());
        assert!(matches!(client.server_events(), Err(ClientError::NotConnected)));
        assert!(matches!(
            client.create_response().await,
            Err(ClientError::NotConnected)
        ));
        client.disconnect();
        assert_eq!(client.stats().responses(), 0);
    }
}
