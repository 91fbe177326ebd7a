//! Outside services the session talks to: a state broadcaster and an
//! optional smart-home conversation endpoint.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

#[cfg(test)]
use mockall::automock;

pub const STATE_IDLE: &str = "idle";
pub const STATE_LISTENING: &str = "listening";
pub const STATE_SPEAKING: &str = "speaking";
pub const STATE_PLAYING_SONG: &str = "playing_song";

/// Receives coarse figure state changes, e.g. for a home automation bus.
#[cfg_attr(test, automock)]
pub trait StatePublisher: Send + Sync {
    fn publish_state(&self, state: &str);
}

/// Publishes by logging only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl StatePublisher for LogPublisher {
    fn publish_state(&self, state: &str) {
        info!(state, "figure state");
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SmartHome: Send + Sync {
    /// Sends a natural language command and returns the raw reply.
    async fn converse(&self, prompt: &str) -> anyhow::Result<Value>;
}

/// Stand-in used when no smart-home endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredSmartHome;

#[async_trait]
impl SmartHome for UnconfiguredSmartHome {
    async fn converse(&self, _prompt: &str) -> anyhow::Result<Value> {
        anyhow::bail!("no smart home endpoint configured")
    }
}

/// Pulls the spoken answer out of a conversation reply.
pub fn extract_speech(reply: &Value) -> Option<&str> {
    reply
        .pointer("/response/speech/plain/speech")
        .or_else(|| reply.pointer("/speech/plain/speech"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}
