//! One-shot speech: open a session, have the assistant say one thing with
//! the head out, then hang up.

use super::{SessionController, SessionState};
use crate::actuation::{Channel, HEAD_POWER, HEAD_RAMP};
use crate::collaborators::STATE_SPEAKING;
use crate::error::{ProtocolFault, Result, SessionError};
use crate::lock;
use crate::realtime_api::{InboundEvent, SessionSetup};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// Turns `text` into the user message for a one-shot utterance.
///
/// `{{...}}` is an instruction passed through as-is; anything else is to be
/// repeated word for word in Billy's own voice.
pub fn say_message(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(prompt) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        return prompt.trim().to_string();
    }
    format!(
        "Override for this turn while keeping your tone and accent:\n\
         Say the user's message verbatim, word for word, with no additions or reinterpretation.\n\
         Keep your personality, but do NOT rephrase or expand.\n\n\
         Repeat this literal message: {trimmed}"
    )
}

impl SessionController {
    /// Speaks one message outside of a conversation and returns what the
    /// assistant said.
    ///
    /// No tools are offered and the mic stays closed. The reply plays with
    /// the head extended; the call returns after the audio has drained and
    /// the head is released. Fails with [`SessionError::Busy`] while a
    /// conversation is running.
    pub async fn say(&self, text: &str) -> Result<String> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Busy);
        }
        let result = self.say_once(text).await;
        if let Err(e) = &result {
            error!("say failed: {}", e);
        }
        self.teardown().await;
        self.inner.running.store(false, Ordering::Release);
        result
    }

    async fn say_once(&self, text: &str) -> Result<String> {
        let setup = SessionSetup {
            tools: Vec::new(),
            ..self.setup()
        };
        let Some(mut events) = self.connect(setup).await? else {
            return Ok(String::new());
        };
        let api = self.link().await?;
        api.send_text(say_message(text)).await?;
        api.create_response().await?;
        self.set_state(SessionState::Speaking);
        self.publish(STATE_SPEAKING);
        self.extend_head().await;

        let mut transcript = String::new();
        let mut audio = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                InboundEvent::AudioDelta(pcm) => {
                    self.inner.playback.enqueue_pcm(&pcm);
                    audio.extend_from_slice(&pcm);
                }
                InboundEvent::TextDelta(delta) | InboundEvent::TranscriptDelta(delta) => {
                    transcript.push_str(&delta);
                }
                InboundEvent::TurnComplete { error } => {
                    if let Some(e) = error {
                        warn!(kind = ?e.kind, "say response failed: {}", e.message);
                        *lock(&self.inner.last_error) = Some(e.message);
                    }
                    api.end_session().await?;
                    break;
                }
                InboundEvent::ProtocolError { code, message } => {
                    self.inner.playback.request_stop();
                    return Err(ProtocolFault::from_remote(code.as_deref(), &message).into());
                }
                InboundEvent::Closed { reason } => {
                    debug!(?reason, "provider closed during say");
                    break;
                }
                InboundEvent::SessionReady
                | InboundEvent::TranscriptDone
                | InboundEvent::FunctionCall(_) => {}
            }
        }

        self.inner.playback.wait_drained().await;
        self.save_response(audio).await;
        self.inner.playback.mark_idle();
        let transcript = transcript.trim().to_string();
        info!(transcript, "said");
        Ok(transcript)
    }

    async fn extend_head(&self) {
        let driver = self.inner.playback.driver().clone();
        let extended = tokio::task::spawn_blocking(move || {
            driver.drive(Channel::Head, HEAD_POWER, HEAD_RAMP, false)
        })
        .await;
        match extended {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("head extend failed: {}", e),
            Err(e) => warn!("head extend task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_text_is_wrapped_for_verbatim_repetition() {
        let message = say_message("  The pizza is here. ");
        assert!(message.contains("verbatim"));
        assert!(message.ends_with("Repeat this literal message: The pizza is here."));
    }

    #[test]
    fn braced_text_is_a_prompt() {
        assert_eq!(say_message("{{ tell a fish joke }}"), "tell a fish joke");
        assert!(say_message("{{ unbalanced").contains("verbatim"));
    }
}
