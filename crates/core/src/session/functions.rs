use super::{Flow, SessionController, Turn};
use crate::collaborators::{SmartHome, extract_speech};
use crate::error::{PlaybackError, Result};
use crate::lock;
use crate::personality::{PersonaStore, PersonalityTraits};
use crate::realtime_api::{FunctionCall, ToolSpec};
use serde_json::{Value, json};
use tracing::{info, warn};

pub const UPDATE_PERSONALITY: &str = "update_personality";
pub const PLAY_SONG: &str = "play_song";
pub const SMART_HOME_COMMAND: &str = "smart_home_command";

const SMART_HOME_FAILURE: &str = "Home Assistant didn't understand the request.";

/// Functions offered to the assistant.
pub fn tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: UPDATE_PERSONALITY.to_string(),
            description: "Adjusts Billy's personality traits".to_string(),
            parameters: PersonalityTraits::tool_parameters(),
        },
        ToolSpec {
            name: PLAY_SONG.to_string(),
            description: "Plays a special Billy song based on a given name.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"song": {"type": "string"}},
                "required": ["song"],
            }),
        },
        ToolSpec {
            name: SMART_HOME_COMMAND.to_string(),
            description: "Send a natural language prompt to the Home Assistant conversation \
                          API and read back the response."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "The command to send to Home Assistant",
                    }
                },
                "required": ["prompt"],
            }),
        },
    ]
}

fn string_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

pub(super) async fn dispatch(
    controller: &SessionController,
    call: &FunctionCall,
    turn: &mut Turn,
) -> Result<Flow> {
    let args: Value = match serde_json::from_str(&call.arguments) {
        Ok(args) => args,
        Err(e) => {
            warn!(name = %call.name, "ignoring function call with bad arguments: {}", e);
            return Ok(Flow::Continue);
        }
    };
    match call.name.as_str() {
        UPDATE_PERSONALITY => update_personality(controller, &args, turn).await,
        PLAY_SONG => match string_arg(&args, "song") {
            Some(song) => play_song(controller, song).await,
            None => {
                warn!("play_song without a song name");
                Ok(Flow::Continue)
            }
        },
        SMART_HOME_COMMAND => match string_arg(&args, "prompt") {
            Some(prompt) => smart_home(controller, prompt).await,
            None => {
                warn!("smart_home_command without a prompt");
                Ok(Flow::Continue)
            }
        },
        other => {
            warn!(name = other, "unknown function call");
            Ok(Flow::Continue)
        }
    }
}

async fn update_personality(
    controller: &SessionController,
    args: &Value,
    turn: &mut Turn,
) -> Result<Flow> {
    let inner = &controller.inner;
    let (applied, snapshot) = {
        let mut traits = lock(&inner.personality);
        let applied = traits.apply_updates(args);
        (applied, traits.clone())
    };
    if applied.is_empty() {
        warn!(%args, "no valid personality updates");
        return Ok(Flow::Continue);
    }
    for (name, value) in &applied {
        info!("personality {} set to {}%", name, value);
    }
    if let Err(e) = inner.collaborators.persona.save(&snapshot) {
        warn!("failed to persist personality: {:#}", e);
    }

    inner.signals.set_user_spoke(true);
    inner.signals.activity.touch();
    turn.transcript.clear();
    let confirmation = applied
        .iter()
        .map(|(name, value)| format!("Okay, {name} is now set to {value}%."))
        .collect::<Vec<_>>()
        .join(" ");
    let api = controller.link().await?;
    api.send_text(confirmation).await?;
    api.create_response().await?;
    Ok(Flow::Continue)
}

async fn play_song(controller: &SessionController, song: &str) -> Result<Flow> {
    info!(song, "assistant requested a song");
    controller.stop().await;
    tokio::time::sleep(controller.inner.config.song_settle_delay).await;
    match controller.play_song(song).await {
        Ok(()) => info!(song, "song finished"),
        Err(PlaybackError::UnknownSong(_)) => warn!(song, "assistant asked for an unknown song"),
        Err(e) => warn!(song, "song ended early: {}", e),
    }
    Ok(Flow::Stop)
}

async fn smart_home(controller: &SessionController, prompt: &str) -> Result<Flow> {
    info!(prompt, "sending smart home command");
    let reply = controller.inner.collaborators.smart_home.converse(prompt).await;
    let message = match &reply {
        Ok(reply) => extract_speech(reply).map(|speech| format!("Home Assistant says: {speech}")),
        Err(e) => {
            warn!("smart home request failed: {:#}", e);
            None
        }
    }
    .unwrap_or_else(|| SMART_HOME_FAILURE.to_string());

    let api = controller.link().await?;
    api.send_text(message).await?;
    api.create_response().await?;
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_tools_are_offered() {
        let names: Vec<String> = tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, [UPDATE_PERSONALITY, PLAY_SONG, SMART_HOME_COMMAND]);
    }

    #[test]
    fn blank_string_arguments_are_missing() {
        let args = json!({"song": "  ", "prompt": "lights on", "n": 3});
        assert_eq!(string_arg(&args, "song"), None);
        assert_eq!(string_arg(&args, "prompt"), Some("lights on"));
        assert_eq!(string_arg(&args, "n"), None);
    }
}
