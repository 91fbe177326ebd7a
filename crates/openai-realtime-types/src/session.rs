use crate::audio::{AudioFormat, TurnDetection, Voice};
use crate::tools::{Tool, ToolChoice};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Session {
    /// The set of modalities the model can respond with: ["text"] or ["text", "audio"].
    modalities: Vec<String>,

    /// The default system instructions prepended to model calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,

    /// The voice the model uses to respond. Fixed once the model has produced audio.
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<Voice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_format: Option<AudioFormat>,

    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_format: Option<AudioFormat>,

    /// Configuration for turn detection. `null` turns it off.
    turn_detection: Option<TurnDetection>,

    /// Tools (functions) available to the model.
    #[serde(default)]
    tools: Vec<Tool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

impl Session {
    pub fn modalities(&self) -> &[String] {
        &self.modalities
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn voice(&self) -> Option<&Voice> {
        self.voice.as_ref()
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }
}

pub struct SessionConfigurator {
    session: Session,
}

impl Default for SessionConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfigurator {
    pub fn new() -> Self {
        Self {
            session: Session {
                modalities: vec!["text".to_string(), "audio".to_string()],
                instructions: None,
                voice: None,
                input_audio_format: None,
                output_audio_format: None,
                turn_detection: None,
                tools: vec![],
                tool_choice: Some(ToolChoice::Auto),
                temperature: None,
            },
        }
    }

    pub fn with_modalities_enable_audio(mut self) -> Self {
        self.session.modalities = vec!["text".to_string(), "audio".to_string()];
        self
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.session.instructions = Some(instructions.to_string());
        self
    }

    pub fn with_voice(mut self, voice: Voice) -> Self {
        self.session.voice = Some(voice);
        self
    }

    /// Sets both directions to the same wire format.
    pub fn with_audio_format(mut self, format: AudioFormat) -> Self {
        self.session.input_audio_format = Some(format.clone());
        self.session.output_audio_format = Some(format);
        self
    }

    pub fn with_turn_detection_enable(mut self, turn_detection: TurnDetection) -> Self {
        self.session.turn_detection = Some(turn_detection);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.session.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.session.temperature = Some(temperature);
        self
    }

    pub fn build(self) -> Session {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FunctionTool;

    #[test]
    fn configured_session_serializes_tools_and_vad() {
        let session = SessionConfigurator::new()
            .with_instructions("Be a fish.")
            .with_voice(Voice::Ash)
            .with_audio_format(AudioFormat::Pcm16)
            .with_turn_detection_enable(TurnDetection::default())
            .with_tools(vec![
                FunctionTool::new("play_song", "Sing", serde_json::json!({"type": "object"}))
                    .into(),
            ])
            .build();

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["voice"], "ash");
        assert_eq!(json["input_audio_format"], "pcm16");
        assert_eq!(json["output_audio_format"], "pcm16");
        assert_eq!(json["turn_detection"]["type"], "server_vad");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["name"], "play_song");
        assert_eq!(json["tool_choice"], "auto");
        assert!(json.get("temperature").is_none());
    }
}
