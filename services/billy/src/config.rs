//! Service configuration.
//!
//! Settings come from the environment (a `.env` file is loaded first when
//! present) and are turned into the core's tunables here.

use billy_core::config::{IdleConfig, PlaybackConfig, SessionConfig};
use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini-realtime-preview";

const DEFAULT_INSTRUCTIONS: &str = "You are Billy, a Big Mouth Billy Bass singing fish \
mounted on a wall. You talk like a fish with a dry sense of humor and keep your answers short.";

/// How a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    /// Forgets the conversation after one answer.
    Dory,
}

#[derive(Debug)]
pub struct Config {
    /// Needed only to converse; songs and device listing run without it.
    pub openai_api_key: Option<SecretString>,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub run_mode: RunMode,
    pub mic_timeout: Duration,
    pub silence_threshold: f32,
    pub mouth_threshold: f32,
    pub playback_volume: f32,
    pub sounds_dir: PathBuf,
    pub persona_file: PathBuf,
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value {value:?} for {var}")]
    Invalid { var: String, value: String },
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `OPENAI_API_KEY`: required to converse.
    // *   `OPENAI_MODEL`, `OPENAI_VOICE`, `BILLY_INSTRUCTIONS`: optional overrides.
    // *   `RUN_MODE`: "normal" (default) or "dory" for one answer per session.
    // *   `MIC_TIMEOUT_SECONDS`, `SILENCE_THRESHOLD`, `MOUTH_THRESHOLD`, `PLAYBACK_VOLUME`: tuning.
    // *   `SOUNDS_DIR`, `PERSONA_FILE`: asset and state locations.
    // *   `RUST_LOG`: the logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let openai_api_key = var("OPENAI_API_KEY").map(SecretString::from);

        let run_mode = match var("RUN_MODE").map(|m| m.to_lowercase()).as_deref() {
            None | Some("normal") => RunMode::Normal,
            Some("dory") => RunMode::Dory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "RUN_MODE".to_string(),
                    value: other.to_string(),
                });
            }
        };

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        let mic_timeout: f32 = parse_or(&var, "MIC_TIMEOUT_SECONDS", 5.0)?;
        if !mic_timeout.is_finite() || mic_timeout <= 0.0 {
            return Err(ConfigError::Invalid {
                var: "MIC_TIMEOUT_SECONDS".to_string(),
                value: mic_timeout.to_string(),
            });
        }

        Ok(Self {
            openai_api_key,
            model: var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: var("OPENAI_VOICE").unwrap_or_else(|| "ash".to_string()),
            instructions: var("BILLY_INSTRUCTIONS").unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
            run_mode,
            mic_timeout: Duration::from_secs_f32(mic_timeout),
            silence_threshold: parse_or(&var, "SILENCE_THRESHOLD", 2000.0)?,
            mouth_threshold: parse_or(&var, "MOUTH_THRESHOLD", 1500.0)?,
            playback_volume: parse_or(&var, "PLAYBACK_VOLUME", 1.0)?,
            sounds_dir: var("SOUNDS_DIR").unwrap_or_else(|| "sounds".to_string()).into(),
            persona_file: var("PERSONA_FILE").unwrap_or_else(|| "persona.json".to_string()).into(),
            log_level,
        })
    }

    /// Moves the API key out, failing when none was configured.
    pub fn take_api_key(&mut self) -> Result<SecretString, ConfigError> {
        self.openai_api_key
            .take()
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            single_turn: self.run_mode == RunMode::Dory,
            silence_threshold: self.silence_threshold,
            idle: IdleConfig {
                timeout: self.mic_timeout,
                ..IdleConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        let mut config = PlaybackConfig {
            volume: self.playback_volume,
            ..PlaybackConfig::default()
        };
        config.mouth.threshold = self.mouth_threshold;
        config
    }
}

fn parse_or(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: f32,
) -> Result<f32, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var: name.to_string(),
            value,
        }),
    }
}
