mod audio_io;
mod config;
mod openai_adapter;

use crate::audio_io::{MicCapture, cpal_sinks};
use crate::config::Config;
use crate::openai_adapter::OpenAiConnector;
use anyhow::{Context, Result};
use billy_core::config::MotorWatchdogConfig;
use billy_core::cues::CueLibrary;
use billy_core::personality::JsonPersonaStore;
use billy_core::playback::null_sinks;
use billy_core::session::Collaborators;
use billy_core::watchdog::MotorWatchdog;
use billy_core::{ActuationDriver, PlaybackEngine, SessionController, SimulatedDriver};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Talking, singing wall fish")]
struct Cli {
    /// Discard audio instead of opening the sound card
    #[arg(long, global = true)]
    mute: bool,
    /// Output device name; the host default when omitted
    #[arg(long, global = true)]
    output_device: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Press Enter to start a conversation; Enter while Billy talks interrupts him
    Converse {
        /// End each session after the first answer
        #[arg(long)]
        single_turn: bool,
        /// Input device name; the host default when omitted
        #[arg(long)]
        input_device: Option<String>,
    },
    /// Have Billy say one message and hang up; wrap it in {{...}} to prompt instead
    Say { text: String },
    /// Play one song bundle from the songs directory
    Song { name: String },
    /// List audio devices and installed songs
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();
    tracing::info!("Configuration loaded successfully. Starting Billy...");

    // --- 3. Actuators and Playback ---
    let driver: Arc<dyn ActuationDriver> = Arc::new(SimulatedDriver::new());
    tokio::spawn(MotorWatchdog::new(MotorWatchdogConfig::default(), driver.clone()).run());

    let playback = if cli.mute {
        PlaybackEngine::new(config.playback_config(), driver.clone(), null_sinks())
    } else {
        PlaybackEngine::new(
            config.playback_config(),
            driver.clone(),
            cpal_sinks(cli.output_device.clone()),
        )
    };
    let collaborators = Collaborators::new(&config.sounds_dir)
        .with_persona_store(Arc::new(JsonPersonaStore::new(&config.persona_file)));

    // --- 4. Run the Command ---
    let result = match cli.command {
        Command::Devices => list_devices(&collaborators),
        Command::Song { name } => collaborators
            .songs
            .play(&name, &playback)
            .await
            .with_context(|| format!("Failed to play song {name:?}")),
        Command::Say { text } => say(&mut config, &text, playback.clone(), collaborators).await,
        Command::Converse {
            single_turn,
            input_device,
        } => {
            converse(&mut config, single_turn, input_device, playback.clone(), collaborators).await
        }
    };

    playback.stop_actuators();
    tracing::info!("Shutting down...");
    result
}

fn list_devices(collaborators: &Collaborators) -> Result<()> {
    println!("Inputs:\n{}", billy_native_utils::device::get_available_inputs()?);
    println!("Outputs:\n{}", billy_native_utils::device::get_available_outputs()?);
    let songs = collaborators.songs.list();
    println!("Songs in {}:", collaborators.songs.root().display());
    for song in songs {
        println!(" * {song}");
    }
    Ok(())
}

async fn converse(
    config: &mut Config,
    single_turn: bool,
    input_device: Option<String>,
    playback: PlaybackEngine,
    collaborators: Collaborators,
) -> Result<()> {
    let api_key = config.take_api_key()?;
    let mut session_config = config.session_config();
    session_config.single_turn |= single_turn;

    let connector = Arc::new(OpenAiConnector::new(api_key, config.model.clone()));
    let cues = collaborators.cues.clone();
    let controller = SessionController::new(session_config, connector, playback, collaborators);

    // The stream stops when dropped, so keep it for the whole loop.
    let _mic = MicCapture::start(input_device.as_deref(), controller.mic_input())
        .context("Failed to start microphone capture")?;

    tracing::info!("Press Enter to talk to Billy. Ctrl-C quits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(_) => on_enter(&controller, &cues),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down...");
                break;
            }
        }
    }
    controller.stop().await;
    Ok(())
}

async fn say(
    config: &mut Config,
    text: &str,
    playback: PlaybackEngine,
    collaborators: Collaborators,
) -> Result<()> {
    let api_key = config.take_api_key()?;
    let connector = Arc::new(OpenAiConnector::new(api_key, config.model.clone()));
    let controller =
        SessionController::new(config.session_config(), connector, playback, collaborators);
    let said = controller.say(text).await.context("Failed to say message")?;
    tracing::info!("Billy said: {}", said);
    Ok(())
}

/// Starts a session, or cuts Billy off if one is already running.
fn on_enter(controller: &SessionController, cues: &CueLibrary) {
    if controller.is_running() {
        tracing::info!("Interrupting Billy");
        controller.interrupt();
        return;
    }
    let controller = controller.clone();
    let cues = cues.clone();
    tokio::spawn(async move {
        match cues.play_random_wake_up(controller.playback()).await {
            Ok(Some(clip)) => tracing::debug!("played wake-up clip {}", clip.display()),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to play wake-up clip: {}", e),
        }
        if let Err(e) = controller.start().await {
            tracing::error!("Session ended with an error: {}", e);
        }
    });
}
