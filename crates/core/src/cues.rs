//! Fixed audio clips: status cues, wake-up greetings and the rotating
//! history of recent assistant responses.

use crate::config::SOURCE_SAMPLE_RATE;
use crate::error::{FormatFault, PlaybackError};
use crate::playback::PlaybackEngine;
use crate::wav;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// The conversation service could not be reached.
    Offline,
    /// The service rejected the API key.
    InvalidCredential,
}

impl Cue {
    pub fn file_name(self) -> &'static str {
        match self {
            Cue::Offline => "nowifi.wav",
            Cue::InvalidCredential => "noapikey.wav",
        }
    }
}

/// Reads a clip that must already be mono PCM16 at the source rate.
pub fn load_clip(path: &Path) -> Result<Vec<i16>, PlaybackError> {
    let pcm = wav::read_pcm16(path)?;
    if pcm.channels != 1 || pcm.sample_rate != SOURCE_SAMPLE_RATE {
        return Err(FormatFault {
            path: path.to_path_buf(),
            expected: format!("mono at {} Hz", SOURCE_SAMPLE_RATE),
            found: format!("{} channel(s) at {} Hz", pcm.channels, pcm.sample_rate),
        }
        .into());
    }
    Ok(pcm.samples)
}

fn wav_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut clips: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("wav")))
        .collect();
    clips.sort();
    clips
}

/// Clip files under the sounds directory.
#[derive(Debug, Clone)]
pub struct CueLibrary {
    root: PathBuf,
}

impl CueLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, cue: Cue) -> PathBuf {
        self.root.join(cue.file_name())
    }

    /// Plays a cue to completion. Returns false when the clip is not installed.
    pub async fn play(&self, cue: Cue, engine: &PlaybackEngine) -> Result<bool, PlaybackError> {
        let path = self.path(cue);
        if !path.is_file() {
            warn!(?cue, "cue clip {} is missing", path.display());
            return Ok(false);
        }
        info!(?cue, "playing cue");
        play_clip(path, engine).await?;
        Ok(true)
    }

    /// Custom greetings win over the bundled defaults.
    pub fn wake_up_clips(&self) -> Vec<PathBuf> {
        let custom = wav_files(&self.root.join("wake-up").join("custom"));
        if !custom.is_empty() {
            return custom;
        }
        debug!("no custom wake-up clips, using defaults");
        wav_files(&self.root.join("wake-up").join("default"))
    }

    /// Plays one random wake-up clip to completion, if any are installed.
    pub async fn play_random_wake_up(
        &self,
        engine: &PlaybackEngine,
    ) -> Result<Option<PathBuf>, PlaybackError> {
        let Some(clip) = self.wake_up_clips().choose(&mut rand::thread_rng()).cloned() else {
            warn!("no wake-up clips installed");
            return Ok(None);
        };
        debug!("wake-up clip {}", clip.display());
        play_clip(clip.clone(), engine).await?;
        Ok(Some(clip))
    }
}

async fn play_clip(path: PathBuf, engine: &PlaybackEngine) -> Result<(), PlaybackError> {
    let pcm = tokio::task::spawn_blocking(move || load_clip(&path))
        .await
        .map_err(|e| PlaybackError::Task(e.to_string()))??;
    engine.enqueue_pcm(&pcm);
    engine.wait_drained().await;
    Ok(())
}

/// Keeps the last few assistant responses as `response-N.wav`, newest first.
#[derive(Debug, Clone)]
pub struct ResponseHistory {
    dir: PathBuf,
    keep: usize,
}

impl ResponseHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep: 3,
        }
    }

    fn slot(&self, n: usize) -> PathBuf {
        self.dir.join(format!("response-{n}.wav"))
    }

    pub fn save(&self, pcm: &[i16]) -> Result<PathBuf, PlaybackError> {
        let io_err = |path: &Path, e: std::io::Error| PlaybackError::Wav {
            path: path.to_path_buf(),
            source: hound::Error::IoError(e),
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        for n in (1..self.keep).rev() {
            let src = self.slot(n);
            if src.exists() {
                std::fs::rename(&src, self.slot(n + 1)).map_err(|e| io_err(&src, e))?;
            }
        }
        let newest = self.slot(1);
        wav::write_pcm16(&newest, pcm, SOURCE_SAMPLE_RATE, 1)?;
        debug!("saved response audio to {}", newest.display());
        Ok(newest)
    }
}
