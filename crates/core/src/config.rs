//! Tunables shared by the playback and session layers.
//!
//! Every struct here carries the hardware-proven defaults; the service binary
//! overrides a handful of them from the environment.

use std::time::Duration;

/// Sample rate of assistant audio, cue clips and song stems after loading.
pub const SOURCE_SAMPLE_RATE: u32 = 24_000;
/// Rate of the output sink.
pub const OUTPUT_SAMPLE_RATE: u32 = 48_000;
/// Length of one playback chunk.
pub const CHUNK_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct MouthConfig {
    /// RMS (in PCM16 units) a chunk must exceed to open the mouth.
    pub threshold: f32,
    /// Exponential smoothing factor for RMS. 1.0 passes RMS through unchanged.
    pub smoothing: f32,
    /// Minimum time between two flaps.
    pub min_flap_gap: Duration,
    /// Normalized RMS range mapped onto the power and duration ranges.
    pub normalized_range: (f32, f32),
    pub power_range: (f32, f32),
    pub duration_range_ms: (f32, f32),
}

impl Default for MouthConfig {
    fn default() -> Self {
        Self {
            threshold: 1500.0,
            smoothing: 1.0,
            min_flap_gap: Duration::from_millis(100),
            normalized_range: (0.005, 0.15),
            power_range: (25.0, 100.0),
            duration_range_ms: (15.0, 70.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub source_rate: u32,
    pub output_rate: u32,
    pub chunk_ms: u64,
    /// Linear gain applied to rendered audio before clipping.
    pub volume: f32,
    pub mouth: MouthConfig,
    /// Random head/tail fidgets while speaking.
    pub interludes: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            source_rate: SOURCE_SAMPLE_RATE,
            output_rate: OUTPUT_SAMPLE_RATE,
            chunk_ms: CHUNK_MS,
            volume: 1.0,
            mouth: MouthConfig::default(),
            interludes: true,
        }
    }
}

impl PlaybackConfig {
    /// Frames per chunk at the source rate.
    pub fn chunk_frames(&self) -> usize {
        (self.source_rate as u64 * self.chunk_ms / 1000) as usize
    }

    pub fn chunk_span(&self) -> Duration {
        Duration::from_millis(self.chunk_ms)
    }
}

#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// Idle time that is not counted at all.
    pub offset: Duration,
    /// Counted idle time after which the turn is ended.
    pub timeout: Duration,
    pub poll: Duration,
    /// Counted idle time before the progress bar and tail cues start.
    pub impatience_after: Duration,
    /// Minimum time between two impatience tail flaps.
    pub cue_interval: Duration,
    pub bar_width: usize,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            offset: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
            poll: Duration::from_millis(500),
            impatience_after: Duration::from_millis(500),
            cue_interval: Duration::from_secs(1),
            bar_width: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    /// End the session after the first completed turn.
    pub single_turn: bool,
    /// Pause after a drained turn so trailing audio leaves the speaker.
    pub settle_delay: Duration,
    /// Pause between ending a turn and starting a song.
    pub song_settle_delay: Duration,
    /// Mic RMS above which the user counts as speaking.
    pub silence_threshold: f32,
    pub idle: IdleConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            voice: "ash".to_string(),
            single_turn: false,
            settle_delay: Duration::from_secs(1),
            song_settle_delay: Duration::from_secs(1),
            silence_threshold: 2000.0,
            idle: IdleConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MotorWatchdogConfig {
    pub interval: Duration,
    /// Continuous activity after which a channel is force-braked.
    pub ceiling: Duration,
}

impl Default for MotorWatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
        }
    }
}
