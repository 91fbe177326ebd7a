//! Song bundles: a directory per song holding `full.wav`, `vocals.wav`,
//! `drums.wav` and an optional `metadata.txt` of `key=value` lines.

use crate::config::SOURCE_SAMPLE_RATE;
use crate::error::{ConfigFault, FormatFault, PlaybackError, StreamFault};
use crate::playback::{PlaybackEngine, PlaybackItem, SongChunk};
use crate::sync::{HeadMove, rms};
use crate::wav;
use billy_native_utils::audio::{
    convert_f32_to_i16, convert_i16_to_f32, downmix_i16, resample_all,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MAIN_STEM: &str = "full.wav";
pub const VOCALS_STEM: &str = "vocals.wav";
pub const DRUMS_STEM: &str = "drums.wav";
pub const METADATA_FILE: &str = "metadata.txt";

#[derive(Debug, Clone, PartialEq)]
pub struct SongMetadata {
    pub bpm: f64,
    pub gain: f32,
    /// Percussion RMS a beat window must exceed to flap the tail.
    pub tail_threshold: f32,
    /// Fraction of a beat by which tail boundaries are pulled earlier.
    pub compensate_tail_beats: f64,
    pub half_tempo_flap: bool,
    pub head_moves: Vec<HeadMove>,
}

impl Default for SongMetadata {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            gain: 1.0,
            tail_threshold: 1500.0,
            compensate_tail_beats: 0.0,
            half_tempo_flap: false,
            head_moves: Vec::new(),
        }
    }
}

fn parse_number<T: std::str::FromStr + Copy>(value: &str, valid: impl Fn(T) -> bool) -> Option<T> {
    value.parse::<T>().ok().filter(|v| valid(*v))
}

/// Longest offset or hold a head move may name.
pub const MAX_HEAD_MOVE_SECONDS: f64 = 6.0 * 3600.0;

fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds =
        parse_number::<f64>(value.trim(), |v| (0.0..=MAX_HEAD_MOVE_SECONDS).contains(&v))?;
    Duration::try_from_secs_f64(seconds).ok()
}

fn parse_head_moves(value: &str) -> Option<Vec<HeadMove>> {
    if value.is_empty() {
        return Some(Vec::new());
    }
    value
        .split(',')
        .map(|pair| {
            let (start, duration) = pair.split_once(':')?;
            Some(HeadMove {
                start: parse_seconds(start)?,
                duration: parse_seconds(duration)?,
            })
        })
        .collect()
}

impl SongMetadata {
    /// Seconds per tail beat.
    pub fn beat_length(&self) -> f64 {
        let beat = 60.0 / self.bpm;
        if self.half_tempo_flap { beat * 2.0 } else { beat }
    }

    /// Parses `key=value` lines. Each field that fails to parse keeps its
    /// default and is reported; the rest of the record still applies.
    pub fn parse(text: &str) -> (Self, Vec<ConfigFault>) {
        let mut metadata = Self::default();
        let mut faults = Vec::new();

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            let applied = match key {
                "bpm" => parse_number(value, |v: f64| v.is_finite() && v > 0.0)
                    .map(|v| metadata.bpm = v),
                "gain" => parse_number(value, |v: f32| v.is_finite() && v >= 0.0)
                    .map(|v| metadata.gain = v),
                "tail_threshold" => parse_number(value, |v: f32| v.is_finite())
                    .map(|v| metadata.tail_threshold = v),
                "compensate_tail" => parse_number(value, |v: f64| v.is_finite())
                    .map(|v| metadata.compensate_tail_beats = v),
                "half_tempo_tail_flap" => match value.to_ascii_lowercase().as_str() {
                    "true" => Some(metadata.half_tempo_flap = true),
                    "false" => Some(metadata.half_tempo_flap = false),
                    _ => None,
                },
                "head_moves" => parse_head_moves(value).map(|v| metadata.head_moves = v),
                _ => {
                    debug!(key, "ignoring unknown song metadata key");
                    Some(())
                }
            };
            if applied.is_none() {
                faults.push(ConfigFault {
                    field: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        (metadata, faults)
    }

    /// Reads a metadata file. A missing or unreadable file yields defaults.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no song metadata at {}, using defaults", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("failed to read {}: {}, using defaults", path.display(), e);
                return Self::default();
            }
        };
        let (metadata, faults) = Self::parse(&text);
        for fault in &faults {
            warn!("{}: {}, using default", path.display(), fault);
        }
        metadata
    }
}

/// A song ready to enqueue.
#[derive(Debug, Clone)]
pub struct LoadedSong {
    pub metadata: SongMetadata,
    pub chunks: Vec<SongChunk>,
}

fn apply_gain(pcm: &[i16], gain: f32) -> Vec<i16> {
    pcm.iter()
        .map(|&s| (f32::from(s) * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Loads one stereo stem as mono PCM16 at the source rate with gain applied.
fn load_stem(path: &Path, gain: f32) -> Result<Vec<i16>, PlaybackError> {
    let pcm = wav::read_pcm16(path)?;
    let rate = pcm.sample_rate;
    if pcm.channels != 2 || (rate != SOURCE_SAMPLE_RATE && rate != 2 * SOURCE_SAMPLE_RATE) {
        return Err(FormatFault {
            path: path.to_path_buf(),
            expected: format!("stereo at {} or {} Hz", SOURCE_SAMPLE_RATE, 2 * SOURCE_SAMPLE_RATE),
            found: format!("{} channel(s) at {} Hz", pcm.channels, rate),
        }
        .into());
    }
    let mono = downmix_i16(&pcm.samples, 2);
    let mono = if rate == SOURCE_SAMPLE_RATE {
        mono
    } else {
        let resampled = resample_all(
            &convert_i16_to_f32(&mono),
            f64::from(rate),
            f64::from(SOURCE_SAMPLE_RATE),
        )
        .map_err(|e| StreamFault::Resampler(e.to_string()))?;
        convert_f32_to_i16(&resampled)
    };
    Ok(apply_gain(&mono, gain))
}

fn window(pcm: &[i16], start: usize, len: usize) -> &[i16] {
    let start = start.min(pcm.len());
    &pcm[start..(start + len).min(pcm.len())]
}

/// Cuts aligned stems into playback chunks following the main mix.
fn chunk_stems(main: &[i16], vocals: &[i16], drums: &[i16], frames: usize) -> Vec<SongChunk> {
    (0..main.len())
        .step_by(frames.max(1))
        .map(|start| SongChunk {
            main: window(main, start, frames).to_vec(),
            vocals: window(vocals, start, frames).to_vec(),
            drums_level: rms(window(drums, start, frames)),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SongLibrary {
    root: PathBuf,
}

impl SongLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of every directory holding a main mix, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(MAIN_STEM).is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    fn song_dir(&self, name: &str) -> Result<PathBuf, PlaybackError> {
        let plain = !name.is_empty()
            && !name.contains(['/', '\\'])
            && name != "."
            && name != "..";
        let dir = self.root.join(name);
        if !plain || !dir.join(MAIN_STEM).is_file() {
            return Err(PlaybackError::UnknownSong(name.to_string()));
        }
        Ok(dir)
    }

    /// Reads metadata and all three stems. Blocking.
    pub fn load(&self, name: &str, chunk_frames: usize) -> Result<LoadedSong, PlaybackError> {
        let dir = self.song_dir(name)?;
        let metadata = SongMetadata::load(&dir.join(METADATA_FILE));
        let main = load_stem(&dir.join(MAIN_STEM), metadata.gain)?;
        let vocals = load_stem(&dir.join(VOCALS_STEM), metadata.gain)?;
        let drums = load_stem(&dir.join(DRUMS_STEM), metadata.gain)?;
        let chunks = chunk_stems(&main, &vocals, &drums, chunk_frames);
        debug!(name, chunks = chunks.len(), bpm = metadata.bpm, "song loaded");
        Ok(LoadedSong { metadata, chunks })
    }

    /// Plays a song to the end through the engine's song mode.
    ///
    /// Queued speech is discarded when the song clock starts. Every actuator
    /// is stopped afterwards, also when loading fails.
    pub async fn play(&self, name: &str, engine: &PlaybackEngine) -> Result<(), PlaybackError> {
        let library = self.clone();
        let owned = name.to_string();
        let frames = engine.config().chunk_frames();
        let loaded = tokio::task::spawn_blocking(move || library.load(&owned, frames))
            .await
            .map_err(|e| PlaybackError::Task(e.to_string()))
            .and_then(|loaded| loaded);
        let song = match loaded {
            Ok(song) => song,
            Err(e) => {
                engine.stop_actuators();
                return Err(e);
            }
        };

        info!(name, "playing song");
        engine.begin_song(song.metadata);
        for chunk in song.chunks {
            engine.enqueue(PlaybackItem::SongChunk(chunk));
        }
        engine.wait_drained().await;
        engine.end_song();
        engine.stop_actuators();
        info!(name, "song finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::{Channel, SimulatedDriver};
    use crate::config::PlaybackConfig;
    use crate::playback::null_sinks;
    use std::sync::Arc;

    fn write_stem(dir: &Path, file: &str, rate: u32, channels: u16, frames: usize, amplitude: i16) {
        let samples = vec![amplitude; frames * channels as usize];
        wav::write_pcm16(&dir.join(file), &samples, rate, channels).unwrap();
    }

    fn write_song(root: &Path, name: &str, rate: u32, frames: usize) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        write_stem(&dir, MAIN_STEM, rate, 2, frames, 1000);
        write_stem(&dir, VOCALS_STEM, rate, 2, frames, 4000);
        write_stem(&dir, DRUMS_STEM, rate, 2, frames, 3000);
        dir
    }

    #[test]
    fn absent_metadata_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = SongMetadata::load(&dir.path().join(METADATA_FILE));
        assert_eq!(metadata, SongMetadata::default());
        assert_eq!(metadata.bpm, 120.0);
        assert_eq!(metadata.tail_threshold, 1500.0);
        assert!(metadata.head_moves.is_empty());
    }

    #[test]
    fn full_record_parses() {
        let (metadata, faults) = SongMetadata::parse(
            "bpm=96\ngain=1.5\ntail_threshold=1200\ncompensate_tail=0.25\n\
             half_tempo_tail_flap=True\nhead_moves=0.5:2.0,10:1.25\n",
        );
        assert!(faults.is_empty());
        assert_eq!(metadata.bpm, 96.0);
        assert_eq!(metadata.gain, 1.5);
        assert_eq!(metadata.compensate_tail_beats, 0.25);
        assert!(metadata.half_tempo_flap);
        assert_eq!(metadata.beat_length(), 1.25);
        assert_eq!(
            metadata.head_moves,
            vec![
                HeadMove { start: Duration::from_millis(500), duration: Duration::from_secs(2) },
                HeadMove { start: Duration::from_secs(10), duration: Duration::from_millis(1250) },
            ]
        );
    }

    #[test]
    fn invalid_fields_fall_back_independently() {
        let (metadata, faults) =
            SongMetadata::parse("bpm=fast\ngain=2\nhead_moves=1:2,oops\nhalf_tempo_tail_flap=maybe");
        assert_eq!(metadata.bpm, 120.0);
        assert_eq!(metadata.gain, 2.0);
        assert!(metadata.head_moves.is_empty());
        assert!(!metadata.half_tempo_flap);
        let fields: Vec<&str> = faults.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, ["bpm", "head_moves", "half_tempo_tail_flap"]);
    }

    #[test]
    fn zero_bpm_is_rejected() {
        let (metadata, faults) = SongMetadata::parse("bpm=0");
        assert_eq!(metadata.bpm, 120.0);
        assert_eq!(faults.len(), 1);
    }

    #[test]
    fn out_of_range_head_moves_fall_back() {
        for record in ["head_moves=0:1e19", "head_moves=1e20:1", "head_moves=0:-1", "head_moves=0:NaN"] {
            let (metadata, faults) = SongMetadata::parse(&format!("gain=0.5\n{record}"));
            assert!(metadata.head_moves.is_empty(), "{record}");
            assert_eq!(metadata.gain, 0.5);
            assert_eq!(faults.len(), 1, "{record}");
            assert_eq!(faults[0].field, "head_moves");
        }

        let (metadata, faults) = SongMetadata::parse("head_moves=21600:1");
        assert!(faults.is_empty());
        assert_eq!(metadata.head_moves[0].start, Duration::from_secs(21_600));
    }

    #[test]
    fn list_only_shows_complete_bundles() {
        let root = tempfile::tempdir().unwrap();
        write_song(root.path(), "fishing", 24_000, 100);
        write_song(root.path(), "billy", 24_000, 100);
        std::fs::create_dir_all(root.path().join("empty")).unwrap();

        let library = SongLibrary::new(root.path());
        assert_eq!(library.list(), vec!["billy".to_string(), "fishing".to_string()]);
    }

    #[test]
    fn stems_are_downmixed_with_gain() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_song(root.path(), "song", 24_000, 3000);
        std::fs::write(dir.join(METADATA_FILE), "gain=10").unwrap();

        let song = SongLibrary::new(root.path()).load("song", 1200).unwrap();
        assert_eq!(song.chunks.len(), 3);
        assert_eq!(song.chunks[2].main.len(), 600);
        assert_eq!(song.chunks[0].main[0], 10_000);
        // 4000 * 10 saturates.
        assert_eq!(song.chunks[0].vocals[0], i16::MAX);
        assert_eq!(song.chunks[0].drums_level, 30_000.0);
    }

    #[test]
    fn stems_at_48k_are_resampled() {
        let root = tempfile::tempdir().unwrap();
        write_song(root.path(), "song", 48_000, 4800);
        let song = SongLibrary::new(root.path()).load("song", 1200).unwrap();
        let frames: usize = song.chunks.iter().map(|c| c.main.len()).sum();
        assert!((2300..=2500).contains(&frames), "{frames}");
    }

    #[test]
    fn mono_stem_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_song(root.path(), "song", 24_000, 100);
        write_stem(&dir, DRUMS_STEM, 24_000, 1, 100, 0);

        match SongLibrary::new(root.path()).load("song", 1200) {
            Err(PlaybackError::Format(fault)) => assert!(fault.path.ends_with(DRUMS_STEM)),
            other => panic!("unexpected: {:?}", other.map(|s| s.chunks.len())),
        }
    }

    #[test]
    fn names_outside_the_library_are_unknown() {
        let root = tempfile::tempdir().unwrap();
        write_song(root.path(), "song", 24_000, 100);
        let library = SongLibrary::new(root.path().join("songs"));
        for name in ["../song", "", "..", "missing"] {
            assert!(matches!(library.load(name, 1200), Err(PlaybackError::UnknownSong(_))));
        }
    }

    #[tokio::test]
    async fn play_runs_song_mode_and_stops_motors() {
        let root = tempfile::tempdir().unwrap();
        write_song(root.path(), "song", 24_000, 2400);
        let driver = Arc::new(SimulatedDriver::recording());
        let engine = PlaybackEngine::new(PlaybackConfig::default(), driver.clone(), null_sinks());

        SongLibrary::new(root.path()).play("song", &engine).await.unwrap();

        assert_eq!(engine.pending(), 0);
        assert!(engine.song_elapsed().is_none());
        assert!(!driver.drives(Channel::Mouth).is_empty());
        assert!(driver.brakes(Channel::Head) >= 1);
    }

    #[tokio::test]
    async fn failed_load_still_stops_motors() {
        let root = tempfile::tempdir().unwrap();
        let driver = Arc::new(SimulatedDriver::recording());
        let engine = PlaybackEngine::new(PlaybackConfig::default(), driver.clone(), null_sinks());

        let result = SongLibrary::new(root.path()).play("nope", &engine).await;
        assert!(matches!(result, Err(PlaybackError::UnknownSong(_))));
        assert_eq!(driver.brakes(Channel::Tail), 1);
    }
}
