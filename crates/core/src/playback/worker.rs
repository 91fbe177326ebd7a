use super::interlude::Interlude;
use super::{AudioSink, Inner, PlaybackEngine, PlaybackItem, SongChunk, SongPlan};
use crate::actuation::{Channel, TAIL_FLAP, spawn_head_extend, spawn_tail_flap};
use crate::error::{PlaybackError, StreamFault};
use crate::sync::{BeatTailSync, EnvelopeMouthSync, HeadScheduler};
use billy_native_utils::audio::{StreamResampler, convert_i16_to_f32};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Releases everyone if the consumer thread unwinds: motors braked, queue
/// emptied, drain waiters woken, and the next enqueue starts a new consumer.
struct UnwindGuard(Arc<Inner>);

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("playback consumer panicked");
            self.0.driver.stop_all();
            self.0.queue.fail();
        }
    }
}

/// Consumer loop. Each stop signal releases the sink before the consumer
/// retires, so at most one sink is open at a time. Work that arrived while
/// the sink was being released reopens it on this same thread.
pub(super) fn run(engine: PlaybackEngine) {
    let inner = engine.inner.clone();
    let _guard = UnwindGuard(inner.clone());
    info!("playback consumer started");

    loop {
        let mut worker = match Worker::open(engine.clone()) {
            Ok(worker) => worker,
            Err(e) => {
                error!("playback consumer could not open its sink: {}", e);
                inner.driver.stop_all();
                inner.queue.fail();
                return;
            }
        };
        let stop_seq = match worker.serve() {
            Ok(seq) => seq,
            Err(e) => {
                error!("playback consumer failed: {}", e);
                drop(worker);
                inner.driver.stop_all();
                inner.queue.fail();
                return;
            }
        };
        drop(worker);
        debug!("output sink released");
        inner.queue.complete(stop_seq);
        inner.activity.touch();
        if inner.queue.retire_if_idle() {
            break;
        }
    }
    info!("playback consumer stopped");
}

struct SongTracks {
    generation: u64,
    start: Instant,
    beat: BeatTailSync,
    head: HeadScheduler,
}

impl SongTracks {
    fn new(plan: &SongPlan) -> Self {
        Self {
            generation: plan.generation,
            start: plan.start,
            beat: BeatTailSync::new(&plan.metadata),
            head: HeadScheduler::new(plan.metadata.head_moves.clone()),
        }
    }
}

struct Worker {
    engine: PlaybackEngine,
    sink: Box<dyn AudioSink>,
    resampler: StreamResampler,
    mouth: EnvelopeMouthSync,
    song: Option<SongTracks>,
    interlude: Interlude,
}

impl Worker {
    fn open(engine: PlaybackEngine) -> Result<Self, PlaybackError> {
        let config = engine.config().clone();
        let sink = engine.inner.sinks.open()?;
        let resampler = StreamResampler::new(
            f64::from(config.source_rate),
            f64::from(config.output_rate),
            config.chunk_frames(),
        )
        .map_err(|e| StreamFault::Resampler(e.to_string()))?;
        Ok(Self {
            engine,
            sink,
            resampler,
            mouth: EnvelopeMouthSync::new(config.mouth),
            song: None,
            interlude: Interlude::new(),
        })
    }

    /// Plays items until a stop signal; returns its sequence number once the
    /// resampler tail is written.
    fn serve(&mut self) -> Result<u64, PlaybackError> {
        let inner = self.engine.inner.clone();
        let queue = &inner.queue;
        loop {
            let (seq, item) = queue.pop();
            let now = Instant::now();
            match item {
                PlaybackItem::StopSignal => {
                    self.flush()?;
                    return Ok(seq);
                }
                PlaybackItem::RawChunk(pcm) => {
                    self.track_song(now)?;
                    self.play_speech(&pcm)?;
                }
                PlaybackItem::SongChunk(chunk) => {
                    self.track_song(now)?;
                    self.play_song_chunk(&chunk, now)?;
                }
            }
            // Nothing queued behind this item: push out the resampler tail now.
            if queue.is_empty() {
                self.flush()?;
            }
            queue.complete(seq);
            inner.activity.touch();
        }
    }

    fn span_of(&self, frames: usize) -> Duration {
        Duration::from_secs_f64(frames as f64 / f64::from(self.engine.config().source_rate))
    }

    /// Follows the engine's song plan and runs the once-per-item head check.
    fn track_song(&mut self, now: Instant) -> Result<(), PlaybackError> {
        let driver = self.engine.driver().clone();
        let plan = self.engine.song_plan();
        let current = self.song.as_ref().map(|t| t.generation);
        if plan.as_ref().map(|p| p.generation) != current {
            if self.song.as_ref().is_some_and(|t| t.head.is_extended()) {
                driver.brake(Channel::Head)?;
            }
            self.song = plan.as_ref().map(SongTracks::new);
        }

        let Some(tracks) = self.song.as_mut() else {
            return Ok(());
        };
        let tick = tracks.head.tick(now, tracks.start);
        if tick.release {
            debug!("releasing head");
            driver.brake(Channel::Head)?;
        }
        if let Some(hold) = tick.extend {
            debug!(?hold, "head move");
            spawn_head_extend(&driver);
        }
        Ok(())
    }

    fn play_speech(&mut self, pcm: &[i16]) -> Result<(), PlaybackError> {
        let driver = self.engine.driver().clone();
        let frames = self.engine.config().chunk_frames();
        for sub in pcm.chunks(frames) {
            self.mouth
                .on_chunk(sub, self.span_of(sub.len()), Instant::now(), driver.as_ref())?;
            self.render(sub)?;
        }
        if self.engine.config().interludes && self.song.is_none() {
            self.interlude.advance(pcm.len(), &driver);
        }
        Ok(())
    }

    fn play_song_chunk(&mut self, chunk: &SongChunk, now: Instant) -> Result<(), PlaybackError> {
        let driver = self.engine.driver().clone();
        let span = self.span_of(chunk.main.len());
        self.mouth.on_chunk(&chunk.vocals, span, now, driver.as_ref())?;
        if let Some(tracks) = self.song.as_mut() {
            let elapsed = now.saturating_duration_since(tracks.start);
            if tracks
                .beat
                .on_chunk(elapsed, chunk.drums_level, tracks.head.is_extended())
            {
                debug!(?elapsed, level = chunk.drums_level, "beat tail flap");
                spawn_tail_flap(&driver, TAIL_FLAP);
            }
        }
        self.render(&chunk.main)
    }

    fn render(&mut self, pcm: &[i16]) -> Result<(), PlaybackError> {
        let resampled = self
            .resampler
            .push(&convert_i16_to_f32(pcm))
            .map_err(|e| StreamFault::Resampler(e.to_string()))?;
        self.write(&resampled)
    }

    fn flush(&mut self) -> Result<(), PlaybackError> {
        let tail = self
            .resampler
            .flush()
            .map_err(|e| StreamFault::Resampler(e.to_string()))?;
        self.write(&tail)
    }

    /// Mono f32 at the output rate to stereo PCM16, with volume and saturation.
    fn write(&mut self, mono: &[f32]) -> Result<(), PlaybackError> {
        if mono.is_empty() {
            return Ok(());
        }
        let volume = self.engine.config().volume;
        let frames: Vec<i16> = mono
            .iter()
            .flat_map(|&s| {
                let v = (s * volume * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                [v, v]
            })
            .collect();
        self.sink.write(&frames)?;
        Ok(())
    }
}
