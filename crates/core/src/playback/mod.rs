//! The real-time side: one consumer thread, one output sink, every actuator.
//!
//! Producers (the session, cue and song players) only enqueue. The consumer
//! is started lazily by the first enqueue. A stop signal releases the sink;
//! the consumer then exits if the queue is empty and the next enqueue starts
//! a fresh one.

mod interlude;
mod queue;
mod sink;
mod worker;

pub use sink::{AudioSink, MemorySink, NullSink, SinkFactory, null_sinks};

use crate::actuation::ActuationDriver;
use crate::clock::ActivityClock;
use crate::config::PlaybackConfig;
use crate::lock;
use crate::songs::SongMetadata;
use queue::WorkQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// One song chunk: the mix to play, the vocal stem for the mouth and the
/// percussion level for the tail.
#[derive(Debug, Clone)]
pub struct SongChunk {
    pub main: Vec<i16>,
    pub vocals: Vec<i16>,
    pub drums_level: f32,
}

#[derive(Debug, Clone)]
pub enum PlaybackItem {
    /// Mono PCM16 at the source rate.
    RawChunk(Vec<i16>),
    SongChunk(SongChunk),
    /// Releases the sink once everything before it has played.
    StopSignal,
}

/// The song currently driving the beat and head trackers.
#[derive(Debug, Clone)]
pub(crate) struct SongPlan {
    pub generation: u64,
    pub metadata: Arc<SongMetadata>,
    pub start: Instant,
}

struct Inner {
    config: PlaybackConfig,
    driver: Arc<dyn ActuationDriver>,
    sinks: Box<dyn SinkFactory>,
    queue: WorkQueue,
    activity: ActivityClock,
    song: Mutex<Option<SongPlan>>,
    song_generation: AtomicU64,
}

/// Cheap handle to the playback engine; clones share one queue and consumer.
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<Inner>,
}

impl PlaybackEngine {
    pub fn new(
        config: PlaybackConfig,
        driver: Arc<dyn ActuationDriver>,
        sinks: impl SinkFactory + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                driver,
                sinks: Box::new(sinks),
                queue: WorkQueue::new(),
                activity: ActivityClock::new(),
                song: Mutex::new(None),
                song_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.inner.config
    }

    pub fn driver(&self) -> &Arc<dyn ActuationDriver> {
        &self.inner.driver
    }

    /// Time of the last processed item (or of the last explicit idle mark).
    pub fn activity(&self) -> &ActivityClock {
        &self.inner.activity
    }

    /// Appends to the queue tail and starts a consumer if none is running.
    pub fn enqueue(&self, item: PlaybackItem) {
        if self.inner.queue.push(item) {
            self.spawn_consumer();
        }
    }

    /// Splits mono PCM into chunk-sized raw items.
    pub fn enqueue_pcm(&self, pcm: &[i16]) {
        for chunk in pcm.chunks(self.inner.config.chunk_frames()) {
            self.enqueue(PlaybackItem::RawChunk(chunk.to_vec()));
        }
    }

    /// Drops every queued item without running it and releases drain waiters.
    pub fn request_stop(&self) -> usize {
        let dropped = self.inner.queue.discard();
        if dropped > 0 {
            info!(dropped, "playback stop requested");
        }
        dropped
    }

    /// Resolves once every item enqueued before this call has been handled.
    ///
    /// The target is fixed when this is called, not when the future is first
    /// polled; items enqueued afterwards are not waited for.
    pub fn wait_drained(&self) -> impl Future<Output = ()> + Send + use<> {
        let target = self.inner.queue.last_seq();
        let inner = self.inner.clone();
        async move { inner.queue.wait_through(target).await }
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.queue.consumer_alive()
    }

    /// Marks playback idle now, e.g. after the settle delay of a turn.
    pub fn mark_idle(&self) {
        self.inner.activity.touch();
    }

    /// Discards queued audio and anchors a new song clock at now.
    pub fn begin_song(&self, metadata: SongMetadata) {
        self.request_stop();
        let generation = self.inner.song_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut song = lock(&self.inner.song);
        let now = Instant::now();
        let start = song.as_ref().map_or(now, |prev| prev.start.max(now));
        debug!(generation, bpm = metadata.bpm, "song clock started");
        *song = Some(SongPlan {
            generation,
            metadata: Arc::new(metadata),
            start,
        });
    }

    pub fn end_song(&self) {
        lock(&self.inner.song).take();
    }

    pub fn song_elapsed(&self) -> Option<Duration> {
        lock(&self.inner.song)
            .as_ref()
            .map(|plan| plan.start.elapsed())
    }

    pub(crate) fn song_plan(&self) -> Option<SongPlan> {
        lock(&self.inner.song).clone()
    }

    pub fn stop_actuators(&self) {
        self.inner.driver.stop_all();
    }

    fn spawn_consumer(&self) {
        let engine = self.clone();
        let spawned = std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || worker::run(engine));
        if let Err(e) = spawned {
            error!("failed to start playback consumer: {}", e);
            self.inner.driver.stop_all();
            self.inner.queue.fail();
        }
    }
}
