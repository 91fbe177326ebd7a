use crate::error::StreamFault;
use crate::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Output device accepting interleaved stereo PCM16 at the output rate.
///
/// Sinks are opened on the playback thread and never leave it, so they need
/// not be `Send`.
pub trait AudioSink {
    /// Blocks until every frame has been accepted by the device.
    fn write(&mut self, frames: &[i16]) -> Result<(), StreamFault>;
}

/// Opens a fresh sink each time a playback consumer starts.
pub trait SinkFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioSink>, StreamFault>;
}

impl<F> SinkFactory for F
where
    F: Fn() -> Result<Box<dyn AudioSink>, StreamFault> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn AudioSink>, StreamFault> {
        self()
    }
}

/// Discards audio. Used when running without a sound card.
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _frames: &[i16]) -> Result<(), StreamFault> {
        Ok(())
    }
}

pub fn null_sinks() -> impl SinkFactory {
    || -> Result<Box<dyn AudioSink>, StreamFault> { Ok(Box::new(NullSink)) }
}

/// Keeps everything written; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    samples: Arc<Mutex<Vec<i16>>>,
    writes: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<i16> {
        lock(&self.samples).clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// A factory handing out sinks that write into this one.
    pub fn factory(&self) -> impl SinkFactory + use<> {
        let sink = self.clone();
        move || -> Result<Box<dyn AudioSink>, StreamFault> { Ok(Box::new(sink.clone())) }
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, frames: &[i16]) -> Result<(), StreamFault> {
        lock(&self.samples).extend_from_slice(frames);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
