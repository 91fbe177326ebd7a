//! Sound card plumbing: the playback sink and microphone capture.

use anyhow::{Context, Result};
use billy_core::config::{OUTPUT_SAMPLE_RATE, SOURCE_SAMPLE_RATE};
use billy_core::error::StreamFault;
use billy_core::playback::{AudioSink, SinkFactory};
use billy_core::session::MicInput;
use billy_native_utils::audio::{self, StreamResampler};
use billy_native_utils::device;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, SampleRate, StreamConfig};
use ringbuf::HeapProd;
use ringbuf::traits::{Consumer, Producer, Split};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Device buffer size of the input stream, in frames.
pub const INPUT_CHUNK_SIZE: usize = 1024;
/// Device buffer size of the output stream, in frames.
pub const OUTPUT_CHUNK_SIZE: usize = 1024;
/// Audio buffered ahead of the output device. Kept short so the mouth stays
/// in step with what is heard.
pub const OUTPUT_LATENCY_MS: usize = 100;
/// Mic frame handed to the session: 20 ms at the source rate.
pub const MIC_FRAME: usize = 480;

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Interleaved stereo output through cpal.
///
/// `write` blocks while the ring buffer is full, which paces the playback
/// consumer at the device rate.
pub struct CpalSink {
    _stream: cpal::Stream,
    producer: HeapProd<f32>,
}

impl CpalSink {
    pub fn open(device_name: Option<&str>) -> Result<Self, StreamFault> {
        let device = device::get_or_default_output(device_name)
            .map_err(|e| StreamFault::Open(format!("{e:#}")))?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let default = device.default_output_config().map_err(open_error)?;
        let config = StreamConfig {
            channels: default.channels(),
            sample_rate: SampleRate(OUTPUT_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Fixed(FrameCount::from(OUTPUT_CHUNK_SIZE as u32)),
        };
        let channels = config.channels as usize;

        let capacity = OUTPUT_SAMPLE_RATE as usize * 2 * OUTPUT_LATENCY_MS / 1000;
        let (producer, mut consumer) = audio::shared_buffer(capacity).split();
        let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                let left = consumer.try_pop().unwrap_or(0.0);
                let right = consumer.try_pop().unwrap_or(left);
                match frame {
                    [] => {}
                    [mono] => *mono = (left + right) / 2.0,
                    [l, r, rest @ ..] => {
                        *l = left;
                        *r = right;
                        rest.fill(0.0);
                    }
                }
            }
        };

        let stream = device
            .build_output_stream(
                &config,
                output_data_fn,
                move |err| error!("An error occurred on output stream: {}", err),
                None,
            )
            .map_err(open_error)?;
        stream.play().map_err(open_error)?;
        info!(device = %name, channels, "output stream open");
        Ok(Self {
            _stream: stream,
            producer,
        })
    }
}

fn open_error(e: impl std::fmt::Display) -> StreamFault {
    StreamFault::Open(e.to_string())
}

impl AudioSink for CpalSink {
    fn write(&mut self, frames: &[i16]) -> Result<(), StreamFault> {
        let samples = audio::convert_i16_to_f32(frames);
        let mut rest = samples.as_slice();
        let deadline = Instant::now() + WRITE_TIMEOUT;
        loop {
            let pushed = self.producer.push_slice(rest);
            rest = &rest[pushed..];
            if rest.is_empty() {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(StreamFault::Write("output device stopped draining".to_string()));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Sinks on the named output device, or the default one.
pub fn cpal_sinks(device_name: Option<String>) -> impl SinkFactory {
    move || -> Result<Box<dyn AudioSink>, StreamFault> {
        Ok(Box::new(CpalSink::open(device_name.as_deref())?))
    }
}

/// Keeps the input stream alive; capture stops when dropped.
pub struct MicCapture {
    _stream: cpal::Stream,
}

impl MicCapture {
    /// Captures mono audio, resamples it to the source rate and feeds it to
    /// the session in fixed frames.
    pub fn start(device_name: Option<&str>, mic: MicInput) -> Result<Self> {
        let input = device::get_or_default_input(device_name)
            .context("Failed to get default audio input device")?;
        info!("Using input device: {:?}", input.name()?);

        let default = input
            .default_input_config()
            .context("Failed to get default input config")?;
        let input_config = StreamConfig {
            channels: default.channels(),
            sample_rate: default.sample_rate(),
            buffer_size: cpal::BufferSize::Fixed(FrameCount::from(INPUT_CHUNK_SIZE as u32)),
        };
        let channel_count = input_config.channels as usize;
        info!("Input stream config: {:?}", &input_config);

        let mut resampler = StreamResampler::new(
            input_config.sample_rate.0 as f64,
            SOURCE_SAMPLE_RATE as f64,
            INPUT_CHUNK_SIZE,
        )?;
        let mut pending: Vec<i16> = Vec::with_capacity(MIC_FRAME * 2);
        let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono = if channel_count > 1 {
                data.chunks(channel_count)
                    .map(|c| c.iter().sum::<f32>() / channel_count as f32)
                    .collect::<Vec<f32>>()
            } else {
                data.to_vec()
            };
            match resampler.push(&mono) {
                Ok(resampled) => pending.extend(audio::convert_f32_to_i16(&resampled)),
                Err(e) => {
                    warn!("Failed to resample mic audio: {}", e);
                    return;
                }
            }
            while pending.len() >= MIC_FRAME {
                let frame: Vec<i16> = pending.drain(..MIC_FRAME).collect();
                mic.push(frame);
            }
        };

        let stream = input.build_input_stream(
            &input_config,
            input_data_fn,
            move |err| error!("An error occurred on input stream: {}", err),
            None,
        )?;
        stream.play()?;
        Ok(Self { _stream: stream })
    }
}
