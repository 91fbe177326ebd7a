use base64::Engine;
use ringbuf::HeapRb;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Wire rate of the realtime API: PCM16, mono.
pub const REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;
/// Rate of the output sink: PCM16, stereo.
pub const OUTPUT_SAMPLE_RATE: f64 = 48000.0;

/// Creates a mono resampler converting `in_sampling_rate` to `out_sampling_rate`.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Splits samples into fixed-size chunks, zero padding the last one.
pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_size, 0.0);
            chunk
        })
        .collect()
}

/// A fixed-input resampler fed with arbitrarily sized pieces.
///
/// Input is carried over between calls so only whole resampler chunks are
/// processed; `flush` pads whatever remains and trims the padding back off
/// the output.
pub struct StreamResampler {
    resampler: FastFixedIn<f32>,
    ratio: f64,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_sampling_rate: f64, out_sampling_rate: f64, chunk_size: usize) -> anyhow::Result<Self> {
        Ok(Self {
            resampler: create_resampler(in_sampling_rate, out_sampling_rate, chunk_size)?,
            ratio: out_sampling_rate / in_sampling_rate,
            pending: Vec::with_capacity(chunk_size * 2),
        })
    }

    /// Samples held back waiting for a full chunk.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, samples: &[f32]) -> anyhow::Result<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let chunk_size = self.resampler.input_frames_next();
        let mut out = Vec::with_capacity((self.pending.len() as f64 * self.ratio) as usize);
        while self.pending.len() >= chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..chunk_size).collect();
            let mut processed = self.resampler.process(&[chunk], None)?;
            out.append(&mut processed[0]);
        }
        Ok(out)
    }

    pub fn flush(&mut self) -> anyhow::Result<Vec<f32>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let expected = (self.pending.len() as f64 * self.ratio).round() as usize;
        let chunk_size = self.resampler.input_frames_next();
        let mut out = Vec::with_capacity(expected);
        for chunk in split_for_chunks(&self.pending, chunk_size) {
            let mut processed = self.resampler.process(&[chunk], None)?;
            out.append(&mut processed[0]);
        }
        self.pending.clear();
        out.truncate(expected);
        Ok(out)
    }
}

/// Resamples a whole buffer in one go.
pub fn resample_all(samples: &[f32], in_sampling_rate: f64, out_sampling_rate: f64) -> anyhow::Result<Vec<f32>> {
    if in_sampling_rate == out_sampling_rate {
        return Ok(samples.to_vec());
    }
    let mut resampler = StreamResampler::new(in_sampling_rate, out_sampling_rate, 1024)?;
    let mut out = resampler.push(samples)?;
    out.extend(resampler.flush()?);
    Ok(out)
}

/// Creates a new ring buffer on the heap for shared audio data.
pub fn shared_buffer(size: usize) -> HeapRb<f32> {
    HeapRb::new(size)
}

/// Decodes a base64 string into little-endian PCM16 samples.
pub fn decode_i16(base64_fragment: &str) -> Result<Vec<i16>, base64::DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(base64_fragment)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Encodes PCM16 samples as little-endian bytes in base64.
pub fn encode_i16(pcm16: &[i16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm16.to_binary())
}

pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Averages interleaved frames down to one channel.
pub fn downmix_i16(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Duplicates mono samples into interleaved stereo frames.
pub fn upmix_stereo(mono: &[i16]) -> Vec<i16> {
    mono.iter().flat_map(|&s| [s, s]).collect()
}

/// A trait for converting audio sample types to a binary representation (Vec<u8>).
pub trait ToBinary {
    fn to_binary(&self) -> Vec<u8>;
}

impl ToBinary for [i16] {
    fn to_binary(&self) -> Vec<u8> {
        self.iter().flat_map(|&sample| sample.to_le_bytes()).collect()
    }
}
