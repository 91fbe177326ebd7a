use crate::error::{FormatFault, PlaybackError};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Interleaved PCM16 read from a WAV file.
pub(crate) struct Pcm16 {
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
}

fn wav_err(path: &Path) -> impl FnOnce(hound::Error) -> PlaybackError + '_ {
    move |source| PlaybackError::Wav {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads a 16-bit integer WAV; any other sample format is rejected.
pub(crate) fn read_pcm16(path: &Path) -> Result<Pcm16, PlaybackError> {
    let reader = WavReader::open(path).map_err(wav_err(path))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(FormatFault {
            path: path.to_path_buf(),
            expected: "16-bit integer samples".to_string(),
            found: format!("{}-bit {:?}", spec.bits_per_sample, spec.sample_format),
        }
        .into());
    }
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(wav_err(path))?;
    Ok(Pcm16 {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

pub(crate) fn write_pcm16(
    path: &Path,
    samples: &[i16],
    sample_rate: u32,
    channels: u16,
) -> Result<(), PlaybackError> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).map_err(wav_err(path))?;
    for &sample in samples {
        writer.write_sample(sample).map_err(wav_err(path))?;
    }
    writer.finalize().map_err(wav_err(path))
}
