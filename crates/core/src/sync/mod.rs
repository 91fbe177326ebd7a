//! Signal-to-motion helpers driven by the playback consumer.
mod beat;
mod head;
mod mouth;

pub use beat::BeatTailSync;
pub use head::{HeadMove, HeadScheduler, HeadTick};
pub use mouth::{EnvelopeMouthSync, MouthAction};

/// Amplitude summary of one PCM16 chunk.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Envelope {
    pub rms: f32,
    pub peak: f32,
}

impl Envelope {
    pub fn of(pcm: &[i16]) -> Self {
        if pcm.is_empty() {
            return Self::default();
        }
        let mut sum_sq = 0.0f64;
        let mut peak = 0i32;
        for &s in pcm {
            let s = i32::from(s);
            sum_sq += f64::from(s * s);
            peak = peak.max(s.abs());
        }
        Self {
            rms: (sum_sq / pcm.len() as f64).sqrt() as f32,
            peak: peak as f32,
        }
    }
}

/// RMS of a PCM16 chunk; 0 for an empty chunk.
pub fn rms(pcm: &[i16]) -> f32 {
    Envelope::of(pcm).rms
}

/// Linear interpolation of `x` from `from` onto `to`, clamped at both ends.
pub(crate) fn interp(x: f32, from: (f32, f32), to: (f32, f32)) -> f32 {
    let t = ((x - from.0) / (from.1 - from.0)).clamp(0.0, 1.0);
    to.0 + t * (to.1 - to.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_of_square_wave() {
        let env = Envelope::of(&[1000, -1000, 1000, -1000]);
        assert_eq!(env.rms, 1000.0);
        assert_eq!(env.peak, 1000.0);
        assert_eq!(Envelope::of(&[]), Envelope::default());
        assert_eq!(rms(&[i16::MIN]), 32768.0);
    }

    #[test]
    fn interp_clamps_outside_the_range() {
        assert_eq!(interp(0.0, (0.005, 0.15), (25.0, 100.0)), 25.0);
        assert_eq!(interp(1.0, (0.005, 0.15), (25.0, 100.0)), 100.0);
    }
}
