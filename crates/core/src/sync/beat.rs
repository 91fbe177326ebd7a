use crate::songs::SongMetadata;
use std::time::Duration;

/// Retrospective beat detector for the tail.
///
/// Each chunk contributes its percussion level to a running peak. When the
/// (lead-corrected) playback time crosses the next beat boundary, the peak of
/// the window just finished decides whether the tail flaps.
#[derive(Debug, Clone)]
pub struct BeatTailSync {
    beat_length: f64,
    lead: f64,
    threshold: f32,
    peak: f32,
    next_beat: f64,
}

impl BeatTailSync {
    pub fn new(metadata: &SongMetadata) -> Self {
        let beat_length = metadata.beat_length();
        Self {
            beat_length,
            lead: metadata.compensate_tail_beats * beat_length,
            threshold: metadata.tail_threshold,
            peak: 0.0,
            next_beat: 0.0,
        }
    }

    pub fn beat_length(&self) -> f64 {
        self.beat_length
    }

    /// Returns true when this chunk closes a beat window loud enough to flap.
    pub fn on_chunk(&mut self, elapsed: Duration, drums_level: f32, head_extended: bool) -> bool {
        self.peak = self.peak.max(drums_level);
        let adjusted = elapsed.as_secs_f64() + self.lead;
        if adjusted < self.next_beat {
            return false;
        }
        let flap = self.peak > self.threshold && !head_extended;
        self.peak = 0.0;
        self.next_beat += self.beat_length;
        flap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(metadata: &SongMetadata, head_extended: bool) -> Vec<u64> {
        let mut sync = BeatTailSync::new(metadata);
        let mut flaps = Vec::new();
        for i in 0..40u64 {
            let elapsed = Duration::from_millis(50 * i);
            let level = if i % 10 == 3 { 2000.0 } else { 0.0 };
            if sync.on_chunk(elapsed, level, head_extended) {
                flaps.push(50 * i);
            }
        }
        flaps
    }

    #[test]
    fn one_flap_per_loud_beat_window() {
        let metadata = SongMetadata::default();
        assert_eq!(metadata.beat_length(), 0.5);
        // The window before the first boundary is empty, so it stays quiet.
        assert_eq!(run(&metadata, false), vec![500, 1000, 1500]);
    }

    #[test]
    fn no_flaps_while_head_is_extended() {
        assert!(run(&SongMetadata::default(), true).is_empty());
    }

    #[test]
    fn quiet_windows_do_not_flap() {
        let metadata = SongMetadata {
            tail_threshold: 2500.0,
            ..SongMetadata::default()
        };
        assert!(run(&metadata, false).is_empty());
    }

    #[test]
    fn half_tempo_doubles_beat_length() {
        let metadata = SongMetadata {
            half_tempo_flap: true,
            ..SongMetadata::default()
        };
        assert_eq!(run(&metadata, false), vec![1000]);
    }

    #[test]
    fn compensation_moves_boundaries_earlier() {
        let metadata = SongMetadata {
            compensate_tail_beats: 0.5,
            ..SongMetadata::default()
        };
        let sync = BeatTailSync::new(&metadata);
        assert_eq!(sync.lead, 0.25);
        assert_eq!(run(&metadata, false), vec![250, 750, 1250, 1750]);
    }
}
