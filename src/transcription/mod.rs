pub mod chunking;
pub mod extraction;
pub mod timecode;

use serde::{Deserialize, Serialize};

pub use chunking::{plan, Chunk, DEFAULT_MAX_CHUNK_CHARS};
pub use extraction::{extract, synthesize_segments};
pub use timecode::{format_time, Timecode, TimecodeError};

/// One timed caption line, as delivered by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Open-interval intersection with `[start, end]`: touching at a single
    /// instant does not count.
    pub fn intersects(&self, start: f64, end: f64) -> bool {
        self.start < end && self.end > start
    }
}

/// The full transcript text plus whatever duration we know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTranscript {
    pub text: String,
    pub duration_hint: Option<f64>,
}

impl RawTranscript {
    pub fn new(text: impl Into<String>, duration_hint: Option<f64>) -> Self {
        Self {
            text: text.into(),
            duration_hint,
        }
    }

    /// Join segment texts in order. The duration hint falls back to the last
    /// segment's end.
    pub fn from_segments(segments: &[TranscriptSegment], duration_hint: Option<f64>) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let duration_hint = duration_hint.or_else(|| segments.last().map(|s| s.end));
        Self { text, duration_hint }
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Render segments one per line with an absolute `[MM:SS]` marker, which is
/// what the discovery prompt sees when timestamps are available.
pub fn timestamped_text(segments: &[TranscriptSegment]) -> String {
    let mut out = String::new();
    for seg in segments {
        let text = seg.text.trim();
        if text.is_empty() {
            continue;
        }
        out.push('[');
        out.push_str(&Timecode::floor(seg.start).to_string());
        out.push_str("] ");
        out.push_str(text);
        out.push('\n');
    }
    out
}

/// Segments are usable when every one has `end > start` and starts never go
/// backwards.
pub fn is_time_ordered(segments: &[TranscriptSegment]) -> bool {
    segments.iter().all(|s| s.end > s.start)
        && segments.windows(2).all(|w| w[1].start >= w[0].start)
}

pub fn total_text_chars(segments: &[TranscriptSegment]) -> usize {
    segments.iter().map(|s| s.text.trim().chars().count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs() -> Vec<TranscriptSegment> {
        vec![
            TranscriptSegment::new(0.0, 4.0, "Welcome back everyone."),
            TranscriptSegment::new(4.0, 9.5, " Today we talk about  "),
            TranscriptSegment::new(61.2, 65.0, "rate limits."),
        ]
    }

    #[test]
    fn raw_transcript_joins_trimmed_text() {
        let raw = RawTranscript::from_segments(&segs(), None);
        assert_eq!(raw.text, "Welcome back everyone. Today we talk about rate limits.");
        assert_eq!(raw.duration_hint, Some(65.0));
        assert_eq!(raw.word_count(), 9);
    }

    #[test]
    fn timestamped_text_marks_each_line() {
        let text = timestamped_text(&segs());
        assert_eq!(
            text,
            "[00:00] Welcome back everyone.\n[00:04] Today we talk about\n[01:01] rate limits.\n"
        );
    }

    #[test]
    fn ordering_check_rejects_empty_intervals_and_backwards_starts() {
        assert!(is_time_ordered(&segs()));
        let mut bad = segs();
        bad[1].end = bad[1].start;
        assert!(!is_time_ordered(&bad));
        let mut backwards = segs();
        backwards.swap(0, 2);
        assert!(!is_time_ordered(&backwards));
    }

    #[test]
    fn intersection_excludes_touching_edges() {
        let seg = TranscriptSegment::new(10.0, 20.0, "x");
        assert!(seg.intersects(5.0, 10.5));
        assert!(seg.intersects(12.0, 15.0));
        assert!(seg.intersects(0.0, 100.0));
        assert!(!seg.intersects(20.0, 30.0));
        assert!(!seg.intersects(0.0, 10.0));
    }
}
