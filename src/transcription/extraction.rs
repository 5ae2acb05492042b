//! Verbatim lookup of transcript text for a time range.
//!
//! Nothing here rewrites or summarizes: the returned text is always built from
//! the caption lines themselves, which is what lets a caller trust an excerpt.

use super::{Timecode, TranscriptSegment};

/// Pieces longer than this many words are cut even without sentence punctuation.
const MAX_SYNTHESIZED_WORDS: usize = 30;

/// Text of every segment intersecting `[start, end]`, in start order, joined
/// with single spaces. An empty string means nothing intersected and must be
/// treated as a rejection.
pub fn extract(segments: &[TranscriptSegment], start: Timecode, end: Timecode) -> String {
    extract_range(segments, start.as_secs_f64(), end.as_secs_f64())
}

pub fn extract_range(segments: &[TranscriptSegment], start: f64, end: f64) -> String {
    let mut hits: Vec<&TranscriptSegment> = segments
        .iter()
        .filter(|s| s.intersects(start, end))
        .collect();
    hits.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

    hits.iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build timed segments out of plain text when the source gave us no
/// timestamps. Pieces end at sentence punctuation (or after a long run of
/// words) and get times proportional to their character offsets across
/// `duration`. Each piece's text is a slice of `text`.
pub fn synthesize_segments(text: &str, duration: f64) -> Vec<TranscriptSegment> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total == 0 || duration <= 0.0 {
        return Vec::new();
    }

    let mut bounds: Vec<(usize, usize)> = Vec::new();
    let mut piece_start = 0;
    let mut words_in_piece = 0;
    for i in 0..total {
        let c = chars[i];
        let next_is_space = chars.get(i + 1).map_or(true, |n| n.is_whitespace());
        if !c.is_whitespace() && next_is_space {
            words_in_piece += 1;
        }
        let sentence_end = matches!(c, '.' | '!' | '?') && next_is_space;
        if sentence_end || (words_in_piece >= MAX_SYNTHESIZED_WORDS && next_is_space) {
            bounds.push((piece_start, i + 1));
            piece_start = i + 1;
            words_in_piece = 0;
        }
    }
    if piece_start < total {
        bounds.push((piece_start, total));
    }

    let scale = duration / total as f64;
    bounds
        .into_iter()
        .filter_map(|(s, e)| {
            let slice: String = chars[s..e].iter().collect();
            let trimmed = slice.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(TranscriptSegment::new(
                s as f64 * scale,
                e as f64 * scale,
                trimmed,
            ))
        })
        .collect()
}
