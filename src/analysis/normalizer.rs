//! Alternate duration policy: instead of insisting every proposal already sits
//! in the window, reshape short and long candidates so they do.

use serde::{Deserialize, Serialize};

use super::{dedup, CandidateSegment, DurationWindow};
use crate::transcription::Timecode;

pub const DEFAULT_FLOOR_SECONDS: u32 = 30;

/// Short candidates this close together are merged into one.
const MERGE_GAP_SECONDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DurationPolicy {
    /// Only candidates already inside the window survive.
    #[default]
    Strict,
    /// Accept any positive length from discovery, then merge, extend and
    /// split so the result lies in `[min_seconds, window max]`.
    Floor { min_seconds: u32 },
}

impl DurationPolicy {
    pub fn floor() -> Self {
        DurationPolicy::Floor {
            min_seconds: DEFAULT_FLOOR_SECONDS,
        }
    }

    /// What discovery should accept from the service.
    pub fn discovery_window(&self, window: DurationWindow) -> DurationWindow {
        match self {
            DurationPolicy::Strict => window,
            DurationPolicy::Floor { .. } => DurationWindow::new(1, window.max_seconds),
        }
    }

    /// What the final validation gate enforces.
    pub fn validation_window(&self, window: DurationWindow) -> DurationWindow {
        match self {
            DurationPolicy::Strict => window,
            DurationPolicy::Floor { min_seconds } => DurationWindow::new(*min_seconds, window.max_seconds),
        }
    }
}

/// Reshape candidates towards `[floor, max]`, never past `transcript_end`.
/// The result is re-resolved so overlap rules still hold after extension.
pub fn normalize(
    candidates: Vec<CandidateSegment>,
    floor: u32,
    max: u32,
    transcript_end: u32,
) -> Vec<CandidateSegment> {
    let mut sorted = candidates;
    sorted.sort_by_key(|c| (c.start_time, c.end_time));

    let merged = merge_short(sorted, floor);
    let mut out = Vec::new();
    for candidate in merged {
        let candidate = if candidate.duration_seconds() < floor {
            extend(candidate, floor, transcript_end)
        } else {
            candidate
        };
        if candidate.duration_seconds() > max {
            out.extend(split(candidate, floor, max));
        } else {
            out.push(candidate);
        }
    }
    dedup::resolve(out)
}

fn merge_short(sorted: Vec<CandidateSegment>, floor: u32) -> Vec<CandidateSegment> {
    let mut out: Vec<CandidateSegment> = Vec::new();
    for candidate in sorted {
        if let Some(last) = out.last_mut() {
            let gap = candidate.start_time.seconds().saturating_sub(last.end_time.seconds());
            if last.duration_seconds() < floor
                && candidate.duration_seconds() < floor
                && gap <= MERGE_GAP_SECONDS
            {
                tracing::debug!(into = %last.title, merged = %candidate.title, "Merging short candidates");
                last.end_time = last.end_time.max(candidate.end_time);
                continue;
            }
        }
        out.push(candidate);
    }
    out
}

/// Grow symmetrically to `floor`, shifting when one side hits a boundary.
fn extend(mut candidate: CandidateSegment, floor: u32, transcript_end: u32) -> CandidateSegment {
    let start = candidate.start_time.seconds();
    let end = candidate.end_time.seconds();
    let need = floor.saturating_sub(end.saturating_sub(start));
    let left = need / 2;

    let mut new_start = start.saturating_sub(left);
    let mut new_end = new_start.saturating_add(floor).max(end);
    if new_end > transcript_end {
        new_end = transcript_end.max(end);
        new_start = new_end.saturating_sub(floor);
    }
    candidate.start_time = Timecode::from_seconds(new_start);
    candidate.end_time = Timecode::from_seconds(new_end);
    candidate
}

/// Cut into equal pieces inside the window. When equal pieces would fall
/// below the floor, take whole `max`-length pieces and drop the tail.
fn split(candidate: CandidateSegment, floor: u32, max: u32) -> Vec<CandidateSegment> {
    let start = candidate.start_time.seconds();
    let duration = candidate.duration_seconds();
    let max = max.max(1);

    let mut count = duration.div_ceil(max);
    let mut piece = duration / count;
    if piece < floor {
        count = (duration / max).max(1);
        piece = max;
    }
    // Spread the remainder of an even split one second at a time.
    let even = piece < max;
    let mut remainder = if even { duration - piece * count } else { 0 };

    let mut pieces = Vec::with_capacity(count as usize);
    let mut at = start;
    for part in 1..=count {
        let mut len = piece;
        if remainder > 0 {
            len += 1;
            remainder -= 1;
        }
        pieces.push(CandidateSegment::new(
            format!("{} (part {})", candidate.title, part),
            Timecode::from_seconds(at),
            Timecode::from_seconds(at + len),
            candidate.chunk_index,
        ));
        at += len;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(title: &str, start: u32, end: u32) -> CandidateSegment {
        CandidateSegment::new(title, Timecode::from_seconds(start), Timecode::from_seconds(end), 0)
    }

    #[test]
    fn policy_windows() {
        let window = DurationWindow::new(60, 90);
        assert_eq!(DurationPolicy::Strict.discovery_window(window), window);
        assert_eq!(DurationPolicy::floor().discovery_window(window), DurationWindow::new(1, 90));
        assert_eq!(DurationPolicy::floor().validation_window(window), DurationWindow::new(30, 90));
    }

    #[test]
    fn merges_nearby_short_candidates() {
        let out = normalize(vec![cand("a", 100, 112), cand("b", 115, 130)], 30, 90, 1000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "a");
        assert!(out[0].duration_seconds() >= 30);
        assert!(out[0].start_time.seconds() <= 100);
        assert!(out[0].end_time.seconds() >= 130);
    }

    #[test]
    fn extends_symmetrically_and_clamps_at_the_edges() {
        let out = normalize(vec![cand("mid", 100, 110)], 30, 90, 1000);
        assert_eq!((out[0].start_time.seconds(), out[0].end_time.seconds()), (90, 120));

        let out = normalize(vec![cand("head", 2, 12)], 30, 90, 1000);
        assert_eq!((out[0].start_time.seconds(), out[0].end_time.seconds()), (0, 30));

        let out = normalize(vec![cand("tail", 990, 998)], 30, 90, 1000);
        assert_eq!((out[0].start_time.seconds(), out[0].end_time.seconds()), (970, 1000));
    }

    #[test]
    fn splits_long_candidates_into_window_sized_pieces() {
        let out = normalize(vec![cand("long", 0, 200)], 30, 90, 1000);
        assert_eq!(out.len(), 3);
        let total: u32 = out.iter().map(|c| c.duration_seconds()).sum();
        assert_eq!(total, 200);
        for piece in &out {
            assert!(piece.duration_seconds() >= 30 && piece.duration_seconds() <= 90);
        }
        assert_eq!(out[0].title, "long (part 1)");
    }

    #[test]
    fn high_floor_split_drops_the_tail() {
        let out = normalize(vec![cand("long", 0, 100)], 60, 90, 1000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].duration_seconds(), 90);
    }

    #[test]
    fn serde_shape() {
        let policy: DurationPolicy = toml::from_str("mode = \"floor\"\nmin_seconds = 25").unwrap();
        assert_eq!(policy, DurationPolicy::Floor { min_seconds: 25 });
    }
}
