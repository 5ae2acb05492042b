use std::collections::HashSet;

use super::CandidateSegment;

/// Two segments may share at most this fraction of the shorter one.
pub const MAX_OVERLAP_FRACTION: f64 = 0.5;

/// Shared time over the shorter duration. Zero-length segments never overlap.
pub fn overlap_fraction(a: &CandidateSegment, b: &CandidateSegment) -> f64 {
    let (a_start, a_end) = (a.start_time.seconds(), a.end_time.seconds());
    let (b_start, b_end) = (b.start_time.seconds(), b.end_time.seconds());
    let shared = a_end.min(b_end).saturating_sub(a_start.max(b_start));
    let shorter = a.duration_seconds().min(b.duration_seconds());
    if shorter == 0 {
        return 0.0;
    }
    shared as f64 / shorter as f64
}

/// Drop exact duplicates and anything overlapping an earlier pick by more
/// than half. Candidates are swept in (start, end) order and the first one
/// wins, so running this on its own output changes nothing.
pub fn resolve(candidates: Vec<CandidateSegment>) -> Vec<CandidateSegment> {
    let mut sorted = candidates;
    sorted.sort_by_key(|c| (c.start_time, c.end_time));

    let mut seen = HashSet::new();
    let mut accepted: Vec<CandidateSegment> = Vec::new();
    for candidate in sorted {
        if !seen.insert((candidate.start_time, candidate.end_time)) {
            tracing::debug!(title = %candidate.title, "Dropping duplicate candidate");
            continue;
        }
        if let Some(clash) = accepted
            .iter()
            .find(|kept| overlap_fraction(kept, &candidate) > MAX_OVERLAP_FRACTION)
        {
            tracing::debug!(
                title = %candidate.title,
                overlaps = %clash.title,
                "Dropping overlapping candidate"
            );
            continue;
        }
        accepted.push(candidate);
    }
    accepted
}

/// For each entry of `before`, whether it survived into `after`. Matching is
/// on the whole candidate and each survivor is claimed once, so two proposals
/// sharing a time range are told apart by title and chunk.
pub fn survivors(before: &[CandidateSegment], after: &[CandidateSegment]) -> Vec<bool> {
    let mut remaining: Vec<Option<&CandidateSegment>> = after.iter().map(Some).collect();
    before
        .iter()
        .map(|candidate| match remaining.iter_mut().find(|slot| slot.is_some_and(|kept| kept == candidate)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        })
        .collect()
}
