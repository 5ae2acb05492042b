//! Splits transcript text into windows small enough for one discovery request.

use serde::{Deserialize, Serialize};

/// Sits well under the text-generation service's input ceiling, leaving room
/// for the prompt itself.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 12_000;

/// A contiguous slice of the transcript. Offsets count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub index: usize,
    pub total_chunks: usize,
    pub char_start: usize,
    pub char_end: usize,
}

impl Chunk {
    /// Approximate time range of this chunk by linear interpolation over the
    /// whole video.
    pub fn approx_time_range(&self, total_chars: usize, video_duration: f64) -> (f64, f64) {
        if total_chars == 0 {
            return (0.0, video_duration);
        }
        let scale = video_duration / total_chars as f64;
        (self.char_start as f64 * scale, self.char_end as f64 * scale)
    }

    pub fn char_len(&self) -> usize {
        self.char_end - self.char_start
    }
}

/// Partition `raw_text` into gap-free windows of at most `max_chunk_chars`
/// characters. Concatenating the chunks in order gives back the input.
///
/// A window ends at the last whitespace of its second half when there is one,
/// so words are not cut in two. A zero limit is treated as one.
pub fn plan(raw_text: &str, max_chunk_chars: usize) -> Vec<Chunk> {
    let max = max_chunk_chars.max(1);
    let chars: Vec<char> = raw_text.chars().collect();
    let total = chars.len();

    let mut bounds: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    while start < total {
        let hard_end = (start + max).min(total);
        let end = if hard_end == total {
            hard_end
        } else {
            let floor = start + max / 2;
            (floor..hard_end)
                .rev()
                .find(|&i| chars[i].is_whitespace())
                .map(|i| i + 1)
                .unwrap_or(hard_end)
        };
        bounds.push((start, end));
        start = end;
    }

    let total_chunks = bounds.len();
    bounds
        .into_iter()
        .enumerate()
        .map(|(index, (char_start, char_end))| Chunk {
            text: chars[char_start..char_end].iter().collect(),
            index,
            total_chunks,
            char_start,
            char_end,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejoin(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn partition_is_lossless_for_many_sizes() {
        let text = "Bonjour à tous, aujourd'hui on parle de café ☕ et de limites. ".repeat(37);
        for max in [1, 2, 3, 7, 16, 64, 100, 999, 10_000] {
            let chunks = plan(&text, max);
            assert_eq!(rejoin(&chunks), text, "max = {max}");
            assert!(chunks.iter().all(|c| c.char_len() <= max && c.char_len() > 0));
            for pair in chunks.windows(2) {
                assert_eq!(pair[0].char_end, pair[1].char_start);
            }
            assert_eq!(chunks.last().unwrap().char_end, text.chars().count());
        }
    }

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(plan("", 100).is_empty());
    }

    #[test]
    fn zero_limit_behaves_like_one() {
        let chunks = plan("abc", 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(rejoin(&chunks), "abc");
    }

    #[test]
    fn prefers_breaking_after_whitespace() {
        let chunks = plan("alpha beta gamma delta", 12);
        assert_eq!(chunks[0].text, "alpha beta ");
        assert_eq!(rejoin(&chunks), "alpha beta gamma delta");
    }

    #[test]
    fn indexes_and_totals_are_consistent() {
        let chunks = plan(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.total_chunks, 3);
        }
    }

    #[test]
    fn interpolates_time_from_character_offsets() {
        let chunks = plan(&"y".repeat(1000), 250);
        let (start, end) = chunks[1].approx_time_range(1000, 600.0);
        assert!((start - 150.0).abs() < 1e-9);
        assert!((end - 300.0).abs() < 1e-9);
    }
}
