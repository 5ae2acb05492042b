//! Caption file parsing: YouTube `json3`, WebVTT and `timedtext` XML.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::transcription::TranscriptSegment;

/// Used when a cue carries no usable duration, so `end > start` still holds.
const MIN_CUE_SECONDS: f64 = 0.01;

pub const DEFAULT_LANGUAGE_PREFERENCE: &[&str] = &["en", "en-US", "id", "en-GB"];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static whitespace pattern"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("static tag pattern"));
static VTT_TIMING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((?:\d+:)?\d{1,2}:\d{2}[.,]\d{3})\s+-->\s+((?:\d+:)?\d{1,2}:\d{2}[.,]\d{3})")
        .expect("static vtt timing pattern")
});
static XML_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<text\b([^>]*)>(.*?)</text>"#).expect("static timedtext pattern")
});
static XML_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\w+)="([^"]*)""#).expect("static attribute pattern")
});
static NUMERIC_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&#(x[0-9a-fA-F]+|\d+);").expect("static entity pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionFormat {
    Json3,
    Vtt,
    TimedTextXml,
}

impl CaptionFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json3" => Some(CaptionFormat::Json3),
            "vtt" => Some(CaptionFormat::Vtt),
            "xml" | "srv1" => Some(CaptionFormat::TimedTextXml),
            _ => None,
        }
    }
}

/// A subtitle file written by the extraction tool: `<id>.<lang>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionTrack {
    pub path: PathBuf,
    pub language: String,
    pub format: CaptionFormat,
}

impl CaptionTrack {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        let format = CaptionFormat::from_extension(ext)?;
        let stem = path.file_stem()?.to_str()?;
        let language = stem.rsplit_once('.').map(|(_, lang)| lang).unwrap_or("und");
        Some(CaptionTrack {
            path: path.to_path_buf(),
            language: language.to_string(),
            format,
        })
    }
}

/// All caption files in `dir`, sorted by file name.
pub fn list_tracks(dir: &Path) -> Result<Vec<CaptionTrack>> {
    let mut tracks: Vec<CaptionTrack> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| CaptionTrack::from_path(&entry.path()))
        .collect();
    tracks.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(tracks)
}

/// Prefer the first language of `preferred` that has a track; otherwise the
/// first track available.
pub fn pick_track<'a>(tracks: &'a [CaptionTrack], preferred: &[String]) -> Option<&'a CaptionTrack> {
    for lang in preferred {
        if let Some(track) = tracks.iter().find(|t| t.language == *lang) {
            tracing::info!(language = %track.language, "Found captions in preferred language");
            return Some(track);
        }
    }
    let first = tracks.first()?;
    tracing::info!(language = %first.language, "Using first available caption language");
    Some(first)
}

pub fn parse_track(track: &CaptionTrack) -> Result<Vec<TranscriptSegment>> {
    let raw = std::fs::read_to_string(&track.path)
        .with_context(|| format!("Failed to read caption file {}", track.path.display()))?;
    match track.format {
        CaptionFormat::Json3 => parse_json3(&raw),
        CaptionFormat::Vtt => parse_vtt(&raw),
        CaptionFormat::TimedTextXml => parse_timedtext_xml(&raw),
    }
}

#[derive(Debug, Deserialize)]
struct Json3Document {
    #[serde(default)]
    events: Vec<Json3Event>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Json3Event {
    t_start_ms: Option<f64>,
    d_duration_ms: Option<f64>,
    #[serde(default)]
    segs: Vec<Json3Seg>,
}

#[derive(Debug, Deserialize)]
struct Json3Seg {
    utf8: Option<String>,
}

pub fn parse_json3(raw: &str) -> Result<Vec<TranscriptSegment>> {
    let doc: Json3Document = serde_json::from_str(raw).context("Failed to parse json3 captions")?;

    let mut segments = Vec::new();
    for event in doc.events {
        let Some(start_ms) = event.t_start_ms else { continue };
        let joined: String = event.segs.iter().filter_map(|s| s.utf8.as_deref()).collect();
        let text = clean_text(&joined);
        if text.is_empty() {
            continue;
        }
        let start = start_ms / 1000.0;
        let duration = event.d_duration_ms.unwrap_or(0.0) / 1000.0;
        segments.push(TranscriptSegment::new(start, end_after(start, duration), text));
    }
    sort_by_start(&mut segments);
    Ok(segments)
}

pub fn parse_vtt(raw: &str) -> Result<Vec<TranscriptSegment>> {
    if !raw.trim_start_matches('\u{feff}').starts_with("WEBVTT") {
        anyhow::bail!("Not a WebVTT document");
    }

    let mut segments = Vec::new();
    let mut last_line = String::new();
    let mut lines = raw.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(caps) = VTT_TIMING.captures(line.trim()) else { continue };
        let start = parse_vtt_time(&caps[1]).context("Bad cue start")?;
        let end = parse_vtt_time(&caps[2]).context("Bad cue end")?;

        let mut cue_lines: Vec<String> = Vec::new();
        while let Some(next) = lines.peek() {
            if next.trim().is_empty() {
                break;
            }
            let text = clean_text(&decode_entities(&TAG.replace_all(next, "")));
            // Rolling auto-captions repeat the previous line at the top of each cue
            if !text.is_empty() && text != last_line {
                last_line = text.clone();
                cue_lines.push(text);
            }
            lines.next();
        }

        if cue_lines.is_empty() {
            continue;
        }
        segments.push(TranscriptSegment::new(start, end_after(start, end - start), cue_lines.join(" ")));
    }

    sort_by_start(&mut segments);
    Ok(segments)
}

fn parse_vtt_time(s: &str) -> Option<f64> {
    let s = s.replace(',', ".");
    let parts: Vec<&str> = s.split(':').collect();
    let (h, m, sec) = match parts.as_slice() {
        [h, m, sec] => (h.parse::<f64>().ok()?, m.parse::<f64>().ok()?, sec.parse::<f64>().ok()?),
        [m, sec] => (0.0, m.parse::<f64>().ok()?, sec.parse::<f64>().ok()?),
        _ => return None,
    };
    Some(h * 3600.0 + m * 60.0 + sec)
}

pub fn parse_timedtext_xml(raw: &str) -> Result<Vec<TranscriptSegment>> {
    let mut segments = Vec::new();
    for caps in XML_TEXT.captures_iter(raw) {
        let mut start = None;
        let mut dur = 0.0;
        for attr in XML_ATTR.captures_iter(&caps[1]) {
            match &attr[1] {
                "start" => start = attr[2].parse::<f64>().ok(),
                "dur" => dur = attr[2].parse::<f64>().unwrap_or(0.0),
                _ => {}
            }
        }
        let Some(start) = start else { continue };
        let text = clean_text(&decode_entities(&TAG.replace_all(&caps[2], "")));
        if text.is_empty() {
            continue;
        }
        segments.push(TranscriptSegment::new(start, end_after(start, dur), text));
    }

    if segments.is_empty() && !raw.contains("<text") {
        anyhow::bail!("No <text> nodes found in timedtext XML");
    }
    sort_by_start(&mut segments);
    Ok(segments)
}

/// Collapse runs of whitespace and trim, the same cleanup applied to every
/// caption format.
pub fn clean_text(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Decode the handful of entities caption XML uses. Runs twice because the
/// timedtext endpoint double-escapes (`&amp;#39;`).
pub fn decode_entities(text: &str) -> String {
    let mut out = text.to_string();
    for _ in 0..2 {
        if !out.contains('&') {
            break;
        }
        let numeric = NUMERIC_ENTITY.replace_all(&out, |caps: &regex::Captures| {
            let body = &caps[1];
            let code = if let Some(hex) = body.strip_prefix('x') {
                u32::from_str_radix(hex, 16).ok()
            } else {
                body.parse::<u32>().ok()
            };
            code.and_then(char::from_u32)
                .map(|c| c.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        });
        out = numeric
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&nbsp;", " ")
            .replace("&amp;", "&");
    }
    out
}

fn end_after(start: f64, duration: f64) -> f64 {
    if duration > 0.0 {
        start + duration
    } else {
        start + MIN_CUE_SECONDS
    }
}

fn sort_by_start(segments: &mut [TranscriptSegment]) {
    segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
}
