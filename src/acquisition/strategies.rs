use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::captions::{list_tracks, parse_track, pick_track};
use super::{classify_message, AttemptFailure, ErrorClass, Strategy};
use crate::config::AcquisitionConfig;
use crate::transcription::TranscriptSegment;
use crate::ytdlp::{build_subtitle_args, watch_url, CommandRunner, RunError, SubtitleRequest};

/// The argument sets we know how to hand to yt-dlp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Authenticated session from a user-supplied cookie file.
    Cookies,
    /// Mobile and web player clients, which are throttled separately.
    AlternateClient,
    /// Embedded TV client over a legacy TLS connection.
    Legacy,
    /// Plain subtitle request in the simplest format.
    Minimal,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Cookies,
        StrategyKind::AlternateClient,
        StrategyKind::Legacy,
        StrategyKind::Minimal,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            "cookies" => Some(StrategyKind::Cookies),
            "alternate_client" => Some(StrategyKind::AlternateClient),
            "legacy" => Some(StrategyKind::Legacy),
            "minimal" => Some(StrategyKind::Minimal),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Cookies => "cookies",
            StrategyKind::AlternateClient => "alternate_client",
            StrategyKind::Legacy => "legacy",
            StrategyKind::Minimal => "minimal",
        }
    }

    fn sub_format(&self) -> &'static str {
        match self {
            StrategyKind::Minimal => "vtt",
            _ => "json3/vtt/srv1/best",
        }
    }

    fn extra_args(&self, cookies: Option<&Path>) -> Vec<String> {
        match self {
            StrategyKind::Cookies => match cookies {
                Some(path) => vec!["--cookies".into(), path.to_string_lossy().into_owned()],
                None => Vec::new(),
            },
            StrategyKind::AlternateClient => vec![
                "--extractor-args".into(),
                "youtube:player_client=android,web".into(),
            ],
            StrategyKind::Legacy => vec![
                "--extractor-args".into(),
                "youtube:player_client=tv_embedded".into(),
                "--legacy-server-connect".into(),
            ],
            StrategyKind::Minimal => Vec::new(),
        }
    }
}

/// One yt-dlp invocation per attempt, writing subtitles into a fresh
/// directory that is removed afterwards.
pub struct YtDlpStrategy {
    kind: StrategyKind,
    runner: Arc<dyn CommandRunner>,
    program: String,
    cookies: Option<PathBuf>,
    languages: Vec<String>,
    timeout: Duration,
    work_dir: PathBuf,
}

impl YtDlpStrategy {
    pub fn new(kind: StrategyKind, runner: Arc<dyn CommandRunner>, config: &AcquisitionConfig) -> Self {
        Self {
            kind,
            runner,
            program: config.ytdlp_path.clone(),
            cookies: config.cookies_file.clone(),
            languages: config.languages.clone(),
            timeout: Duration::from_secs(config.subprocess_timeout_secs),
            work_dir: config.work_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn fetch_into(&self, dir: &Path, video_id: &str) -> Result<Vec<TranscriptSegment>, AttemptFailure> {
        let request = SubtitleRequest {
            url: watch_url(video_id),
            output_dir: dir.to_path_buf(),
            languages: self.languages.clone(),
            format: self.kind.sub_format().to_string(),
            extra_args: self.kind.extra_args(self.cookies.as_deref()),
        };
        let args = build_subtitle_args(&request);
        tracing::debug!(strategy = self.kind.name(), ?args, "Running yt-dlp");

        let output = match self.runner.run(&self.program, &args, self.timeout).await {
            Ok(output) => output,
            Err(RunError::Timeout(after)) => {
                return Err(AttemptFailure::new(
                    ErrorClass::Timeout,
                    format!("yt-dlp timed out after {}s", after.as_secs()),
                ))
            }
            Err(e) => return Err(AttemptFailure::new(ErrorClass::Transient, e.to_string())),
        };

        let combined = output.combined();
        let tracks = list_tracks(dir)
            .map_err(|e| AttemptFailure::new(ErrorClass::Malformed, format!("{:#}", e)))?;

        let Some(track) = pick_track(&tracks, &self.languages) else {
            // yt-dlp exits 0 with only a warning when there are no subtitles
            let class = match classify_message(&combined) {
                ErrorClass::Transient if output.success => ErrorClass::Malformed,
                class => class,
            };
            let message = if combined.trim().is_empty() {
                "yt-dlp wrote no caption files".to_string()
            } else {
                summarize_output(&combined)
            };
            return Err(AttemptFailure::new(class, message));
        };

        parse_track(track).map_err(|e| AttemptFailure::new(ErrorClass::Malformed, format!("{:#}", e)))
    }
}

#[async_trait]
impl Strategy for YtDlpStrategy {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn is_available(&self) -> bool {
        match self.kind {
            StrategyKind::Cookies => self.cookies.as_deref().is_some_and(|p| p.exists()),
            _ => true,
        }
    }

    async fn attempt(&self, video_id: &str) -> Result<Vec<TranscriptSegment>, AttemptFailure> {
        let dir = self
            .work_dir
            .join(format!("autoclip_{}_{}", self.kind.name(), Uuid::new_v4()));
        std::fs::create_dir_all(&dir).map_err(|e| {
            AttemptFailure::new(
                ErrorClass::Transient,
                format!("Failed to create {}: {}", dir.display(), e),
            )
        })?;

        let result = self.fetch_into(&dir, video_id).await;

        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to clean up subtitle directory");
        }
        result
    }
}

/// Error lines if there are any, otherwise the last non-empty line.
fn summarize_output(output: &str) -> String {
    let errors: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("ERROR"))
        .collect();
    if !errors.is_empty() {
        return errors.join("; ");
    }
    output
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Build the configured chain in order. Unknown names are skipped with a
/// warning (config validation normally rejects them first).
pub fn default_strategies(config: &AcquisitionConfig, runner: Arc<dyn CommandRunner>) -> Vec<Box<dyn Strategy>> {
    config
        .strategies
        .iter()
        .filter_map(|name| {
            let kind = StrategyKind::from_str(name);
            if kind.is_none() {
                tracing::warn!(strategy = %name, "Unknown acquisition strategy, skipping");
            }
            kind
        })
        .map(|kind| Box::new(YtDlpStrategy::new(kind, Arc::clone(&runner), config)) as Box<dyn Strategy>)
        .collect()
}
