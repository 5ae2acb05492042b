use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub const DEFAULT_YTDLP: &str = "yt-dlp";

static VIDEO_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:v=|youtu\.be/|/shorts/|/embed/|/live/)([A-Za-z0-9_-]{11})")
        .expect("static video id pattern")
});

static BARE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("static bare id pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr and stdout together, which is where the tool puts its
    /// warnings and errors depending on version.
    pub fn combined(&self) -> String {
        let mut all = self.stderr.clone();
        if !self.stdout.is_empty() {
            if !all.is_empty() {
                all.push('\n');
            }
            all.push_str(&self.stdout);
        }
        all
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs an external program. Swapped out in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, RunError>;
}

/// Real subprocesses through tokio. The child is killed if the future is
/// dropped (timeout or caller cancellation).
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, RunError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| RunError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => return Err(RunError::Timeout(timeout)),
        };

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub fn check_ytdlp_installed(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn get_ytdlp_version(program: &str) -> Result<String> {
    let output = Command::new(program)
        .arg("--version")
        .output()
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        anyhow::bail!("{} --version exited with {}", program, output.status);
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Pull the 11-character video id out of a URL, or accept a bare id.
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    if BARE_ID.is_match(input) {
        return Some(input.to_string());
    }
    VIDEO_ID
        .captures(input)
        .map(|caps| caps[1].to_string())
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Everything needed to ask the tool for subtitles only.
#[derive(Debug, Clone)]
pub struct SubtitleRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub languages: Vec<String>,
    /// yt-dlp format preference, e.g. `json3/vtt/best`.
    pub format: String,
    /// Strategy-specific arguments inserted before the URL.
    pub extra_args: Vec<String>,
}

pub fn build_subtitle_args(request: &SubtitleRequest) -> Vec<String> {
    let mut langs: Vec<String> = Vec::new();
    for lang in &request.languages {
        langs.push(lang.clone());
        // Auto-translated and regional variants, e.g. en-orig, en-US
        langs.push(format!("{}.*", lang));
    }
    if langs.is_empty() {
        langs.push("all".to_string());
    }

    let template = output_template(&request.output_dir);

    let mut args: Vec<String> = vec![
        "--skip-download".into(),
        "--write-subs".into(),
        "--write-auto-subs".into(),
        "--sub-langs".into(),
        langs.join(","),
        "--sub-format".into(),
        request.format.clone(),
        "--no-progress".into(),
        "--no-playlist".into(),
        "-o".into(),
        template,
    ];
    args.extend(request.extra_args.iter().cloned());
    args.push(request.url.clone());
    args
}

fn output_template(dir: &Path) -> String {
    dir.join("%(id)s.%(ext)s").to_string_lossy().into_owned()
}
