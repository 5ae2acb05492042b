use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use autoclip_lib::commands;
use autoclip_lib::{render_report, Config, HighlightRequest, PipelineError};

#[derive(Parser, Debug)]
#[command(name = "autoclip", version, about = "Find short, verbatim highlight segments in long-form video transcripts")]
struct Cli {
    /// Config file (TOML). Defaults to $AUTOCLIP_CONFIG or the user config dir.
    #[arg(long, global = true, env = "AUTOCLIP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that yt-dlp is installed.
    Check,

    /// Find highlights for a video URL/id, or a saved transcript.
    Highlights(HighlightsArgs),
}

#[derive(clap::Args, Debug)]
struct HighlightsArgs {
    /// Video URL or id. Used as the report label with --transcript/--text.
    source: String,

    /// Saved transcript: JSON array of {start, end, text}.
    #[arg(long, conflicts_with = "text")]
    transcript: Option<PathBuf>,

    /// Plain-text transcript (requires --duration).
    #[arg(long, requires = "duration")]
    text: Option<PathBuf>,

    /// Video duration in seconds.
    #[arg(long)]
    duration: Option<f64>,

    #[arg(long)]
    min_duration: Option<u32>,

    #[arg(long)]
    max_duration: Option<u32>,

    /// Highlights proposed per chunk, at most.
    #[arg(long)]
    max_candidates: Option<usize>,

    /// Transcript language hint, e.g. `en`.
    #[arg(long)]
    language: Option<String>,

    /// Write a plain-text report here.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write intermediate JSON files here.
    #[arg(long)]
    debug_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    autoclip_lib::init_tracing();

    let cli = Cli::parse();
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config: {}", e);
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Command::Check => {
            let status = commands::check_ytdlp(&config);
            match (status.installed, &status.version) {
                (true, Some(version)) => println!("{} {}", status.program, version),
                (true, None) => println!("{} (version unknown)", status.program),
                (false, _) => {
                    println!("{} not found", status.program);
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Command::Highlights(args) => {
            apply_overrides(&mut config, &args);
            match run_highlights(&config, &args).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}: {}", e.kind(), e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn apply_overrides(config: &mut Config, args: &HighlightsArgs) {
    if let Some(min) = args.min_duration {
        config.segments.min_duration_secs = min;
    }
    if let Some(max) = args.max_duration {
        config.segments.max_duration_secs = max;
    }
    if let Some(k) = args.max_candidates {
        config.discovery.max_candidates = k;
    }
    if let Some(dir) = &args.debug_dir {
        config.debug_dir = Some(dir.clone());
    }
}

fn build_request(args: &HighlightsArgs) -> Result<HighlightRequest, PipelineError> {
    let language = args.language.clone();
    if let Some(path) = &args.transcript {
        let json = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::InvalidRequest(format!("Failed to read {}: {}", path.display(), e)))?;
        return commands::segments_request(&args.source, &json, args.duration, language);
    }
    if let Some(path) = &args.text {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::InvalidRequest(format!("Failed to read {}: {}", path.display(), e)))?;
        return Ok(commands::text_request(&args.source, text, args.duration, language));
    }
    commands::video_request(&args.source, language)
}

async fn run_highlights(config: &Config, args: &HighlightsArgs) -> Result<(), PipelineError> {
    let request = build_request(args)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            ctrl_c.cancel();
        }
    });

    let result = commands::generate_highlights(&request, config, &cancel).await;

    if let Some(path) = &args.report {
        let report = render_report(&request.label, &result);
        if let Err(e) = std::fs::write(path, &report) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write report");
        } else {
            tracing::info!(path = %path.display(), "Report written");
        }
    }

    let outcome = result?;
    match serde_json::to_string_pretty(&outcome.segments) {
        Ok(json) => println!("{}", json),
        Err(e) => return Err(PipelineError::InvalidRequest(format!("Failed to serialize result: {}", e))),
    }
    Ok(())
}
