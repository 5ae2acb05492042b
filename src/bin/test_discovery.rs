//! Quick test binary: re-runs ONLY chunking, discovery and dedup on a saved
//! transcript and writes a report next to it.
//! Usage: cargo run --bin test_discovery -- transcript.json

use std::fmt::Write as FmtWrite;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use autoclip_lib::analysis::discovery::TimeLayout;
use autoclip_lib::analysis::{self, AnthropicClient, DiscoveryEngine, DiscoverySettings};
use autoclip_lib::backoff::BackoffController;
use autoclip_lib::commands::{resolve_api_key, API_KEY_NAME};
use autoclip_lib::transcription::{self, timestamped_text, TranscriptSegment};
use autoclip_lib::Config;

#[derive(Parser, Debug)]
#[command(name = "test_discovery", about = "Re-run discovery on a saved transcript")]
struct Args {
    /// JSON array of {start, end, text}.
    transcript: PathBuf,

    #[arg(long, env = "AUTOCLIP_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    language: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    autoclip_lib::init_tracing();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let api_key = resolve_api_key().with_context(|| format!("{} not found", API_KEY_NAME))?;

    tracing::info!(path = %args.transcript.display(), "Loading transcript");
    let raw = std::fs::read_to_string(&args.transcript).context("Failed to read transcript file")?;
    let segments: Vec<TranscriptSegment> = serde_json::from_str(&raw).context("Failed to parse transcript JSON")?;
    tracing::info!(segments = segments.len(), "Loaded transcript");

    let text = timestamped_text(&segments);
    let chunks = transcription::plan(&text, config.discovery.max_chunk_chars);
    tracing::info!(chunks = chunks.len(), "Planned chunks");

    let client = AnthropicClient::new(api_key, &config.discovery)?;
    let controller = Arc::new(BackoffController::new("discovery", config.backoff.discovery.clone()));
    let engine = DiscoveryEngine::new(Arc::new(client), controller, DiscoverySettings::from_config(&config));

    let started = std::time::Instant::now();
    let outcomes = engine
        .discover_all(&chunks, TimeLayout::Timestamped, args.language.as_deref(), "test_discovery", &CancellationToken::new())
        .await;
    tracing::info!(elapsed_s = started.elapsed().as_secs_f64(), "Discovery finished");

    let candidates: Vec<_> = outcomes.iter().flat_map(|o| o.candidates.iter().cloned()).collect();
    let resolved = analysis::resolve(candidates.clone());
    let kept = analysis::survivors(&candidates, &resolved);

    let mut report = String::new();
    for outcome in &outcomes {
        let r = &outcome.report;
        writeln!(
            report,
            "Chunk {} - attempts {}, proposed {}, kept {}{}",
            r.index + 1,
            r.attempts,
            r.proposed,
            r.kept,
            r.error.as_deref().map(|e| format!(", error: {}", e)).unwrap_or_default()
        )
        .ok();
        for dropped in &outcome.dropped {
            writeln!(report, "    DROP \"{}\": {}", dropped.title.as_deref().unwrap_or("?"), dropped.reason).ok();
        }
    }
    writeln!(report).ok();
    for (candidate, kept) in candidates.iter().zip(kept) {
        let status = if kept { "KEEP  " } else { "REMOVE" };
        let excerpt = transcription::extract(&segments, candidate.start_time, candidate.end_time);
        let preview: String = excerpt.chars().take(80).collect();
        let ellipsis = if excerpt.chars().count() > 80 { "..." } else { "" };
        writeln!(
            report,
            "{} {}-{} ({}s) \"{}\": \"{}{}\"",
            status,
            candidate.start_time,
            candidate.end_time,
            candidate.duration_seconds(),
            candidate.title,
            preview,
            ellipsis
        )
        .ok();
    }
    writeln!(report, "\n--- Summary ---").ok();
    writeln!(report, "Candidates: {}, after dedup: {}", candidates.len(), resolved.len()).ok();

    let report_path = args.transcript.with_extension("discovery_report.txt");
    std::fs::write(&report_path, &report).context("Failed to write report")?;
    tracing::info!(path = %report_path.display(), "Report saved");
    Ok(())
}
