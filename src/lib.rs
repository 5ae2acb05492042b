//! autoclip: pull a transcript from an unreliable video platform and cut it
//! into short, verbatim highlight segments.

pub mod acquisition;
pub mod analysis;
pub mod backoff;
pub mod commands;
pub mod config;
pub mod error;
pub mod processor;
pub mod transcription;
pub mod ytdlp;

pub use config::Config;
pub use error::{AcquisitionError, ConfigError, LlmError, PipelineError};
pub use processor::{
    render_report, Diagnostics, HighlightOutcome, HighlightRequest, Pipeline, PipelineState, TranscriptSource,
};

/// Install the `tracing` subscriber used by the binaries. `RUST_LOG`
/// overrides the default filter.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("autoclip=info,autoclip_lib=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
