//! Layered configuration: defaults, then a TOML file, then environment
//! overrides. CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::acquisition::captions::DEFAULT_LANGUAGE_PREFERENCE;
use crate::acquisition::StrategyKind;
use crate::analysis::DurationPolicy;
use crate::backoff::BackoffConfig;
use crate::error::ConfigError;
use crate::transcription::DEFAULT_MAX_CHUNK_CHARS;
use crate::ytdlp::DEFAULT_YTDLP;

pub const CONFIG_ENV: &str = "AUTOCLIP_CONFIG";
pub const YTDLP_ENV: &str = "AUTOCLIP_YTDLP";
pub const COOKIES_ENV: &str = "AUTOCLIP_COOKIES";
pub const MODEL_ENV: &str = "AUTOCLIP_MODEL";

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub acquisition: AcquisitionConfig,
    pub backoff: BackoffSection,
    pub discovery: DiscoveryConfig,
    pub segments: SegmentConfig,
    /// When set, intermediate results are written here as pretty JSON.
    pub debug_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub ytdlp_path: String,
    pub cookies_file: Option<PathBuf>,
    /// Caption languages in order of preference.
    pub languages: Vec<String>,
    /// Strategy names, tried in this order.
    pub strategies: Vec<String>,
    pub subprocess_timeout_secs: u64,
    /// Longest rate-limit wait accepted before moving on to the next strategy.
    pub max_strategy_wait_secs: u64,
    pub min_transcript_chars: usize,
    /// Parent of the per-attempt subtitle directories. System temp dir when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: DEFAULT_YTDLP.to_string(),
            cookies_file: None,
            languages: DEFAULT_LANGUAGE_PREFERENCE.iter().map(|s| s.to_string()).collect(),
            strategies: StrategyKind::ALL.iter().map(|k| k.name().to_string()).collect(),
            subprocess_timeout_secs: 45,
            max_strategy_wait_secs: 30,
            min_transcript_chars: 200,
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    /// Guards the video platform.
    pub source: BackoffConfig,
    /// Guards the text-generation service.
    pub discovery: BackoffConfig,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            source: BackoffConfig::default(),
            discovery: BackoffConfig::for_discovery(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub model: String,
    pub api_url: String,
    pub max_tokens: u32,
    pub max_chunk_chars: usize,
    /// Upper bound on candidates kept per chunk.
    pub max_candidates: usize,
    /// Retries of one chunk after the first attempt.
    pub retry_ceiling: u32,
    pub safety_margin_ms: u64,
    /// Wait used when a rate-limit error carries no hint.
    pub default_wait_ms: u64,
    pub timeout_secs: u64,
    pub concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            max_tokens: 4096,
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            max_candidates: 3,
            retry_ceiling: 2,
            safety_margin_ms: 2_000,
            default_wait_ms: 20_000,
            timeout_secs: 120,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub min_duration_secs: u32,
    pub max_duration_secs: u32,
    pub min_excerpt_chars: usize,
    pub policy: DurationPolicy,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: 60,
            max_duration_secs: 90,
            min_excerpt_chars: 100,
            policy: DurationPolicy::Strict,
        }
    }
}

impl Config {
    /// Defaults, then the first config file found, then the environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::locate(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// An explicit path always wins and must exist; the env var and the user
    /// config dir are only used when the file is there.
    fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        default_config_path().filter(|p| p.exists())
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(path) = get(YTDLP_ENV) {
            self.acquisition.ytdlp_path = path;
        }
        if let Some(cookies) = get(COOKIES_ENV) {
            self.acquisition.cookies_file = Some(PathBuf::from(cookies));
        }
        if let Some(model) = get(MODEL_ENV) {
            self.discovery.model = model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let seg = &self.segments;
        if seg.min_duration_secs == 0 || seg.min_duration_secs > seg.max_duration_secs {
            return Err(ConfigError::Invalid(format!(
                "duration window {}-{}s is empty or inverted",
                seg.min_duration_secs, seg.max_duration_secs
            )));
        }
        if let DurationPolicy::Floor { min_seconds } = seg.policy {
            if min_seconds == 0 || min_seconds > seg.max_duration_secs {
                return Err(ConfigError::Invalid(format!(
                    "floor of {}s does not fit under the {}s maximum",
                    min_seconds, seg.max_duration_secs
                )));
            }
        }
        if self.discovery.max_candidates == 0 {
            return Err(ConfigError::Invalid("max_candidates must be at least 1".into()));
        }
        if self.discovery.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.discovery.max_chunk_chars == 0 {
            return Err(ConfigError::Invalid("max_chunk_chars must be at least 1".into()));
        }
        for name in &self.acquisition.strategies {
            if StrategyKind::from_str(name).is_none() {
                return Err(ConfigError::Invalid(format!("unknown strategy '{}'", name)));
            }
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("autoclip").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.segments.min_duration_secs, 60);
        assert_eq!(config.segments.max_duration_secs, 90);
        assert_eq!(config.discovery.max_candidates, 3);
        assert_eq!(config.discovery.max_chunk_chars, 12_000);
        assert_eq!(config.backoff.discovery.min_interval_ms, 1_500);
        assert_eq!(
            config.acquisition.strategies,
            vec!["cookies", "alternate_client", "legacy", "minimal"]
        );
    }

    #[test]
    fn file_values_override_defaults_and_keep_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[segments]
min_duration_secs = 45
max_duration_secs = 75
policy = {{ mode = "floor", min_seconds = 30 }}

[discovery]
concurrency = 2

[backoff.source]
max_attempts = 3
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.segments.min_duration_secs, 45);
        assert_eq!(config.segments.max_duration_secs, 75);
        assert_eq!(config.segments.policy, DurationPolicy::Floor { min_seconds: 30 });
        assert_eq!(config.segments.min_excerpt_chars, 100);
        assert_eq!(config.discovery.concurrency, 2);
        assert_eq!(config.discovery.retry_ceiling, 2);
        assert_eq!(config.backoff.source.max_attempts, 3);
        assert_eq!(config.backoff.source.base_delay_ms, 2_000);
        config.validate().unwrap();
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[segments\nmin_duration_secs = ").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn environment_overrides_tool_and_model() {
        let env: HashMap<&str, &str> = HashMap::from([
            (YTDLP_ENV, "/opt/bin/yt-dlp"),
            (COOKIES_ENV, " /home/me/cookies.txt "),
            (MODEL_ENV, ""),
        ]);
        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.acquisition.ytdlp_path, "/opt/bin/yt-dlp");
        assert_eq!(
            config.acquisition.cookies_file,
            Some(PathBuf::from("/home/me/cookies.txt"))
        );
        assert_eq!(config.discovery.model, DEFAULT_MODEL);
    }

    #[test]
    fn rejects_inverted_window_and_zero_counts() {
        let mut config = Config::default();
        config.segments.min_duration_secs = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.max_candidates = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.acquisition.strategies.push("teleport".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.segments.policy = DurationPolicy::Floor { min_seconds: 120 };
        assert!(config.validate().is_err());
    }
}
