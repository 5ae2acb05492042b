use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

static MM_SS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3}):([0-5]\d)$").expect("static timecode pattern")
});

/// A whole-second position in the transcript, written as `MM:SS`.
///
/// Minutes are not wrapped into hours: one hour fifteen minutes is `75:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timecode(u32);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MM:SS timecode: {0:?}")]
pub struct TimecodeError(pub String);

impl Timecode {
    pub fn from_seconds(seconds: u32) -> Self {
        Timecode(seconds)
    }

    /// Round a fractional position down to the containing second.
    pub fn floor(seconds: f64) -> Self {
        Timecode(seconds.max(0.0).floor() as u32)
    }

    pub fn seconds(self) -> u32 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64
    }
}

impl FromStr for Timecode {
    type Err = TimecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = MM_SS
            .captures(s.trim())
            .ok_or_else(|| TimecodeError(s.to_string()))?;
        let minutes: u32 = caps[1].parse().map_err(|_| TimecodeError(s.to_string()))?;
        let seconds: u32 = caps[2].parse().map_err(|_| TimecodeError(s.to_string()))?;
        Ok(Timecode(minutes * 60 + seconds))
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl Serialize for Timecode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timecode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Format fractional seconds for logs and reports, e.g. `12:05.40`.
pub fn format_time(seconds: f64) -> String {
    let mins = (seconds / 60.0) as u64;
    let secs = seconds % 60.0;
    format!("{}:{:05.2}", mins, secs)
}
