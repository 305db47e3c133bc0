//! Configuration loading and management
//!
//! Handles parsing of `.tally.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = ".tally.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Change detection configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Transcript source configuration
    #[serde(default)]
    pub source: SourceConfig,
}

/// Change detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Quiet window before a burst of changes triggers a pass
    #[serde(default = "default_debounce")]
    pub debounce: String,

    /// Interval of the signature poll
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Mutation targets that count as message changes (empty = all)
    #[serde(default)]
    pub allow: Vec<String>,

    /// Mutation targets that never count, checked before `allow`
    #[serde(default)]
    pub deny: Vec<String>,
}

fn default_debounce() -> String {
    "300ms".to_string()
}

fn default_poll_interval() -> String {
    "10s".to_string()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            poll_interval: default_poll_interval(),
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are removed by the sweep
    #[serde(default = "default_max_age")]
    pub max_age: String,

    /// How often the sweep runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,

    /// Hard cap on stored entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_age() -> String {
    "5m".to_string()
}

fn default_sweep_interval() -> String {
    "30s".to_string()
}

fn default_max_entries() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            sweep_interval: default_sweep_interval(),
            max_entries: default_max_entries(),
        }
    }
}

/// Transcript source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Attempts to attach the push source before falling back to polling
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Initial backoff between attempts, doubled after each failure
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: String,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> String {
    "200ms".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

/// Durations resolved from a validated [`Config`].
#[derive(Debug, Clone)]
pub struct Timings {
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub cache_max_age: Duration,
    pub sweep_interval: Duration,
    pub retry_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            poll_interval: Duration::from_secs(10),
            cache_max_age: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Parse a duration string like "300ms", "10s", "5m", "2h" or "1d".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return Err(Error::InvalidArgument("Duration cannot be empty".to_string()));
    }

    let (num_str, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => (&s[..pos], s[pos..].trim()),
        None => (s, "s"),
    };

    let num: u64 = num_str.parse().map_err(|_| {
        Error::InvalidArgument(format!("Invalid duration number: {}", num_str))
    })?;

    let seconds_per = match unit.to_lowercase().as_str() {
        "ms" | "msec" | "millis" => return Ok(Duration::from_millis(num)),
        "s" | "sec" | "second" | "seconds" => 1,
        "m" | "min" | "minute" | "minutes" => 60,
        "h" | "hr" | "hour" | "hours" => 60 * 60,
        "d" | "day" | "days" => 60 * 60 * 24,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "Invalid duration unit '{}'. Expected: ms, s, m, h, d",
                unit
            )));
        }
    };
    let duration = num
        .checked_mul(seconds_per)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::InvalidArgument(format!("Duration too large: {}", s)))?;

    Ok(duration)
}

impl Config {
    /// Load configuration from a `.tally.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration: explicit path, then `./.tally.toml`, then the
    /// user config directory, then defaults.
    ///
    /// An explicit path must exist and parse; discovered files fall back to
    /// defaults when invalid.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::resolve_from(explicit, &cwd)
    }

    /// [`Config::resolve`] with `dir` in place of the working directory.
    pub fn resolve_from(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        for candidate in Self::search_paths(dir) {
            if candidate.exists() {
                return Ok(Self::load(&candidate).unwrap_or_else(|err| {
                    tracing::warn!(path = %candidate.display(), error = %err, "ignoring invalid config");
                    Self::default()
                }));
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve every duration field.
    pub fn timings(&self) -> Result<Timings> {
        Ok(Timings {
            debounce: parse_duration(&self.detector.debounce)?,
            poll_interval: parse_duration(&self.detector.poll_interval)?,
            cache_max_age: parse_duration(&self.cache.max_age)?,
            sweep_interval: parse_duration(&self.cache.sweep_interval)?,
            retry_backoff: parse_duration(&self.source.retry_backoff)?,
        })
    }

    fn search_paths(dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![dir.join(CONFIG_FILE)];
        if let Some(dirs) = directories::ProjectDirs::from("", "", "tally") {
            paths.push(dirs.config_dir().join("config.toml"));
        }
        paths
    }

    fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        self.cache.validate()?;
        self.source.validate()?;
        Ok(())
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<()> {
        validate_nonzero(&self.debounce, "detector.debounce")?;
        validate_nonzero(&self.poll_interval, "detector.poll_interval")?;
        for pattern in &self.allow {
            validate_pattern(pattern, "detector.allow")?;
        }
        for pattern in &self.deny {
            validate_pattern(pattern, "detector.deny")?;
        }
        Ok(())
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        validate_nonzero(&self.max_age, "cache.max_age")?;
        validate_nonzero(&self.sweep_interval, "cache.sweep_interval")?;
        if self.max_entries == 0 {
            return Err(Error::InvalidConfig(
                "cache.max_entries must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl SourceConfig {
    fn validate(&self) -> Result<()> {
        validate_nonzero(&self.retry_backoff, "source.retry_backoff")?;
        if self.retry_attempts > 16 {
            return Err(Error::InvalidConfig(
                "source.retry_attempts must be <= 16".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_nonzero(raw: &str, field: &str) -> Result<()> {
    let duration = parse_duration(raw)
        .map_err(|err| Error::InvalidConfig(format!("{field}: {err}")))?;
    if duration.is_zero() {
        return Err(Error::InvalidConfig(format!("{field} must be > 0")));
    }
    Ok(())
}

fn validate_pattern(pattern: &str, field: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(Error::InvalidConfig(format!(
            "{field}: pattern cannot be empty"
        )));
    }
    glob::Pattern::new(pattern).map_err(|err| {
        Error::InvalidConfig(format!(
            "{field}: invalid glob pattern '{pattern}': {err}"
        ))
    })?;
    Ok(())
}
