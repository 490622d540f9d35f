use crate::seek::SeekPosition;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fallback for `sentry_dsn` when the configuration doesn't set one.
pub const DSN_ENV: &str = "SENTLOG_SENTRY_DSN";

const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// The YAML configuration file.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sentry_dsn: Option<String>,
    /// Extra pattern files, loaded in order after the built-ins.
    #[serde(default)]
    pub pattern_files: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub file: String,
    #[serde(default)]
    pub follow: Option<bool>,
    /// Omitted or negative: start from the end of the file.
    #[serde(default)]
    pub from_line_number: Option<i64>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// One input, fully resolved. Immutable for the lifetime of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    /// Absolute path.
    pub path: PathBuf,
    pub follow: bool,
    pub start: SeekPosition,
    /// Pattern names or inline patterns, tried in order.
    pub patterns: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

/// Everything a run needs, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub sentry_dsn: Option<String>,
    pub dry_run: bool,
    pub verbose: bool,
    pub inputs: Vec<InputSpec>,
    pub pattern_files: Vec<PathBuf>,
    /// Stop gracefully after this many matched entries.
    pub max_events: Option<u64>,
    pub poll_interval: Duration,
    /// Per-worker bound on the final session flush.
    pub flush_timeout: Duration,
    /// How long shutdown waits for workers before aborting them.
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            anyhow::bail!("no file inputs specified");
        }
        for (index, input) in self.inputs.iter().enumerate() {
            if input.file.trim().is_empty() {
                anyhow::bail!("input #{} has an empty file path", index + 1);
            }
            if input.patterns.is_empty() {
                anyhow::bail!("input {:?} has no patterns", input.file);
            }
            if input.patterns.iter().any(|p| p.trim().is_empty()) {
                anyhow::bail!("input {:?} has an empty pattern", input.file);
            }
        }
        Ok(())
    }

    pub fn pattern_file_paths(&self) -> Result<Vec<PathBuf>> {
        self.pattern_files.iter().map(|p| expand_path(p)).collect()
    }

    pub fn input_specs(&self) -> Result<Vec<InputSpec>> {
        self.inputs.iter().map(InputConfig::to_spec).collect()
    }
}

impl InputConfig {
    pub fn to_spec(&self) -> Result<InputSpec> {
        Ok(InputSpec {
            path: expand_path(&self.file)?,
            follow: self.follow.unwrap_or(true),
            start: SeekPosition::from_line_number(self.from_line_number),
            patterns: self.patterns.clone(),
            tags: self.tags.clone(),
        })
    }
}

impl RunConfig {
    pub fn new(inputs: Vec<InputSpec>) -> Self {
        Self {
            sentry_dsn: None,
            dry_run: false,
            verbose: false,
            inputs,
            pattern_files: Vec::new(),
            max_events: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            flush_timeout: Duration::from_secs(DEFAULT_FLUSH_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

/// `~` expansion, then relative paths are taken from the working directory.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = PathBuf::from(shellexpand::tilde(raw.trim()).as_ref());
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    Ok(cwd.join(expanded))
}

/// DSN from the configuration, else from [`DSN_ENV`].
pub fn resolve_dsn(configured: Option<&str>) -> Option<String> {
    pick_dsn(configured, std::env::var(DSN_ENV).ok())
}

fn pick_dsn(configured: Option<&str>, from_env: Option<String>) -> Option<String> {
    configured
        .map(str::trim)
        .filter(|dsn| !dsn.is_empty())
        .map(str::to_string)
        .or_else(|| {
            from_env
                .map(|dsn| dsn.trim().to_string())
                .filter(|dsn| !dsn.is_empty())
        })
}
