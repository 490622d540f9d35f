//! Local diagnostics. Everything goes to stderr; stdout is reserved for the
//! verbose entry dump.

use anyhow::Result;
use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "SENTLOG_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Console,
    /// One JSON object per line
    Json,
}

/// Parses a `SENTLOG_LOG_LEVEL` value. Unset or empty means `info`; an
/// unknown value is returned as the error.
pub fn parse_level(raw: Option<&str>) -> Result<LevelFilter, String> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(LevelFilter::INFO);
    };
    match raw.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => Err(raw.to_string()),
    }
}

/// `--verbose` never lowers an explicitly more detailed level.
pub fn effective_level(level: LevelFilter, verbose: bool) -> LevelFilter {
    if verbose {
        level.max(LevelFilter::DEBUG)
    } else {
        level
    }
}

pub fn init_tracing(format: LogFormat, verbose: bool) -> Result<()> {
    let raw = std::env::var(LOG_LEVEL_ENV).ok();
    let (level, rejected) = match parse_level(raw.as_deref()) {
        Ok(level) => (level, None),
        Err(value) => (LevelFilter::INFO, Some(value)),
    };
    let level = effective_level(level, verbose);

    // RUST_LOG directives, when present, refine the base level
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = match format {
        LogFormat::Console => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;

    if let Some(value) = rejected {
        warn!(env = LOG_LEVEL_ENV, value = %value, "unrecognized log level; using info");
    }
    Ok(())
}
