use crate::config::{expand_path, resolve_dsn, Config, InputSpec, RunConfig};
use crate::logging::LogFormat;
use crate::seek::SeekPosition;
use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Follow log files and report matching lines to Sentry.
#[derive(Debug, Parser, Clone)]
#[command(name = "sentlog", version, about)]
#[command(group(ArgGroup::new("mode").required(true).args(["file", "config"])))]
pub struct Cli {
    /// File to follow (ad-hoc mode, requires --pattern)
    #[arg(requires = "pattern")]
    pub file: Option<String>,

    /// Pattern to look for in FILE: a pattern name or an inline pattern
    #[arg(short, long, requires = "file")]
    pub pattern: Option<String>,

    /// YAML configuration with one or more inputs
    #[arg(short, long)]
    pub config: Option<String>,

    /// Match and log, but never send anything
    #[arg(long)]
    pub dry_run: bool,

    /// Read what is there and exit instead of waiting for new data
    #[arg(long)]
    pub no_follow: bool,

    /// Start reading FILE from this line; negative means from the end
    #[arg(long, default_value_t = -1, allow_negative_numbers = true, conflicts_with = "config")]
    pub from_line: i64,

    /// Print every matched entry and log at debug level
    #[arg(short, long)]
    pub verbose: bool,

    /// Shut down after this many matched entries
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_events: Option<u64>,

    /// Local log output format
    #[arg(value_enum, long, env = "SENTLOG_LOG_FORMAT", default_value = "console")]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "SENTLOG_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Resolves both modes into one run configuration.
    pub fn into_run_config(self) -> Result<RunConfig> {
        let (mut run, configured_dsn) = match (&self.config, &self.file, &self.pattern) {
            (Some(config_path), _, _) => {
                let path = expand_path(config_path)?;
                let config = Config::load(&path)?;
                let mut run = RunConfig::new(config.input_specs()?);
                run.pattern_files = config
                    .pattern_file_paths()
                    .context("invalid pattern_files entry")?;
                (run, config.sentry_dsn)
            }
            (None, Some(file), Some(pattern)) => {
                let input = InputSpec {
                    path: expand_path(file)?,
                    follow: true,
                    start: SeekPosition::from_line_number(Some(self.from_line)),
                    patterns: vec![pattern.clone()],
                    tags: BTreeMap::new(),
                };
                (RunConfig::new(vec![input]), None)
            }
            _ => anyhow::bail!("either FILE with --pattern or --config is required"),
        };

        if self.no_follow {
            for input in &mut run.inputs {
                input.follow = false;
            }
        }
        run.dry_run = self.dry_run;
        run.verbose = self.verbose;
        run.max_events = self.max_events;
        run.sentry_dsn = resolve_dsn(configured_dsn.as_deref());
        Ok(run)
    }
}
