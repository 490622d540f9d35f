//! One input file's tail, match and report pipeline.
//!
//! A worker moves through `Opening -> Seeking -> Following -> Draining ->
//! Closed`. Only the move out of `Following` is triggered from outside, through
//! the generation's cancellation token; the session is always flushed on the
//! way out, also when following failed.

use crate::budget::EventBudget;
use crate::config::{InputSpec, RunConfig};
use crate::error::InputError;
use crate::grok::Fields;
use crate::matcher::LineMatcher;
use crate::metrics;
use crate::reporter::{EventReporter, SessionFactory};
use crate::seek::resolve_offset;
use crate::tailer::{open_input, FileTailer, TailOptions};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Opening,
    Seeking,
    Following,
    Draining,
    Closed,
}

/// The parts of [`RunConfig`] a worker needs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub dry_run: bool,
    pub verbose: bool,
    pub poll_interval: Duration,
    pub flush_timeout: Duration,
}

impl From<&RunConfig> for WorkerSettings {
    fn from(run: &RunConfig) -> Self {
        Self {
            dry_run: run.dry_run,
            verbose: run.verbose,
            poll_interval: run.poll_interval,
            flush_timeout: run.flush_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub lines: u64,
    pub matched: u64,
    pub reported: u64,
}

pub struct InputWorker {
    spec: InputSpec,
    label: String,
    file: Option<File>,
    matcher: Arc<LineMatcher>,
    reporter: EventReporter,
    settings: WorkerSettings,
    budget: Option<Arc<EventBudget>>,
    state: WorkerState,
}

impl InputWorker {
    /// Opens the input and its reporting session. Failing here means the
    /// input is unusable (missing, unreadable or a directory).
    pub async fn open(
        spec: InputSpec,
        matcher: Arc<LineMatcher>,
        sessions: &dyn SessionFactory,
        settings: WorkerSettings,
        budget: Option<Arc<EventBudget>>,
    ) -> Result<Self, InputError> {
        let label = spec.path.display().to_string();
        debug!(path = %label, state = ?WorkerState::Opening, "opening input");
        let file = open_input(&spec.path).await?;
        let reporter = EventReporter::new(
            sessions.open_session(&spec.path),
            &spec.path,
            &spec.tags,
            settings.dry_run,
        );
        Ok(Self {
            spec,
            label,
            file: Some(file),
            matcher,
            reporter,
            settings,
            budget,
            state: WorkerState::Opening,
        })
    }

    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(path = %self.label, from = ?self.state, to = ?next, "worker state change");
        self.state = next;
    }

    /// Runs until the input ends (no-follow) or `cancel` fires, then flushes.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<WorkerSummary> {
        info!(path = %self.label, patterns = self.matcher.len(), "reading input");
        let _active = metrics::GaugeGuard::new(&metrics::ACTIVE_WORKERS);

        let mut summary = WorkerSummary::default();
        let outcome = self.pump(&cancel, &mut summary).await;

        self.transition(WorkerState::Draining);
        let Self {
            reporter,
            settings,
            label,
            ..
        } = self;
        info!(
            path = %label,
            lines = summary.lines,
            matched = summary.matched,
            reported = summary.reported,
            "finished reading input; flushing events"
        );
        reporter.close(settings.flush_timeout).await;
        debug!(path = %label, state = ?WorkerState::Closed, "worker closed");

        outcome.map(|()| summary)
    }

    async fn pump(&mut self, cancel: &CancellationToken, summary: &mut WorkerSummary) -> Result<()> {
        self.transition(WorkerState::Seeking);
        let file = self
            .file
            .take()
            .with_context(|| format!("input {} was already consumed", self.label))?;
        let mut reader = BufReader::new(file);
        let offset = resolve_offset(&mut reader, self.spec.start)
            .await
            .with_context(|| format!("failed to seek {}", self.label))?;
        debug!(path = %self.label, start = ?self.spec.start, offset, "resolved start offset");

        let options = TailOptions {
            follow: self.spec.follow,
            reopen: self.spec.follow,
            poll_interval: self.settings.poll_interval,
        };
        let mut tailer =
            FileTailer::new(self.spec.path.clone(), reader.into_inner(), offset, options).await?;

        self.transition(WorkerState::Following);
        while !cancel.is_cancelled() {
            let Some(line) = tailer.next_line(cancel).await? else {
                break;
            };
            self.process_line(&line, summary);
        }
        Ok(())
    }

    fn process_line(&mut self, line: &str, summary: &mut WorkerSummary) {
        summary.lines += 1;
        metrics::LINES_READ
            .with_label_values(&[self.label.as_str()])
            .inc();

        let mut breadcrumb_timestamp = None;
        if let Some(matched) = self.matcher.match_line(line) {
            summary.matched += 1;
            metrics::LINES_MATCHED
                .with_label_values(&[self.label.as_str()])
                .inc();

            let within_budget = self.budget.as_ref().map_or(true, |budget| budget.try_take());
            if within_budget {
                if let Some(event) = self.reporter.report(line, &matched) {
                    summary.reported += 1;
                    breadcrumb_timestamp = event.timestamp;
                }
                if self.settings.verbose {
                    info!(path = %self.label, pattern = %matched.pattern, "entry found");
                    print_entry(&matched.fields);
                }
            } else {
                debug!(path = %self.label, "event budget used up; skipping entry");
            }
        }

        self.reporter.breadcrumb(line, breadcrumb_timestamp);
    }
}

/// Aligned `key: value` lines sorted by key, followed by a blank line.
pub fn format_entry(fields: &Fields) -> String {
    let mut out = String::new();
    for (key, value) in fields {
        let _ = writeln!(out, "{key:>15}: {value}");
    }
    out.push('\n');
    out
}

// One locked write per entry so concurrent workers never interleave.
fn print_entry(fields: &Fields) {
    let rendered = format_entry(fields);
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    if let Err(err) = lock.write_all(rendered.as_bytes()).and_then(|()| lock.flush()) {
        warn!(error = %err, "failed to print entry");
    }
}
