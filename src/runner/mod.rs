//! Lifecycle supervision for the input workers.
//!
//! The supervisor owns one [`CancellationToken`] per generation of workers and
//! is the only place that cancels it. Workers are joined through a
//! [`JoinSet`]; a reload waits for every worker of the current generation to
//! close before any file is opened for the next one.

pub mod signals;

use crate::budget::EventBudget;
use crate::config::RunConfig;
use crate::grok::PatternRegistry;
use crate::matcher::LineMatcher;
use crate::metrics;
use crate::reporter::SessionFactory;
use crate::worker::{InputWorker, WorkerSettings, WorkerSummary};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Requests delivered to the supervisor, usually from OS signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Stop following, flush and exit. A second request forces the exit.
    Shutdown,
    /// Restart every input worker with the same configuration.
    Reload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every worker reached the end of its input (no-follow).
    Completed { failed: usize },
    /// Stopped on request; all workers drained and flushed.
    Graceful,
    /// Stopped without waiting for every worker to drain.
    Forced,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Completed { failed: 0 } | RunOutcome::Graceful => 0,
            RunOutcome::Completed { .. } => 1,
            RunOutcome::Forced => 130,
        }
    }
}

type WorkerExit = (PathBuf, Result<WorkerSummary>);

enum Wake {
    Finished { failed: usize },
    Shutdown,
    Reload,
}

/// Receiver wrapper that stays pending forever once every sender is gone.
struct ControlChannel {
    rx: mpsc::Receiver<Control>,
    closed: bool,
}

impl ControlChannel {
    fn new(rx: mpsc::Receiver<Control>) -> Self {
        Self { rx, closed: false }
    }

    async fn recv(&mut self) -> Control {
        if !self.closed {
            if let Some(request) = self.rx.recv().await {
                return request;
            }
            debug!("control channel closed");
            self.closed = true;
        }
        std::future::pending().await
    }
}

pub struct Supervisor {
    run: Arc<RunConfig>,
    matchers: Vec<Arc<LineMatcher>>,
    sessions: Arc<dyn SessionFactory>,
    budget: Option<Arc<EventBudget>>,
}

impl Supervisor {
    /// Loads the pattern registry and compiles every input's patterns. Any
    /// error here is fatal: nothing has been opened yet.
    pub fn new(run: RunConfig, sessions: Arc<dyn SessionFactory>) -> Result<Self> {
        if run.inputs.is_empty() {
            anyhow::bail!("no file inputs specified");
        }

        let registry = build_registry(&run.pattern_files)?;
        let matchers = run
            .inputs
            .iter()
            .map(|input| {
                LineMatcher::compile(&registry, &input.patterns)
                    .map(Arc::new)
                    .with_context(|| format!("invalid patterns for input {}", input.path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        let budget = run.max_events.map(|limit| Arc::new(EventBudget::new(limit)));

        Ok(Self {
            run: Arc::new(run),
            matchers,
            sessions,
            budget,
        })
    }

    /// Runs generations of workers until they all finish or a shutdown is
    /// requested through `control`.
    pub async fn run(self, control: mpsc::Receiver<Control>) -> Result<RunOutcome> {
        let mut control = ControlChannel::new(control);
        let mut generation: u64 = 0;

        loop {
            generation += 1;
            let workers = self.prepare().await?;
            let cancel = CancellationToken::new();
            let mut set = JoinSet::new();
            for worker in workers {
                let path = worker.path().to_path_buf();
                let cancel = cancel.clone();
                set.spawn(async move { (path, worker.run(cancel).await) });
            }
            metrics::GENERATIONS.inc();
            info!(generation, inputs = set.len(), "input workers started");

            match self.supervise(&mut set, &mut control).await {
                Wake::Finished { failed } => {
                    self.flush_sessions().await;
                    info!(failed, "all inputs finished");
                    return Ok(RunOutcome::Completed { failed });
                }
                Wake::Shutdown => {
                    cancel.cancel();
                    return Ok(self.shutdown(set, &mut control).await);
                }
                Wake::Reload => {
                    info!(generation, "reload requested; stopping input workers");
                    cancel.cancel();
                    if drain_for_reload(&mut set, &mut control).await {
                        return Ok(self.shutdown(set, &mut control).await);
                    }
                    debug!(generation, "all input workers closed");
                }
            }
        }
    }

    /// Opens every input for a new generation. Inputs are opened in order and
    /// the first failure aborts the generation.
    async fn prepare(&self) -> Result<Vec<InputWorker>> {
        let settings = WorkerSettings::from(self.run.as_ref());
        let mut workers = Vec::with_capacity(self.run.inputs.len());
        for (spec, matcher) in self.run.inputs.iter().zip(&self.matchers) {
            let worker = InputWorker::open(
                spec.clone(),
                matcher.clone(),
                self.sessions.as_ref(),
                settings,
                self.budget.clone(),
            )
            .await?;
            workers.push(worker);
        }
        Ok(workers)
    }

    async fn supervise(&self, set: &mut JoinSet<WorkerExit>, control: &mut ControlChannel) -> Wake {
        let mut failed = 0;
        loop {
            tokio::select! {
                biased;
                request = control.recv() => {
                    return match request {
                        Control::Shutdown => {
                            info!("shutdown requested");
                            Wake::Shutdown
                        }
                        Control::Reload => Wake::Reload,
                    };
                }
                _ = budget_exhausted(self.budget.as_deref()) => {
                    info!("event limit reached; shutting down");
                    return Wake::Shutdown;
                }
                joined = set.join_next() => match joined {
                    Some(result) => {
                        if record_exit(result) {
                            failed += 1;
                        }
                    }
                    None => return Wake::Finished { failed },
                },
            }
        }
    }

    /// Waits up to the shutdown grace for cancelled workers to drain. A second
    /// shutdown request or the grace running out aborts whatever is left.
    async fn shutdown(&self, mut set: JoinSet<WorkerExit>, control: &mut ControlChannel) -> RunOutcome {
        info!(
            workers = set.len(),
            grace_ms = self.run.shutdown_grace.as_millis(),
            "stopping input workers"
        );
        let deadline = sleep(self.run.shutdown_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                request = control.recv() => match request {
                    Control::Shutdown => {
                        warn!(remaining = set.len(), "second shutdown request; exiting without flushing");
                        set.shutdown().await;
                        return RunOutcome::Forced;
                    }
                    Control::Reload => debug!("ignoring reload request during shutdown"),
                },
                _ = &mut deadline => {
                    warn!(remaining = set.len(), "input workers did not stop in time; aborting");
                    set.shutdown().await;
                    self.flush_sessions().await;
                    return RunOutcome::Forced;
                }
                joined = set.join_next() => match joined {
                    Some(result) => {
                        record_exit(result);
                    }
                    None => break,
                },
            }
        }

        self.flush_sessions().await;
        info!("shutdown complete");
        RunOutcome::Graceful
    }

    async fn flush_sessions(&self) {
        let sessions = self.sessions.clone();
        let timeout = self.run.flush_timeout;
        match tokio::task::spawn_blocking(move || sessions.flush(timeout)).await {
            Ok(true) => debug!("reporting client flushed"),
            Ok(false) => warn!(timeout_ms = timeout.as_millis(), "reporting client flush timed out"),
            Err(err) => warn!(error = %err, "reporting client flush task failed"),
        }
    }
}

/// Registry with the built-in patterns followed by `files`, in order.
pub fn build_registry(files: &[PathBuf]) -> Result<PatternRegistry> {
    let mut registry = PatternRegistry::with_defaults().context("built-in patterns are invalid")?;
    for path in files {
        registry.load_file(path)?;
    }
    debug!(patterns = registry.len(), "pattern registry ready");
    Ok(registry)
}

async fn budget_exhausted(budget: Option<&EventBudget>) {
    match budget {
        Some(budget) => budget.exhausted().await,
        None => std::future::pending().await,
    }
}

/// Joins every cancelled worker. Returns true when a shutdown request arrived
/// in the meantime; further reload requests are folded into this one.
async fn drain_for_reload(set: &mut JoinSet<WorkerExit>, control: &mut ControlChannel) -> bool {
    loop {
        tokio::select! {
            biased;
            request = control.recv() => match request {
                Control::Shutdown => {
                    info!("shutdown requested during reload");
                    return true;
                }
                Control::Reload => debug!("reload already in progress"),
            },
            joined = set.join_next() => match joined {
                Some(result) => {
                    record_exit(result);
                }
                None => return false,
            },
        }
    }
}

/// Logs how a worker ended. Returns true if it failed.
fn record_exit(joined: Result<WorkerExit, JoinError>) -> bool {
    match joined {
        Ok((path, Ok(summary))) => {
            info!(
                path = %path.display(),
                lines = summary.lines,
                matched = summary.matched,
                reported = summary.reported,
                "input worker closed"
            );
            false
        }
        Ok((path, Err(err))) => {
            let message = format!("{err:#}");
            error!(path = %path.display(), error = %message, "input degraded; other inputs keep running");
            count_failure(&path);
            true
        }
        Err(err) if err.is_cancelled() => {
            debug!("input worker aborted");
            false
        }
        Err(err) => {
            error!(error = %err, "input worker panicked");
            true
        }
    }
}

fn count_failure(path: &Path) {
    let label = path.display().to_string();
    metrics::WORKER_FAILURES
        .with_label_values(&[label.as_str()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputSpec;
    use crate::error::{InputError, PatternError};
    use crate::reporter::testing::{Record, RecordingSessions};
    use crate::seek::SeekPosition;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    const APACHE_LINE: &str =
        r#"127.0.0.1 - - [23/Apr/2014:22:58:32 +0200] "GET /index.php HTTP/1.1" 404 207"#;

    fn input(dir: &TempDir, name: &str, content: &str, env: &str, follow: bool) -> InputSpec {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        InputSpec {
            path,
            follow,
            start: SeekPosition::Line(0),
            patterns: vec!["COMMONAPACHELOG".to_string()],
            tags: BTreeMap::from([("env".to_string(), env.to_string())]),
        }
    }

    fn run_config(inputs: Vec<InputSpec>) -> RunConfig {
        let mut run = RunConfig::new(inputs);
        run.poll_interval = Duration::from_millis(20);
        run.flush_timeout = Duration::from_secs(1);
        run.shutdown_grace = Duration::from_secs(2);
        run
    }

    fn supervisor(run: RunConfig, sessions: &RecordingSessions) -> Supervisor {
        Supervisor::new(run, Arc::new(sessions.clone())).unwrap()
    }

    async fn wait_for(sessions: &RecordingSessions, what: &str, done: impl Fn(&[Record]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done(&sessions.records()) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn append(path: &Path, line: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        writeln!(file, "{line}").unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunOutcome::Completed { failed: 0 }.exit_code(), 0);
        assert_eq!(RunOutcome::Completed { failed: 2 }.exit_code(), 1);
        assert_eq!(RunOutcome::Graceful.exit_code(), 0);
        assert_eq!(RunOutcome::Forced.exit_code(), 130);
    }

    #[tokio::test]
    async fn each_input_reports_with_its_own_tags() {
        let dir = tempfile::tempdir().unwrap();
        let prod = input(&dir, "prod.log", &format!("{APACHE_LINE}\n"), "prod", false);
        let staging = input(&dir, "staging.log", &format!("{APACHE_LINE}\n"), "staging", false);
        let sessions = RecordingSessions::new();
        let (_tx, rx) = mpsc::channel(4);

        let outcome = supervisor(run_config(vec![prod.clone(), staging.clone()]), &sessions)
            .run(rx)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { failed: 0 });

        let events = sessions.events();
        assert_eq!(events.len(), 2);
        for (path, event) in &events {
            let expected = if path == &prod.path { "prod" } else { "staging" };
            assert_eq!(event.tags["env"], expected);
            assert_eq!(event.tags["file_input_path"], path.display().to_string());
        }
        assert_eq!(sessions.records().last(), Some(&Record::FactoryFlushed));
    }

    #[tokio::test]
    async fn shutdown_drains_and_flushes_every_worker() {
        let dir = tempfile::tempdir().unwrap();
        let a = input(&dir, "a.log", "", "prod", true);
        let b = input(&dir, "b.log", "", "prod", true);
        let sessions = RecordingSessions::new();
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(supervisor(run_config(vec![a.clone(), b.clone()]), &sessions).run(rx));

        wait_for(&sessions, "both sessions", |records| {
            records.iter().filter(|r| matches!(r, Record::Opened(_))).count() == 2
        })
        .await;
        tx.send(Control::Shutdown).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor should stop")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Graceful);

        let records = sessions.records();
        assert!(records.contains(&Record::Flushed(a.path)));
        assert!(records.contains(&Record::Flushed(b.path)));
        assert_eq!(records.last(), Some(&Record::FactoryFlushed));
    }

    #[tokio::test]
    async fn reload_closes_old_generation_before_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let a = input(&dir, "a.log", "", "prod", true);
        let sessions = RecordingSessions::new();
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(supervisor(run_config(vec![a.clone()]), &sessions).run(rx));

        wait_for(&sessions, "first session", |records| !records.is_empty()).await;
        append(&a.path, APACHE_LINE);
        wait_for(&sessions, "first event", |records| {
            records.iter().any(|r| matches!(r, Record::Captured { .. }))
        })
        .await;

        tx.send(Control::Reload).await.unwrap();
        tx.send(Control::Reload).await.unwrap();
        wait_for(&sessions, "second session", |records| {
            records.iter().filter(|r| matches!(r, Record::Opened(_))).count() == 2
        })
        .await;

        let records = sessions.records();
        let first_flush = records
            .iter()
            .position(|r| r == &Record::Flushed(a.path.clone()))
            .expect("first generation flushed");
        let second_open = records
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r, Record::Opened(_)))
            .nth(1)
            .map(|(i, _)| i)
            .unwrap();
        assert!(first_flush < second_open);

        // the new generation starts over from line 0, then keeps following
        append(&a.path, APACHE_LINE);
        wait_for(&sessions, "new generation events", |records| {
            records.iter().filter(|r| matches!(r, Record::Captured { .. })).count() == 3
        })
        .await;

        tx.send(Control::Shutdown).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor should stop")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Graceful);
    }

    #[tokio::test]
    async fn event_limit_ends_the_run_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("{APACHE_LINE}\n").repeat(5);
        let a = input(&dir, "a.log", &content, "prod", true);
        let sessions = RecordingSessions::new();
        let mut run = run_config(vec![a]);
        run.max_events = Some(3);
        let (_tx, rx) = mpsc::channel(4);

        let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor(run, &sessions).run(rx))
            .await
            .expect("event limit should stop the run")
            .unwrap();
        assert_eq!(outcome, RunOutcome::Graceful);
        assert_eq!(sessions.events().len(), 3);
    }

    #[tokio::test]
    async fn second_shutdown_forces_exit() {
        let dir = tempfile::tempdir().unwrap();
        let a = input(&dir, "a.log", "", "prod", true);
        let sessions = RecordingSessions::new();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Control::Shutdown).await.unwrap();
        tx.send(Control::Shutdown).await.unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor(run_config(vec![a]), &sessions).run(rx),
        )
        .await
        .expect("forced shutdown should be quick")
        .unwrap();
        assert_eq!(outcome, RunOutcome::Forced);
        assert!(!sessions.records().contains(&Record::FactoryFlushed));
    }

    #[tokio::test]
    async fn closed_control_channel_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let a = input(&dir, "a.log", &format!("{APACHE_LINE}\n"), "prod", false);
        let sessions = RecordingSessions::new();
        let (tx, rx) = mpsc::channel(1);
        drop(tx);

        let outcome = supervisor(run_config(vec![a]), &sessions).run(rx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { failed: 0 });
        assert_eq!(sessions.events().len(), 1);
    }

    #[test]
    fn unknown_pattern_is_fatal_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = input(&dir, "a.log", "", "prod", false);
        a.patterns = vec!["%{NOT_A_PATTERN:x}".to_string()];
        let err = Supervisor::new(run_config(vec![a]), Arc::new(RecordingSessions::new()))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<PatternError>(),
            Some(PatternError::UnknownReference(name)) if name == "NOT_A_PATTERN"
        ));
    }

    #[test]
    fn no_inputs_is_fatal() {
        let err = Supervisor::new(run_config(Vec::new()), Arc::new(RecordingSessions::new()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("no file inputs"));
    }

    #[test]
    fn pattern_files_extend_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let patterns = dir.path().join("custom.txt");
        std::fs::write(&patterns, "# custom\nAPP_ERROR ERROR %{GREEDYDATA:message}\n").unwrap();

        let registry = build_registry(&[patterns.clone()]).unwrap();
        assert!(registry.contains("APP_ERROR"));

        let missing = dir.path().join("missing.txt");
        let err = build_registry(&[missing]).unwrap_err();
        assert!(matches!(err.downcast_ref::<PatternError>(), Some(PatternError::Io { .. })));
    }

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = input(&dir, "a.log", "", "prod", false);
        a.path = dir.path().join("missing.log");
        let (_tx, rx) = mpsc::channel(1);

        let err = supervisor(run_config(vec![a]), &RecordingSessions::new())
            .run(rx)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<InputError>(), Some(InputError::Open { .. })));
    }

    #[tokio::test]
    async fn directory_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = input(&dir, "a.log", "", "prod", false);
        a.path = dir.path().to_path_buf();
        let (_tx, rx) = mpsc::channel(1);

        let err = supervisor(run_config(vec![a]), &RecordingSessions::new())
            .run(rx)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<InputError>(), Some(InputError::IsDirectory(_))));
    }
}
