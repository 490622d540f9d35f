//! Turning matched lines into error-tracking events.
//!
//! A [`SessionFactory`] hands every input worker its own [`ReportSession`], so
//! tags and breadcrumbs recorded for one file never show up on events from
//! another. [`EventReporter`] sits on top of a session and applies the per-input
//! tags and the dry-run switch.

pub mod sentry;

use crate::grok::Fields;
use crate::matcher::MatchResult;
use crate::metrics;
use crate::timestamp::parse_timestamp;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const MESSAGE_FIELD: &str = "message";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const PARSED_TIMESTAMP_TAG: &str = "parsed_timestamp";
pub const FILE_INPUT_PATH_TAG: &str = "file_input_path";

pub type Tags = BTreeMap<String, String>;

/// One event, built from a matched line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEvent {
    pub message: String,
    pub tags: Tags,
    /// The raw line, verbatim.
    pub log_entry: String,
    /// The pattern that matched.
    pub pattern: String,
    pub timestamp: Option<i64>,
}

impl ReportEvent {
    /// Tags are layered: `base_tags`, then every non-empty field, then
    /// `parsed_timestamp` when the `timestamp` field could be parsed.
    pub fn build(line: &str, matched: &MatchResult, base_tags: &Tags) -> Self {
        let message = matched
            .fields
            .get(MESSAGE_FIELD)
            .filter(|message| !message.is_empty())
            .cloned()
            .unwrap_or_else(|| line.to_string());
        let timestamp = field_timestamp(&matched.fields);

        let mut tags = base_tags.clone();
        for (key, value) in &matched.fields {
            if !value.is_empty() {
                tags.insert(key.clone(), value.clone());
            }
        }
        if let Some(ts) = timestamp {
            tags.insert(PARSED_TIMESTAMP_TAG.to_string(), ts.to_string());
        }

        Self {
            message,
            tags,
            log_entry: line.to_string(),
            pattern: matched.pattern.clone(),
            timestamp,
        }
    }
}

/// Parsed value of the `timestamp` field, if present and recognisable.
pub fn field_timestamp(fields: &Fields) -> Option<i64> {
    fields
        .get(TIMESTAMP_FIELD)
        .and_then(|raw| parse_timestamp(raw))
}

/// Per-input reporting context.
pub trait ReportSession: Send {
    fn add_breadcrumb(&mut self, message: &str, timestamp: Option<i64>);

    fn capture(&mut self, event: &ReportEvent);

    /// Blocks until queued events are sent or `timeout` elapses. Returns false
    /// on timeout.
    fn flush(&self, timeout: Duration) -> bool;
}

pub trait SessionFactory: Send + Sync {
    fn open_session(&self, input: &Path) -> Box<dyn ReportSession>;

    /// Process-wide flush on shutdown.
    fn flush(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Factory used in dry-run mode; nothing leaves the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSessions;

struct DisabledSession;

impl ReportSession for DisabledSession {
    fn add_breadcrumb(&mut self, _message: &str, _timestamp: Option<i64>) {}

    fn capture(&mut self, _event: &ReportEvent) {}

    fn flush(&self, _timeout: Duration) -> bool {
        true
    }
}

impl SessionFactory for DisabledSessions {
    fn open_session(&self, _input: &Path) -> Box<dyn ReportSession> {
        Box::new(DisabledSession)
    }
}

pub struct EventReporter {
    session: Box<dyn ReportSession>,
    tags: Tags,
    dry_run: bool,
    label: String,
}

impl EventReporter {
    /// `input` should be absolute; it is attached as `file_input_path` and
    /// can be overridden by `input_tags`.
    pub fn new(session: Box<dyn ReportSession>, input: &Path, input_tags: &Tags, dry_run: bool) -> Self {
        let label = input.display().to_string();
        let mut tags = Tags::new();
        tags.insert(FILE_INPUT_PATH_TAG.to_string(), label.clone());
        tags.extend(input_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            session,
            tags,
            dry_run,
            label,
        }
    }

    /// Submits one event for a matched line. Returns the event that was sent,
    /// or `None` in dry-run mode.
    pub fn report(&mut self, line: &str, matched: &MatchResult) -> Option<ReportEvent> {
        if self.dry_run {
            return None;
        }
        let event = ReportEvent::build(line, matched, &self.tags);
        self.session.capture(&event);
        metrics::EVENTS_REPORTED
            .with_label_values(&[self.label.as_str()])
            .inc();
        Some(event)
    }

    pub fn breadcrumb(&mut self, line: &str, timestamp: Option<i64>) {
        if self.dry_run {
            return;
        }
        self.session.add_breadcrumb(line, timestamp);
    }

    /// Flushes the session off the async runtime. Failures are logged only.
    pub async fn close(self, timeout: Duration) {
        if self.dry_run {
            return;
        }
        let Self { session, label, .. } = self;
        let started = Instant::now();
        match tokio::task::spawn_blocking(move || session.flush(timeout)).await {
            Ok(true) => {
                debug!(path = %label, elapsed_ms = started.elapsed().as_millis(), "session flushed");
            }
            Ok(false) => {
                warn!(path = %label, timeout_ms = timeout.as_millis(), "session flush timed out");
            }
            Err(err) => {
                warn!(path = %label, error = %err, "session flush task failed");
            }
        }
        metrics::FLUSH_DURATION.observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Session factory that records everything into a shared journal.

    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Record {
        Opened(PathBuf),
        Breadcrumb {
            input: PathBuf,
            message: String,
            timestamp: Option<i64>,
        },
        Captured {
            input: PathBuf,
            event: ReportEvent,
        },
        Flushed(PathBuf),
        FactoryFlushed,
    }

    #[derive(Clone, Default)]
    pub struct RecordingSessions {
        journal: Arc<Mutex<Vec<Record>>>,
    }

    struct RecordingSession {
        input: PathBuf,
        journal: Arc<Mutex<Vec<Record>>>,
    }

    impl RecordingSessions {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self) -> Vec<Record> {
            self.journal.lock().unwrap().clone()
        }

        pub fn events(&self) -> Vec<(PathBuf, ReportEvent)> {
            self.records()
                .into_iter()
                .filter_map(|record| match record {
                    Record::Captured { input, event } => Some((input, event)),
                    _ => None,
                })
                .collect()
        }

        fn push(journal: &Mutex<Vec<Record>>, record: Record) {
            journal.lock().unwrap().push(record);
        }
    }

    impl ReportSession for RecordingSession {
        fn add_breadcrumb(&mut self, message: &str, timestamp: Option<i64>) {
            RecordingSessions::push(
                &self.journal,
                Record::Breadcrumb {
                    input: self.input.clone(),
                    message: message.to_string(),
                    timestamp,
                },
            );
        }

        fn capture(&mut self, event: &ReportEvent) {
            RecordingSessions::push(
                &self.journal,
                Record::Captured {
                    input: self.input.clone(),
                    event: event.clone(),
                },
            );
        }

        fn flush(&self, _timeout: Duration) -> bool {
            RecordingSessions::push(&self.journal, Record::Flushed(self.input.clone()));
            true
        }
    }

    impl SessionFactory for RecordingSessions {
        fn open_session(&self, input: &Path) -> Box<dyn ReportSession> {
            Self::push(&self.journal, Record::Opened(input.to_path_buf()));
            Box::new(RecordingSession {
                input: input.to_path_buf(),
                journal: self.journal.clone(),
            })
        }

        fn flush(&self, _timeout: Duration) -> bool {
            Self::push(&self.journal, Record::FactoryFlushed);
            true
        }
    }
}
