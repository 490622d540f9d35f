//! Sessions backed by the Sentry SDK. Each session is its own `Hub` sharing
//! one client, so scope state stays per input.

use super::{ReportEvent, ReportSession, SessionFactory};
use ::sentry::protocol::{Breadcrumb, Event, Level, Value};
use ::sentry::types::Dsn;
use ::sentry::{Client, ClientInitGuard, ClientOptions, Hub, Scope};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

pub struct SentrySessions {
    client: Arc<Client>,
    // keeps the global client (and panic integration) alive
    _guard: Option<ClientInitGuard>,
}

impl SentrySessions {
    /// Installs the process-wide Sentry client for `dsn`.
    pub fn init(dsn: &str) -> Result<Self> {
        let parsed: Dsn = dsn.parse().context("invalid Sentry DSN")?;
        let host = parsed.host().to_string();
        let guard = ::sentry::init(ClientOptions {
            dsn: Some(parsed),
            release: ::sentry::release_name!(),
            ..Default::default()
        });
        let client = Hub::main()
            .client()
            .context("Sentry client was not bound after init")?;
        info!(host = %host, "Sentry reporting enabled");
        Ok(Self {
            client,
            _guard: Some(guard),
        })
    }

    pub fn from_client(client: Arc<Client>) -> Self {
        Self {
            client,
            _guard: None,
        }
    }
}

impl SessionFactory for SentrySessions {
    fn open_session(&self, _input: &Path) -> Box<dyn ReportSession> {
        let hub = Hub::new(Some(self.client.clone()), Arc::new(Scope::default()));
        Box::new(SentrySession { hub: Arc::new(hub) })
    }

    fn flush(&self, timeout: Duration) -> bool {
        self.client.flush(Some(timeout))
    }
}

struct SentrySession {
    hub: Arc<Hub>,
}

impl ReportSession for SentrySession {
    fn add_breadcrumb(&mut self, message: &str, timestamp: Option<i64>) {
        let timestamp = timestamp
            .and_then(|secs| u64::try_from(secs).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap_or_else(SystemTime::now);
        self.hub.add_breadcrumb(Breadcrumb {
            message: Some(message.to_string()),
            level: Level::Info,
            timestamp,
            ..Default::default()
        });
    }

    fn capture(&mut self, event: &ReportEvent) {
        let mut sentry_event = Event {
            message: Some(event.message.clone()),
            level: Level::Error,
            tags: event.tags.clone(),
            ..Default::default()
        };
        sentry_event
            .extra
            .insert("log_entry".to_string(), Value::from(event.log_entry.clone()));
        sentry_event
            .extra
            .insert("pattern".to_string(), Value::from(event.pattern.clone()));
        self.hub.capture_event(sentry_event);
    }

    fn flush(&self, timeout: Duration) -> bool {
        self.hub
            .client()
            .map(|client| client.flush(Some(timeout)))
            .unwrap_or(true)
    }
}
