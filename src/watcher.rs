use anyhow::{Context, Result};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

// Wake-ups only; a full channel already guarantees a pending wake-up.
const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Change notifications for a single file path.
///
/// The parent directory is watched (non-recursively) so that the file being
/// removed, renamed or recreated is noticed too.
pub struct FileWatch {
    // dropping the watcher stops the notify thread
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<()>,
}

impl FileWatch {
    pub fn new(path: &Path, poll_interval: Duration) -> Result<Self> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir().context("failed to resolve working directory")?,
        };
        let file_name = path
            .file_name()
            .map(OsString::from)
            .with_context(|| format!("input path has no file name: {}", path.display()))?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => handle_event(&tx, &file_name, event),
                Err(err) => warn!(error = %err, "file watcher error"),
            },
            NotifyConfig::default().with_poll_interval(poll_interval),
        )
        .context("failed to create notify watcher")?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch directory {}", parent.display()))?;
        debug!(path = %path.display(), dir = %parent.display(), "watching input for changes");

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// Waits for the next change. Returns `false` once the watcher is gone.
    pub async fn changed(&mut self) -> bool {
        let alive = self.events.recv().await.is_some();
        // fold bursts into a single wake-up
        while self.events.try_recv().is_ok() {}
        alive
    }
}

fn handle_event(tx: &mpsc::Sender<()>, file_name: &OsString, event: Event) {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()));
    if !relevant {
        return;
    }

    trace!(kind = ?event.kind, "input changed");
    match tx.try_send(()) {
        Ok(()) | Err(TrySendError::Full(())) => {}
        Err(TrySendError::Closed(())) => {
            trace!("watch receiver dropped; ignoring event");
        }
    }
}
