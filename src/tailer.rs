use crate::error::InputError;
use crate::metrics;
use crate::watcher::FileWatch;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct TailOptions {
    /// Keep waiting for appended data once the end is reached.
    pub follow: bool,
    /// Switch to the new file when the path is rotated or truncated.
    pub reopen: bool,
    pub poll_interval: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            follow: true,
            reopen: true,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Device and inode of a file, used to notice that a path now names a
/// different file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn from_metadata(metadata: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    fn from_metadata(_metadata: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

pub(crate) async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Opens an input for reading. Directories are rejected.
pub async fn open_input(path: &Path) -> Result<File, InputError> {
    let open_err = |source| InputError::Open {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).await.map_err(open_err)?;
    let metadata = file.metadata().await.map_err(open_err)?;
    if metadata.is_dir() {
        return Err(InputError::IsDirectory(path.to_path_buf()));
    }
    Ok(file)
}

/// Produces the lines appended to one file, in order.
///
/// Lines end at `\n`; a trailing `\r` is dropped and invalid UTF-8 is replaced.
/// Without `follow` the sequence ends at end-of-file, including a final
/// unterminated line.
pub struct FileTailer {
    path: PathBuf,
    label: String,
    file: File,
    offset: u64,
    identity: Option<FileId>,
    pending: Vec<u8>,
    lines: VecDeque<String>,
    chunk: Vec<u8>,
    options: TailOptions,
    watch: Option<FileWatch>,
    finished: bool,
}

impl FileTailer {
    /// Starts tailing `file` (already opened from `path`) at byte `offset`.
    pub async fn new(path: PathBuf, mut file: File, offset: u64, options: TailOptions) -> Result<Self> {
        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("failed to seek {} to offset {}", path.display(), offset))?;
        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;

        let options = TailOptions {
            poll_interval: if options.poll_interval.is_zero() {
                Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
            } else {
                options.poll_interval
            },
            ..options
        };

        let watch = if options.follow {
            match FileWatch::new(&path, options.poll_interval) {
                Ok(watch) => Some(watch),
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        "file watcher unavailable; falling back to polling"
                    );
                    None
                }
            }
        } else {
            None
        };

        info!(path = %path.display(), offset, follow = options.follow, "starting tailer");

        Ok(Self {
            label: path.display().to_string(),
            path,
            file,
            offset,
            identity: FileId::from_metadata(&metadata),
            pending: Vec::new(),
            lines: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            options,
            watch,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next unread byte in the current file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next complete line. `None` when the input ended (no-follow) or `cancel`
    /// fired while waiting for data.
    pub async fn next_line(&mut self, cancel: &CancellationToken) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(line));
            }
            if self.finished {
                return Ok(None);
            }

            if self.read_chunk().await? > 0 {
                continue;
            }

            if !self.options.follow {
                self.finished = true;
                self.flush_partial();
                continue;
            }

            if self.options.reopen && self.check_rotation().await? {
                continue;
            }

            if self.wait(cancel).await {
                debug!(path = %self.path.display(), "tailer cancelled");
                return Ok(None);
            }
        }
    }

    async fn read_chunk(&mut self) -> Result<usize> {
        let n = self
            .file
            .read(&mut self.chunk)
            .await
            .with_context(|| format!("failed to read from {}", self.path.display()))?;
        if n > 0 {
            self.offset += n as u64;
            self.pending.extend_from_slice(&self.chunk[..n]);
            self.drain_complete_lines();
        }
        Ok(n)
    }

    fn drain_complete_lines(&mut self) {
        let mut start = 0usize;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            self.lines.push_back(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        if start > 0 {
            self.pending.drain(..start);
        }
    }

    fn flush_partial(&mut self) {
        if !self.pending.is_empty() {
            let line = decode_line(&self.pending);
            self.pending.clear();
            self.lines.push_back(line);
        }
    }

    /// Returns true when the tailer switched files or rewound.
    async fn check_rotation(&mut self) -> Result<bool> {
        let metadata = match fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!(
                    error = %err,
                    path = %self.path.display(),
                    "input path unavailable; waiting for it to reappear"
                );
                return Ok(false);
            }
        };

        let current = FileId::from_metadata(&metadata);
        if let (Some(previous), Some(current)) = (self.identity, current) {
            if previous != current {
                return self.reopen(current).await;
            }
        }

        if metadata.len() < self.offset {
            warn!(
                path = %self.path.display(),
                previous_offset = self.offset,
                current_size = metadata.len(),
                "input truncated; rewinding"
            );
            self.file
                .seek(SeekFrom::Start(0))
                .await
                .with_context(|| format!("failed to rewind {}", self.path.display()))?;
            self.offset = 0;
            self.pending.clear();
            metrics::FILE_ROTATIONS
                .with_label_values(&[self.label.as_str()])
                .inc();
            return Ok(true);
        }

        Ok(false)
    }

    async fn reopen(&mut self, identity: FileId) -> Result<bool> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) => {
                debug!(error = %err, path = %self.path.display(), "rotated input not ready yet");
                return Ok(false);
            }
        };

        // whatever was appended to the old file before the switch
        while self.read_chunk().await? > 0 {}
        self.flush_partial();

        info!(
            path = %self.path.display(),
            previous_offset = self.offset,
            "input rotated; reopening"
        );
        self.file = file;
        self.offset = 0;
        self.identity = Some(identity);
        metrics::FILE_ROTATIONS
            .with_label_values(&[self.label.as_str()])
            .inc();
        Ok(true)
    }

    /// Returns true when cancelled.
    async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let poll_interval = self.options.poll_interval;
        let Some(watch) = self.watch.as_mut() else {
            return sleep_or_cancel(poll_interval, cancel).await;
        };

        let watch_alive = tokio::select! {
            biased;
            _ = cancel.cancelled() => return true,
            alive = watch.changed() => alive,
            _ = sleep(poll_interval) => true,
        };
        if !watch_alive {
            debug!(path = %self.path.display(), "file watcher stopped; polling only");
            self.watch = None;
        }
        false
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn options(follow: bool) -> TailOptions {
        TailOptions {
            follow,
            reopen: true,
            poll_interval: Duration::from_millis(20),
        }
    }

    async fn tailer_at(path: &Path, offset: u64, follow: bool) -> FileTailer {
        let file = open_input(path).await.unwrap();
        FileTailer::new(path.to_path_buf(), file, offset, options(follow))
            .await
            .unwrap()
    }

    async fn next(tailer: &mut FileTailer) -> Option<String> {
        let cancel = CancellationToken::new();
        tokio::time::timeout(TIMEOUT, tailer.next_line(&cancel))
            .await
            .expect("tailer should produce a line")
            .unwrap()
    }

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }

    fn log_file(content: &str) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn without_follow_reads_existing_lines_then_ends() {
        let (_dir, path) = log_file("one\r\ntwo\n\nthree");
        let mut tailer = tailer_at(&path, 0, false).await;

        assert_eq!(next(&mut tailer).await.as_deref(), Some("one"));
        assert_eq!(next(&mut tailer).await.as_deref(), Some("two"));
        assert_eq!(next(&mut tailer).await.as_deref(), Some(""));
        assert_eq!(next(&mut tailer).await.as_deref(), Some("three"));
        assert_eq!(next(&mut tailer).await, None);
        assert_eq!(next(&mut tailer).await, None);
    }

    #[tokio::test]
    async fn starts_at_given_offset() {
        let (_dir, path) = log_file("skip me\nkeep me\n");
        let mut tailer = tailer_at(&path, 8, false).await;

        assert_eq!(next(&mut tailer).await.as_deref(), Some("keep me"));
        assert_eq!(next(&mut tailer).await, None);
        assert_eq!(tailer.offset(), 16);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin.log");
        std::fs::write(&path, b"ok \xff\xfe end\n").unwrap();
        let mut tailer = tailer_at(&path, 0, false).await;

        assert_eq!(next(&mut tailer).await.as_deref(), Some("ok \u{fffd}\u{fffd} end"));
    }

    #[tokio::test]
    async fn follow_picks_up_appended_lines() {
        let (_dir, path) = log_file("old\n");
        let mut tailer = tailer_at(&path, 4, true).await;

        let writer_path = path.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            append(&writer_path, "new ");
            sleep(Duration::from_millis(50)).await;
            append(&writer_path, "line\nsecond\n");
        });

        assert_eq!(next(&mut tailer).await.as_deref(), Some("new line"));
        assert_eq!(next(&mut tailer).await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn truncation_rewinds_to_start() {
        let (_dir, path) = log_file("aaaa\nbbbb\n");
        let mut tailer = tailer_at(&path, 0, true).await;
        assert_eq!(next(&mut tailer).await.as_deref(), Some("aaaa"));
        assert_eq!(next(&mut tailer).await.as_deref(), Some("bbbb"));

        std::fs::write(&path, "c\n").unwrap();
        assert_eq!(next(&mut tailer).await.as_deref(), Some("c"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rotation_switches_to_new_file() {
        let (dir, path) = log_file("one\n");
        let mut tailer = tailer_at(&path, 0, true).await;
        assert_eq!(next(&mut tailer).await.as_deref(), Some("one"));

        append(&path, "two");
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, "three\n").unwrap();

        assert_eq!(next(&mut tailer).await.as_deref(), Some("two"));
        assert_eq!(next(&mut tailer).await.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn cancel_releases_a_waiting_tailer() {
        let (_dir, path) = log_file("");
        let mut tailer = tailer_at(&path, 0, true).await;
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let line = tokio::time::timeout(TIMEOUT, tailer.next_line(&cancel))
            .await
            .expect("cancel should release the tailer")
            .unwrap();
        assert_eq!(line, None);
    }

    #[tokio::test]
    async fn open_input_rejects_directories_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();

        let err = open_input(dir.path()).await.unwrap_err();
        assert!(matches!(err, InputError::IsDirectory(_)));

        let err = open_input(&dir.path().join("missing.log")).await.unwrap_err();
        assert!(matches!(err, InputError::Open { .. }));
    }
}
