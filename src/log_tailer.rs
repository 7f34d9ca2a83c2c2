use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::log_line::decode_log_line;
use crate::storage::{utc_now, Database, LogStream, StorageResult};
use crate::tracker::Tracker;

type NotifyResult = Result<Event, notify::Error>;

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("{}:{}", metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(metadata: &Metadata) -> String {
    metadata
        .created()
        .ok()
        .and_then(|created| created.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|created| format!("created:{}", created.as_nanos()))
        .unwrap_or_default()
}

fn identity_matches(stored: Option<&str>, current: &str) -> bool {
    match stored {
        Some(stored) => {
            current.is_empty() || stored == current || stored.starts_with(&format!("{current}:"))
        }
        None => false,
    }
}

/// Complete lines read in one poll, with the byte offset each one starts at.
pub(crate) struct LineBatch {
    pub(crate) lines: Vec<(u64, String)>,
    pub(crate) end_position: u64,
}

/// Reads newline-terminated lines from `start`; a trailing partial line is
/// left for the next poll.
pub(crate) fn read_complete_lines(log_path: &Path, start: u64) -> Result<LineBatch, String> {
    let mut file = File::open(log_path).map_err(|error| error.to_string())?;
    file.seek(SeekFrom::Start(start))
        .map_err(|error| error.to_string())?;

    let mut reader = BufReader::new(file);
    let mut buffer = Vec::new();
    let mut position = start;
    let mut lines = Vec::new();

    loop {
        buffer.clear();
        let bytes_read = reader
            .read_until(b'\n', &mut buffer)
            .map_err(|error| error.to_string())?;
        if bytes_read == 0 || buffer.last() != Some(&b'\n') {
            break;
        }

        let text = String::from_utf8_lossy(&buffer)
            .trim_end_matches(&['\r', '\n'][..])
            .to_string();
        lines.push((position, text));
        position = position.saturating_add(bytes_read as u64);
    }

    Ok(LineBatch {
        lines,
        end_position: position,
    })
}

/// Points a stream's cursor at `position` of the file currently at `log_path`.
pub(crate) fn store_cursor(
    database: &Database,
    stream: LogStream,
    log_path: &Path,
    position: u64,
) -> StorageResult<()> {
    let Ok(metadata) = std::fs::metadata(log_path) else {
        return Ok(());
    };
    database.set_state(&stream.state_key("file_identity"), &file_identity(&metadata))?;
    database.set_state(&stream.state_key("file_position"), &position.to_string())
}

fn is_relevant_notification(event: &Event, log_path: &Path) -> bool {
    let relevant_kind = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
    if !relevant_kind {
        return false;
    }

    let Some(log_file_name) = log_path.file_name() else {
        return false;
    };

    event.paths.iter().any(|path| {
        path == log_path
            || path
                .file_name()
                .map(|file_name| file_name == log_file_name)
                .unwrap_or(false)
    })
}

fn start_watcher(
    log_path: &Path,
    notify_sender: mpsc::UnboundedSender<NotifyResult>,
) -> Result<RecommendedWatcher, String> {
    let mut watcher = notify::recommended_watcher(move |result| {
        if notify_sender.send(result).is_err() {
            tracing::debug!("Log watcher notification receiver dropped");
        }
    })
    .map_err(|error| error.to_string())?;

    let watch_directory = log_path
        .parent()
        .ok_or_else(|| format!("Invalid log path '{}'", log_path.display()))?;
    watcher
        .watch(watch_directory, RecursiveMode::NonRecursive)
        .map_err(|error| error.to_string())?;

    Ok(watcher)
}

async fn next_notification(
    receiver: &mut Option<mpsc::UnboundedReceiver<NotifyResult>>,
) -> Option<NotifyResult> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Follows one client log file and hands every complete line to a tracker.
///
/// The cursor (file identity, byte position, heartbeat) lives in the
/// database under keys namespaced by the stream, so a restart resumes where
/// the last finished poll stopped.
pub struct LogTailer {
    database: Arc<Database>,
    stream: LogStream,
    log_path: PathBuf,
    tracker: Box<dyn Tracker>,
    poll_interval: Duration,
}

impl LogTailer {
    pub fn new(
        database: Arc<Database>,
        stream: LogStream,
        log_path: PathBuf,
        tracker: Box<dyn Tracker>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            database,
            stream,
            log_path,
            tracker,
            poll_interval,
        }
    }

    fn state_key(&self, suffix: &str) -> String {
        self.stream.state_key(suffix)
    }

    fn touch_heartbeat(&self, now: &str) -> StorageResult<()> {
        self.database
            .set_state(&self.state_key("last_heartbeat_utc"), now)
    }

    /// Drains every complete line appended since the stored position and
    /// returns how many were stored.
    ///
    /// The new position is written once, after the whole batch. A crash in
    /// the middle of a batch replays that batch on restart and stores its
    /// lines a second time.
    pub fn poll_once(&mut self) -> StorageResult<usize> {
        let now = utc_now();
        let metadata = match std::fs::metadata(&self.log_path) {
            Ok(metadata) => metadata,
            Err(_) => {
                self.touch_heartbeat(&now)?;
                return Ok(0);
            }
        };

        let identity_key = self.state_key("file_identity");
        let position_key = self.state_key("file_position");
        let identity = file_identity(&metadata);
        let mut position = self
            .database
            .get_state(&position_key)?
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        let stored_identity = self.database.get_state(&identity_key)?;
        if !identity_matches(stored_identity.as_deref(), &identity) {
            if stored_identity.is_some() {
                tracing::info!(
                    stream = self.stream.as_str(),
                    path = %self.log_path.display(),
                    "Log file was replaced, reading from the start"
                );
            }
            position = 0;
            self.database.set_state(&identity_key, &identity)?;
        }

        if metadata.len() < position {
            tracing::info!(
                stream = self.stream.as_str(),
                path = %self.log_path.display(),
                position,
                file_length = metadata.len(),
                "Log file was truncated, reading from the start"
            );
            position = 0;
        }

        let batch = match read_complete_lines(&self.log_path, position) {
            Ok(batch) => batch,
            Err(error) => {
                tracing::warn!(
                    stream = self.stream.as_str(),
                    path = %self.log_path.display(),
                    error = %error,
                    "Failed to read log file"
                );
                self.touch_heartbeat(&now)?;
                return Ok(0);
            }
        };

        for (line_start, text) in &batch.lines {
            let event = self.database.insert_raw_event(
                self.stream,
                &now,
                &decode_log_line(text),
                *line_start,
            )?;
            self.tracker.handle_event(&event)?;
        }

        self.database
            .set_state(&position_key, &batch.end_position.to_string())?;
        self.touch_heartbeat(&now)?;

        let line_count = batch.lines.len();
        if line_count > 0 {
            tracing::debug!(
                stream = self.stream.as_str(),
                line_count,
                position = batch.end_position,
                "Processed log lines"
            );
        }
        Ok(line_count)
    }

    /// Waits one poll interval, returning early when the log file changes.
    async fn wait_for_change(
        &self,
        receiver: &mut Option<mpsc::UnboundedReceiver<NotifyResult>>,
    ) {
        let deadline = tokio::time::sleep(self.poll_interval);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return,
                notification = next_notification(receiver) => match notification {
                    Some(Ok(event)) => {
                        if is_relevant_notification(&event, &self.log_path) {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(
                            stream = self.stream.as_str(),
                            error = %error,
                            "Log watcher error"
                        );
                    }
                    None => *receiver = None,
                },
            }
        }
    }

    async fn run(mut self, stop: Arc<AtomicBool>) {
        let (notify_sender, notify_receiver) = mpsc::unbounded_channel::<NotifyResult>();
        let (_watcher, mut receiver) = match start_watcher(&self.log_path, notify_sender) {
            Ok(watcher) => (Some(watcher), Some(notify_receiver)),
            Err(error) => {
                tracing::warn!(
                    stream = self.stream.as_str(),
                    path = %self.log_path.display(),
                    error = %error,
                    "File notifications unavailable, polling only"
                );
                (None, None)
            }
        };

        tracing::info!(
            stream = self.stream.as_str(),
            path = %self.log_path.display(),
            "Log tailer started"
        );

        while !stop.load(Ordering::Relaxed) {
            if let Err(error) = self.poll_once() {
                tracing::error!(
                    stream = self.stream.as_str(),
                    error = %error,
                    "Log tailer stopped on storage error"
                );
                return;
            }
            self.wait_for_change(&mut receiver).await;
        }

        tracing::info!(stream = self.stream.as_str(), "Log tailer stopped");
    }

    /// Moves the tailer onto its own thread. Setting `stop` ends the worker
    /// at the next poll boundary.
    pub fn spawn(self, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>, String> {
        let thread_name = format!("tail-{}", self.stream.as_str());
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        tracing::error!(error = %error, "Failed to build tailer runtime");
                        return;
                    }
                };
                runtime.block_on(self.run(stop));
            })
            .map_err(|error| error.to_string())
    }
}
