//! Rebuilding attempt tables from stored or archived log lines.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::log_line::{decode_log_line, LogLine};
use crate::log_tailer::{read_complete_lines, store_cursor};
use crate::storage::{utc_now, AttemptSource, AttemptStatus, Database, LogStream, StorageResult};
use crate::tracker::rules::CONTEXT_MESSAGE_PREFIX;
use crate::tracker::{ChatTracker, ChatTrackerConfig, Tracker};

const LATEST_LOG_FILE_NAME: &str = "latest.log";
const ARCHIVED_LOG_SUFFIX: &str = ".log.gz";

lazy_static! {
    static ref DATED_LOG_NAME: Regex =
        Regex::new(r"^(?P<date>\d{4}-\d{2}-\d{2})-(?P<sequence>\d+)\.log(?:\.gz)?$")
            .expect("valid dated log name pattern");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub deleted_attempts: usize,
    pub events_replayed: usize,
    pub attempts_rebuilt: usize,
}

/// Drops chat-sourced attempts and replays every stored chat-stream line
/// through a fresh tracker, in id order.
pub fn rebuild_chat_attempts(
    database: &Arc<Database>,
    config: ChatTrackerConfig,
) -> StorageResult<RebuildReport> {
    let deleted_attempts = database.delete_attempts_by_source(AttemptSource::Chat)?;
    let mut tracker = ChatTracker::new(Arc::clone(database), config)?;

    let events = database.raw_events_for_stream(LogStream::Chat)?;
    for event in &events {
        tracker.handle_event(event)?;
    }

    let attempts_rebuilt = count_chat_attempts(database)?.0;
    tracing::info!(
        deleted_attempts,
        events_replayed = events.len(),
        attempts_rebuilt,
        "Rebuilt chat attempts"
    );

    Ok(RebuildReport {
        deleted_attempts,
        events_replayed: events.len(),
        attempts_rebuilt,
    })
}

fn count_chat_attempts(database: &Database) -> StorageResult<(usize, usize)> {
    let attempts = database.attempts()?;
    let chat_attempts = attempts
        .iter()
        .filter(|attempt| attempt.attempt_source == AttemptSource::Chat.as_str());
    let (total, finished) = chat_attempts.fold((0, 0), |(total, finished), attempt| {
        let is_finished = matches!(
            AttemptStatus::parse(&attempt.status),
            Some(AttemptStatus::Success | AttemptStatus::Fail)
        );
        (total + 1, finished + usize::from(is_finished))
    });
    Ok((total, finished))
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillOptions {
    pub days: u32,
    pub start_on_context: bool,
    /// Ends the import at the first context marker, before storing it.
    pub stop_on_context: bool,
    pub tracker: ChatTrackerConfig,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            days: 3,
            start_on_context: true,
            stop_on_context: false,
            tracker: ChatTrackerConfig {
                require_fresh_context: false,
                ..ChatTrackerConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub files_scanned: usize,
    pub lines_scanned: usize,
    pub raw_events_inserted: usize,
    pub attempts_total: usize,
    pub attempts_finished: usize,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ArchivedLog {
    path: PathBuf,
    file_name: String,
    log_date: NaiveDate,
    sort_key: NaiveDateTime,
    sequence: u32,
}

impl ArchivedLog {
    fn is_latest(&self) -> bool {
        self.file_name == LATEST_LOG_FILE_NAME
    }
}

fn modified_local(path: &Path) -> Option<NaiveDateTime> {
    let modified = std::fs::metadata(path).and_then(|metadata| metadata.modified()).ok()?;
    Some(DateTime::<Local>::from(modified).naive_local())
}

/// Day and per-day sequence number of a `YYYY-MM-DD-N.log.gz` name.
fn dated_name(file_name: &str) -> Option<(NaiveDate, u32)> {
    let captures = DATED_LOG_NAME.captures(file_name)?;
    let date = NaiveDate::parse_from_str(captures.name("date")?.as_str(), "%Y-%m-%d").ok()?;
    let sequence = captures.name("sequence")?.as_str().parse().ok()?;
    Some((date, sequence))
}

/// `latest.log` modified after the cutoff plus `.log.gz` archives dated on or
/// after the cutoff day, oldest first.
fn discover_log_files(logs_dir: &Path, cutoff: NaiveDateTime) -> Result<Vec<ArchivedLog>, String> {
    let entries = std::fs::read_dir(logs_dir).map_err(|error| {
        format!("Failed to read logs directory '{}': {error}", logs_dir.display())
    })?;

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()).map(str::to_string)
        else {
            continue;
        };
        let Some(modified) = modified_local(&path) else {
            continue;
        };

        let candidate = if file_name == LATEST_LOG_FILE_NAME {
            (modified >= cutoff).then_some((modified.date(), modified, 0))
        } else if file_name.ends_with(ARCHIVED_LOG_SUFFIX) {
            let (log_date, sort_key, sequence) = match dated_name(&file_name) {
                Some((date, sequence)) => (date, date.and_time(NaiveTime::MIN), sequence),
                None => (modified.date(), modified, 0),
            };
            (log_date >= cutoff.date()).then_some((log_date, sort_key, sequence))
        } else {
            None
        };

        if let Some((log_date, sort_key, sequence)) = candidate {
            files.push(ArchivedLog {
                path,
                file_name,
                log_date,
                sort_key,
                sequence,
            });
        }
    }

    files.sort_by(|left, right| {
        (left.sort_key, left.sequence, &left.file_name).cmp(&(
            right.sort_key,
            right.sequence,
            &right.file_name,
        ))
    });
    Ok(files)
}

fn read_archived_lines(path: &Path) -> Result<Vec<(u64, String)>, String> {
    let file = File::open(path).map_err(|error| error.to_string())?;
    let mut reader = BufReader::new(GzDecoder::new(file));
    let mut buffer = Vec::new();
    let mut position = 0u64;
    let mut lines = Vec::new();

    loop {
        buffer.clear();
        let bytes_read = reader
            .read_until(b'\n', &mut buffer)
            .map_err(|error| error.to_string())?;
        if bytes_read == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&buffer)
            .trim_end_matches(&['\r', '\n'][..])
            .to_string();
        lines.push((position, text));
        position = position.saturating_add(bytes_read as u64);
    }

    Ok(lines)
}

/// Local wall-clock time of a line, anchored on the log's day, in UTC.
fn event_timestamp(log_date: NaiveDate, clock_time: Option<&str>) -> String {
    clock_time
        .and_then(|clock| NaiveTime::parse_from_str(clock, "%H:%M:%S").ok())
        .and_then(|time| Local.from_local_datetime(&log_date.and_time(time)).earliest())
        .map(|local| {
            local
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, false)
        })
        .unwrap_or_else(utc_now)
}

fn is_context_line(line: &LogLine) -> bool {
    line.is_chat
        && line
            .chat_message
            .as_deref()
            .is_some_and(|message| message.starts_with(CONTEXT_MESSAGE_PREFIX.trim_end()))
}

/// Re-imports the chat stream from a client `logs/` directory.
///
/// Chat attempts, chat raw events and the chat cursor are replaced. When
/// `latest.log` is part of the import the cursor is left at its end, or at
/// the stop marker, so a live tailer picks up from there.
pub fn backfill_from_logs(
    database: &Arc<Database>,
    logs_dir: &Path,
    options: &BackfillOptions,
) -> Result<BackfillReport, String> {
    let cutoff = Local::now().naive_local() - chrono::Duration::days(i64::from(options.days));
    backfill_since(database, logs_dir, cutoff, options)
}

fn backfill_since(
    database: &Arc<Database>,
    logs_dir: &Path,
    cutoff: NaiveDateTime,
    options: &BackfillOptions,
) -> Result<BackfillReport, String> {
    if !logs_dir.is_dir() {
        return Err(format!("Logs directory not found: {}", logs_dir.display()));
    }

    let files = discover_log_files(logs_dir, cutoff)?;
    let mut report = BackfillReport {
        files_scanned: files.len(),
        ..BackfillReport::default()
    };
    if files.is_empty() {
        tracing::info!(logs_dir = %logs_dir.display(), "No logs newer than the cutoff");
        return Ok(report);
    }

    database
        .delete_attempts_by_source(AttemptSource::Chat)
        .map_err(|error| error.to_string())?;
    database
        .reset_stream(LogStream::Chat)
        .map_err(|error| error.to_string())?;
    let mut tracker = ChatTracker::new(Arc::clone(database), options.tracker)
        .map_err(|error| error.to_string())?;

    let mut started = !options.start_on_context;
    for log_file in &files {
        let (lines, mut latest_end) = if log_file.is_latest() {
            let batch = read_complete_lines(&log_file.path, 0)?;
            (batch.lines, Some(batch.end_position))
        } else {
            (read_archived_lines(&log_file.path)?, None)
        };
        tracing::debug!(
            path = %log_file.path.display(),
            line_count = lines.len(),
            "Backfilling log file"
        );

        for (offset, text) in lines {
            report.lines_scanned += 1;
            let line = decode_log_line(&text);
            let is_context = is_context_line(&line);
            if !started {
                if !is_context {
                    continue;
                }
                started = true;
                report.started_at = Some(format!("{}:{offset}", log_file.file_name));
            }
            if options.stop_on_context && is_context {
                report.stopped_at = Some(format!("{}:{offset}", log_file.file_name));
                latest_end = latest_end.map(|_| offset);
                break;
            }

            let ingested_at = event_timestamp(log_file.log_date, line.clock_time.as_deref());
            let event = database
                .insert_raw_event(LogStream::Chat, &ingested_at, &line, offset)
                .map_err(|error| error.to_string())?;
            tracker
                .handle_event(&event)
                .map_err(|error| error.to_string())?;
            report.raw_events_inserted += 1;
        }

        if let Some(end_position) = latest_end {
            store_cursor(database, LogStream::Chat, &log_file.path, end_position)
                .map_err(|error| error.to_string())?;
        }
        if report.stopped_at.is_some() {
            break;
        }
    }

    let (attempts_total, attempts_finished) =
        count_chat_attempts(database).map_err(|error| error.to_string())?;
    report.attempts_total = attempts_total;
    report.attempts_finished = attempts_finished;

    tracing::info!(
        files_scanned = report.files_scanned,
        raw_events_inserted = report.raw_events_inserted,
        attempts_total,
        "Backfill finished"
    );
    Ok(report)
}
