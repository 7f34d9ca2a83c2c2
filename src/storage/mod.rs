//! SQLite-backed store for raw log events, attempts and ingest bookkeeping.
//!
//! Every call takes the single connection mutex for its whole duration, so the
//! chat and telemetry workers never interleave writes.

mod model;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::log_line::LogLine;

pub use model::{
    AttemptBedRow, AttemptEventRow, AttemptFieldUpdate, AttemptRow, AttemptSource, AttemptStatus,
    ChatAttemptStart, DamageKind, LogStream, NewAttemptBed, NewAttemptEvent, RawEvent,
    TelemetryAttempt,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage connection lock poisoned")]
    LockPoisoned,
    #[error("failed to prepare database directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub struct Database {
    connection: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent_directory) = path.parent() {
            if !parent_directory.as_os_str().is_empty() {
                std::fs::create_dir_all(parent_directory).map_err(|source| StorageError::Io {
                    path: parent_directory.to_path_buf(),
                    source,
                })?;
            }
        }

        let connection = Connection::open(path)?;
        connection.busy_timeout(Duration::from_secs(30))?;
        let journal_mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(
                database_path = %path.display(),
                journal_mode = %journal_mode,
                "SQLite did not switch to WAL journal mode"
            );
        }
        connection.pragma_update(None, "synchronous", "NORMAL")?;

        Self::initialize(connection)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(connection: Connection) -> StorageResult<Self> {
        connection.pragma_update(None, "foreign_keys", "ON")?;
        connection.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| StorageError::LockPoisoned)
    }

    pub fn get_state(&self, key: &str) -> StorageResult<Option<String>> {
        let connection = self.lock()?;
        let value = connection
            .query_row(
                "SELECT value FROM ingest_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> StorageResult<()> {
        let connection = self.lock()?;
        connection.execute(
            "INSERT INTO ingest_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn insert_raw_event(
        &self,
        stream: LogStream,
        ingested_at_utc: &str,
        line: &LogLine,
        file_offset: u64,
    ) -> StorageResult<RawEvent> {
        let connection = self.lock()?;
        connection.execute(
            "INSERT INTO raw_log_events (
                stream, ingested_at_utc, clock_time, thread_name, level, source,
                is_chat, chat_message, body, raw_line, file_offset
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                stream.as_str(),
                ingested_at_utc,
                line.clock_time,
                line.thread_name,
                line.level,
                line.source,
                line.is_chat,
                line.chat_message,
                line.body,
                line.raw_line,
                file_offset as i64,
            ],
        )?;

        Ok(RawEvent {
            id: connection.last_insert_rowid(),
            stream,
            ingested_at_utc: ingested_at_utc.to_string(),
            file_offset,
            line: line.clone(),
        })
    }

    /// Newest-first chat messages of one stream that precede `before_event_id`.
    pub fn recent_chat_messages_with_prefix(
        &self,
        stream: LogStream,
        before_event_id: i64,
        prefix: &str,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "SELECT chat_message FROM raw_log_events
             WHERE stream = ?1 AND is_chat = 1 AND id < ?2
               AND substr(chat_message, 1, length(?3)) = ?3
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = statement.query_map(
            params![stream.as_str(), before_event_id, prefix, limit as i64],
            |row| row.get::<_, Option<String>>(0),
        )?;

        let mut messages = Vec::new();
        for row in rows {
            if let Some(message) = row? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    pub fn raw_events_for_stream(&self, stream: LogStream) -> StorageResult<Vec<RawEvent>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "SELECT id, ingested_at_utc, clock_time, thread_name, level, source,
                    is_chat, chat_message, body, raw_line, file_offset
             FROM raw_log_events
             WHERE stream = ?1
             ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![stream.as_str()], |row| {
            raw_event_from_row(row, stream)
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn latest_in_progress_attempt(&self, source: AttemptSource) -> StorageResult<Option<i64>> {
        let connection = self.lock()?;
        let attempt_id = connection
            .query_row(
                "SELECT id FROM attempts
                 WHERE status = 'in_progress' AND attempt_source = ?1
                 ORDER BY id DESC
                 LIMIT 1",
                params![source.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempt_id)
    }

    pub fn max_bed_index(&self, attempt_id: i64) -> StorageResult<Option<i64>> {
        let connection = self.lock()?;
        let max_index = connection.query_row(
            "SELECT MAX(bed_index) FROM attempt_beds WHERE attempt_id = ?1",
            params![attempt_id],
            |row| row.get(0),
        )?;
        Ok(max_index)
    }

    pub fn insert_chat_attempt(&self, start: &ChatAttemptStart) -> StorageResult<i64> {
        let connection = self.lock()?;
        connection.execute(
            "INSERT INTO attempts (
                started_event_id, started_at_utc, started_clock, status,
                first_bed_seconds, tower_name, tower_code, zero_type,
                attempt_source, created_at
            ) VALUES (?1, ?2, ?3, 'in_progress', ?4, ?5, ?6, ?7, ?8, ?2)",
            params![
                start.started_event_id,
                start.started_at_utc,
                start.started_clock,
                start.first_bed_seconds,
                start.tower_name,
                start.tower_code,
                start.zero_type,
                AttemptSource::Chat.as_str(),
            ],
        )?;
        Ok(connection.last_insert_rowid())
    }

    /// Appends one bed and folds it into the attempt's accumulators atomically.
    pub fn record_attempt_bed(&self, attempt_id: i64, bed: &NewAttemptBed) -> StorageResult<()> {
        let mut connection = self.lock()?;
        let transaction = connection.transaction()?;
        insert_bed(&transaction, attempt_id, bed)?;

        let is_major = bed.kind.is_major();
        transaction.execute(
            "UPDATE attempts
             SET total_damage = total_damage + ?1,
                 bed_count = bed_count + 1,
                 major_damage_total = major_damage_total + ?2,
                 major_hit_count = major_hit_count + ?3,
                 setup_damage_total = setup_damage_total + ?4,
                 setup_hit_count = setup_hit_count + ?5,
                 max_damage_single_bed = MAX(max_damage_single_bed, ?1)
             WHERE id = ?6",
            params![
                bed.damage,
                if is_major { bed.damage } else { 0 },
                i64::from(is_major),
                if is_major { 0 } else { bed.damage },
                i64::from(!is_major),
                attempt_id,
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    pub fn mark_attempt_success(
        &self,
        attempt_id: i64,
        ended_at_utc: &str,
        ended_clock: Option<&str>,
    ) -> StorageResult<()> {
        let connection = self.lock()?;
        connection.execute(
            "UPDATE attempts
             SET status = 'success', ended_at_utc = ?1, ended_clock = ?2
             WHERE id = ?3 AND status = 'in_progress'",
            params![ended_at_utc, ended_clock, attempt_id],
        )?;
        Ok(())
    }

    pub fn mark_attempt_fail(
        &self,
        attempt_id: i64,
        reason: &str,
        ended_at_utc: &str,
        ended_clock: Option<&str>,
    ) -> StorageResult<()> {
        let connection = self.lock()?;
        connection.execute(
            "UPDATE attempts
             SET status = 'fail', fail_reason = ?1, ended_at_utc = ?2, ended_clock = ?3
             WHERE id = ?4 AND status = 'in_progress'",
            params![reason, ended_at_utc, ended_clock, attempt_id],
        )?;
        Ok(())
    }

    pub fn update_attempt_fields(
        &self,
        attempt_id: i64,
        update: &AttemptFieldUpdate,
    ) -> StorageResult<()> {
        let connection = self.lock()?;
        match update {
            AttemptFieldUpdate::DistanceBlocks(blocks) => connection.execute(
                "UPDATE attempts SET distance_blocks = ?1 WHERE id = ?2",
                params![blocks, attempt_id],
            )?,
            AttemptFieldUpdate::Explosives { used, left } => connection.execute(
                "UPDATE attempts SET explosives_used = ?1, explosives_left = ?2 WHERE id = ?3",
                params![used, left, attempt_id],
            )?,
            AttemptFieldUpdate::SuccessTime(seconds) => connection.execute(
                "UPDATE attempts SET success_time_seconds = ?1 WHERE id = ?2",
                params![seconds, attempt_id],
            )?,
            AttemptFieldUpdate::Tower { name, code } => connection.execute(
                "UPDATE attempts SET tower_name = ?1, tower_code = ?2 WHERE id = ?3",
                params![name, code, attempt_id],
            )?,
            AttemptFieldUpdate::ZeroType(zero_type) => connection.execute(
                "UPDATE attempts SET zero_type = ?1 WHERE id = ?2",
                params![zero_type, attempt_id],
            )?,
            AttemptFieldUpdate::StandingHeight(height) => connection.execute(
                "UPDATE attempts SET standing_height = ?1 WHERE id = ?2",
                params![height, attempt_id],
            )?,
        };
        Ok(())
    }

    pub fn insert_attempt_event(
        &self,
        attempt_id: i64,
        event: &NewAttemptEvent,
    ) -> StorageResult<()> {
        let connection = self.lock()?;
        connection.execute(
            "INSERT INTO attempt_events (
                attempt_id, event_id, event_type, value_text, value_num, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attempt_id,
                event.event_id,
                event.event_type,
                event.value_text,
                event.value_num,
                event.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn telemetry_attempt_exists_for_world(&self, world_name: &str) -> StorageResult<bool> {
        let connection = self.lock()?;
        let existing: Option<i64> = connection
            .query_row(
                "SELECT id FROM attempts
                 WHERE attempt_source = ?1 AND world_name = ?2
                 LIMIT 1",
                params![AttemptSource::Telemetry.as_str(), world_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(existing.is_some())
    }

    /// Inserts a finished telemetry attempt and its beds in one transaction.
    ///
    /// Damage accumulators are derived from `beds` so they always agree with the
    /// stored bed rows.
    pub fn insert_telemetry_attempt(
        &self,
        attempt: &TelemetryAttempt,
        beds: &[NewAttemptBed],
    ) -> StorageResult<i64> {
        let total_damage: i64 = beds.iter().map(|bed| bed.damage).sum();
        let major_beds = beds.iter().filter(|bed| bed.kind.is_major());
        let major_damage_total: i64 = major_beds.clone().map(|bed| bed.damage).sum();
        let major_hit_count = major_beds.count() as i64;
        let setup_hit_count = beds.len() as i64 - major_hit_count;
        let setup_damage_total = total_damage - major_damage_total;
        let max_damage_single_bed = beds.iter().map(|bed| bed.damage).max().unwrap_or(0);

        let mut connection = self.lock()?;
        let transaction = connection.transaction()?;
        transaction.execute(
            "INSERT INTO attempts (
                started_event_id, started_at_utc, started_clock, ended_at_utc, ended_clock,
                status, fail_reason, success_time_seconds, tower_name, tower_code, zero_type,
                standing_height, explosives_used, explosives_left, total_damage, bed_count,
                beds_exploded, anchors_exploded, bow_shots, crossbow_shots,
                major_damage_total, major_hit_count, setup_damage_total, setup_hit_count,
                max_damage_single_bed, other_damage_total, attempt_source, o_level,
                flyaway_detected, flyaway_gt, flyaway_dragon_y, flyaway_node,
                flyaway_crystals_alive, world_name, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?3, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29,
                ?30, ?31, ?32, ?33, ?4
            )",
            params![
                attempt.started_event_id,
                attempt.started_at_utc,
                attempt.clock_time,
                attempt.ended_at_utc,
                attempt.status.as_str(),
                attempt.fail_reason,
                attempt.success_time_seconds,
                attempt.tower_name,
                attempt.tower_code,
                attempt.zero_type,
                attempt.standing_height,
                attempt.explosives_used,
                attempt.explosives_left,
                total_damage,
                beds.len() as i64,
                attempt.beds_exploded,
                attempt.anchors_exploded,
                attempt.bow_shots,
                attempt.crossbow_shots,
                major_damage_total,
                major_hit_count,
                setup_damage_total,
                setup_hit_count,
                max_damage_single_bed,
                attempt.other_damage_total,
                AttemptSource::Telemetry.as_str(),
                attempt.o_level,
                attempt.flyaway_detected,
                attempt.flyaway_gt,
                attempt.flyaway_dragon_y,
                attempt.flyaway_node,
                attempt.flyaway_crystals_alive,
                attempt.world_name,
            ],
        )?;
        let attempt_id = transaction.last_insert_rowid();

        for bed in beds {
            insert_bed(&transaction, attempt_id, bed)?;
        }

        transaction.commit()?;
        Ok(attempt_id)
    }

    /// Removes every attempt of one source together with its beds and events.
    pub fn delete_attempts_by_source(&self, source: AttemptSource) -> StorageResult<usize> {
        let mut connection = self.lock()?;
        let transaction = connection.transaction()?;
        transaction.execute(
            "DELETE FROM attempt_events WHERE attempt_id IN (
                SELECT id FROM attempts WHERE attempt_source = ?1
            )",
            params![source.as_str()],
        )?;
        transaction.execute(
            "DELETE FROM attempt_beds WHERE attempt_id IN (
                SELECT id FROM attempts WHERE attempt_source = ?1
            )",
            params![source.as_str()],
        )?;
        let deleted = transaction.execute(
            "DELETE FROM attempts WHERE attempt_source = ?1",
            params![source.as_str()],
        )?;

        let remaining: i64 =
            transaction.query_row("SELECT COUNT(*) FROM attempts", [], |row| row.get(0))?;
        if remaining == 0 {
            transaction.execute(
                "DELETE FROM sqlite_sequence
                 WHERE name IN ('attempts', 'attempt_beds', 'attempt_events')",
                [],
            )?;
        }
        transaction.commit()?;
        Ok(deleted)
    }

    /// Drops a stream's raw events and cursor keys. Attempts that point at
    /// those events must be deleted first.
    pub fn reset_stream(&self, stream: LogStream) -> StorageResult<usize> {
        let mut connection = self.lock()?;
        let transaction = connection.transaction()?;
        let deleted = transaction.execute(
            "DELETE FROM raw_log_events WHERE stream = ?1",
            params![stream.as_str()],
        )?;
        transaction.execute(
            "DELETE FROM ingest_state WHERE substr(key, 1, length(?1)) = ?1",
            params![stream.state_key("")],
        )?;
        transaction.commit()?;
        Ok(deleted)
    }

    pub fn attempts(&self) -> StorageResult<Vec<AttemptRow>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "SELECT id, started_event_id, started_at_utc, started_clock, ended_at_utc,
                    ended_clock, status, fail_reason, first_bed_seconds, success_time_seconds,
                    distance_blocks, tower_name, tower_code, zero_type, standing_height,
                    explosives_used, explosives_left, total_damage, bed_count,
                    major_damage_total, major_hit_count, setup_damage_total, setup_hit_count,
                    max_damage_single_bed, other_damage_total, attempt_source, world_name,
                    created_at
             FROM attempts
             ORDER BY id ASC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(AttemptRow {
                id: row.get(0)?,
                started_event_id: row.get(1)?,
                started_at_utc: row.get(2)?,
                started_clock: row.get(3)?,
                ended_at_utc: row.get(4)?,
                ended_clock: row.get(5)?,
                status: row.get(6)?,
                fail_reason: row.get(7)?,
                first_bed_seconds: row.get(8)?,
                success_time_seconds: row.get(9)?,
                distance_blocks: row.get(10)?,
                tower_name: row.get(11)?,
                tower_code: row.get(12)?,
                zero_type: row.get(13)?,
                standing_height: row.get(14)?,
                explosives_used: row.get(15)?,
                explosives_left: row.get(16)?,
                total_damage: row.get(17)?,
                bed_count: row.get(18)?,
                major_damage_total: row.get(19)?,
                major_hit_count: row.get(20)?,
                setup_damage_total: row.get(21)?,
                setup_hit_count: row.get(22)?,
                max_damage_single_bed: row.get(23)?,
                other_damage_total: row.get(24)?,
                attempt_source: row.get(25)?,
                world_name: row.get(26)?,
                created_at: row.get(27)?,
            })
        })?;

        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?);
        }
        Ok(attempts)
    }

    pub fn attempt_beds(&self, attempt_id: i64) -> StorageResult<Vec<AttemptBedRow>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "SELECT attempt_id, event_id, bed_index, damage, damage_kind, is_major, created_at
             FROM attempt_beds
             WHERE attempt_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![attempt_id], |row| {
            Ok(AttemptBedRow {
                attempt_id: row.get(0)?,
                event_id: row.get(1)?,
                bed_index: row.get(2)?,
                damage: row.get(3)?,
                damage_kind: row.get(4)?,
                is_major: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;

        let mut beds = Vec::new();
        for row in rows {
            beds.push(row?);
        }
        Ok(beds)
    }

    pub fn attempt_events(&self, attempt_id: i64) -> StorageResult<Vec<AttemptEventRow>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "SELECT attempt_id, event_id, event_type, value_text, value_num, created_at
             FROM attempt_events
             WHERE attempt_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![attempt_id], |row| {
            Ok(AttemptEventRow {
                attempt_id: row.get(0)?,
                event_id: row.get(1)?,
                event_type: row.get(2)?,
                value_text: row.get(3)?,
                value_num: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

fn insert_bed(
    connection: &Connection,
    attempt_id: i64,
    bed: &NewAttemptBed,
) -> StorageResult<()> {
    connection.execute(
        "INSERT INTO attempt_beds (
            attempt_id, event_id, bed_index, damage, damage_kind, is_major, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            attempt_id,
            bed.event_id,
            bed.bed_index,
            bed.damage,
            bed.kind.as_str(),
            bed.kind.is_major(),
            bed.created_at,
        ],
    )?;
    Ok(())
}

fn raw_event_from_row(row: &Row<'_>, stream: LogStream) -> rusqlite::Result<RawEvent> {
    let raw_line: String = row.get(9)?;
    let file_offset: i64 = row.get(10)?;
    Ok(RawEvent {
        id: row.get(0)?,
        stream,
        ingested_at_utc: row.get(1)?,
        file_offset: file_offset.max(0) as u64,
        line: LogLine {
            raw_line,
            clock_time: row.get(2)?,
            thread_name: row.get(3)?,
            level: row.get(4)?,
            source: row.get(5)?,
            is_chat: row.get(6)?,
            chat_message: row.get(7)?,
            body: row.get(8)?,
        },
    })
}
