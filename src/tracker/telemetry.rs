use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat};
use lazy_static::lazy_static;
use regex::Regex;

use super::world::{snapshot_file, wait_for_stable_size, world_for_ingest, StabilityWait};
use super::Tracker;
use crate::storage::{
    AttemptStatus, DamageKind, Database, LogStream, NewAttemptBed, RawEvent, StorageResult,
    TelemetryAttempt,
};
use crate::telemetry::classify::{dominant_node, rotation, zero_type_label};
use crate::telemetry::terrain::TerrainProbe;
use crate::telemetry::{decode_snapshot, RunMetrics, TelemetrySnapshot};

const CRYSTALS_PER_FIGHT: i64 = 10;

lazy_static! {
    static ref WORLD_CREATE: Regex =
        Regex::new(r#"^Creating "(?P<world>.+?)"(?: with seed "(?P<seed>[-\d]+)")?\.\.\.$"#)
            .expect("valid world create pattern");
    static ref WORLD_LOAD: Regex = Regex::new(r"^Attempting event world load at (?P<world>.+)$")
        .expect("valid world load pattern");
    static ref WORLD_SAVE_CHUNKS: Regex =
        Regex::new(r"Saving chunks for level 'ServerLevel\[(?P<world>.+?)\]'/")
            .expect("valid save chunks pattern");
    static ref STATE_IN_WORLD: Regex =
        Regex::new(r"^StateOutput State: inworld(?:,|$)").expect("valid inworld pattern");
}

fn transition_world_name(body: &str) -> Option<String> {
    WORLD_LOAD
        .captures(body)
        .or_else(|| WORLD_CREATE.captures(body))
        .and_then(|captures| captures.name("world"))
        .map(|world| world.as_str().to_string())
}

fn is_in_world_line(body: &str) -> bool {
    body.starts_with("Loaded StandardSettings on World Join") || STATE_IN_WORLD.is_match(body)
}

fn is_world_exit_line(body: &str) -> bool {
    body == "Stopping!" || body.starts_with("StateOutput State: waiting")
}

/// Maps a tower's bedrock ceiling to its community name.
pub fn tower_name_for_height(height: Option<i32>) -> String {
    let Some(height) = height.filter(|height| *height >= 0) else {
        return "Unknown".to_string();
    };
    let known = match height {
        76 => "Small Boy",
        79 => "Small Cage",
        82 => "Tall Cage",
        85 => "M-85",
        88 => "M-88",
        91 => "M-91",
        94 => "T-94",
        97 => "T-97",
        100 => "T-100",
        103 => "Tall Boy",
        other => return format!("T-{other}"),
    };
    known.to_string()
}

/// Terminal status and fail reason for a finished telemetry run.
pub fn telemetry_outcome(metrics: &RunMetrics) -> (AttemptStatus, Option<&'static str>) {
    let broke_crystal = metrics.flyaway_detected
        && metrics
            .flyaway_crystals_alive
            .is_some_and(|alive| (0..CRYSTALS_PER_FIGHT).contains(&alive));

    if metrics.dragon_died {
        (AttemptStatus::Success, None)
    } else if broke_crystal {
        (AttemptStatus::Fail, Some("broke_crystal"))
    } else if metrics.flyaway_detected {
        (AttemptStatus::Flyaway, Some("flyaway"))
    } else {
        (AttemptStatus::Fail, Some("dragon_not_killed"))
    }
}

fn seconds_before(timestamp: &str, seconds: f64) -> String {
    if seconds <= 0.0 {
        return timestamp.to_string();
    }
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(parsed) => (parsed - chrono::Duration::milliseconds((seconds * 1000.0) as i64))
            .to_rfc3339_opts(SecondsFormat::Secs, false),
        Err(_) => timestamp.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub saves_dir: PathBuf,
    pub window_ticks: i64,
    pub terrain_radius: i32,
    pub storage_wait: StabilityWait,
    pub uninitialized_retry: Duration,
    pub uninitialized_poll_interval: Duration,
    pub min_end_ticks: i64,
    pub major_damage_threshold: i64,
}

impl TelemetryConfig {
    pub fn new(saves_dir: PathBuf) -> Self {
        Self {
            saves_dir,
            window_ticks: 600,
            terrain_radius: 4,
            storage_wait: StabilityWait::default(),
            uninitialized_retry: Duration::from_secs(12),
            uninitialized_poll_interval: Duration::from_millis(400),
            min_end_ticks: 100,
            major_damage_threshold: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestOutcome {
    NoWorld,
    DuplicateWorld,
    AlreadyInserted,
    NoStorage,
    StorageNotReady,
    UninitializedSnapshot,
    MinEndTicksNotMet,
    Inserted,
}

impl IngestOutcome {
    fn as_str(self) -> &'static str {
        match self {
            IngestOutcome::NoWorld => "no_world",
            IngestOutcome::DuplicateWorld => "duplicate_world",
            IngestOutcome::AlreadyInserted => "already_inserted",
            IngestOutcome::NoStorage => "no_storage",
            IngestOutcome::StorageNotReady => "storage_not_ready",
            IngestOutcome::UninitializedSnapshot => "uninitialized_storage_snapshot",
            IngestOutcome::MinEndTicksNotMet => "min_end_ticks_not_met",
            IngestOutcome::Inserted => "inserted",
        }
    }
}

/// Rebuilds one attempt per practice world from its telemetry snapshot,
/// triggered by world-exit and world-transition lines of the client log.
pub struct TelemetryReconstructor {
    database: Arc<Database>,
    config: TelemetryConfig,
    terrain: Box<dyn TerrainProbe + Send>,
    active_world_name: String,
    loading_world_name: Option<String>,
    last_seen_exit_event_id: i64,
}

impl TelemetryReconstructor {
    pub fn new(
        database: Arc<Database>,
        config: TelemetryConfig,
        terrain: Box<dyn TerrainProbe + Send>,
    ) -> StorageResult<Self> {
        let active_world_name = database
            .get_state(&Self::state_key("active_world_name"))?
            .unwrap_or_default();

        Ok(Self {
            database,
            config,
            terrain,
            active_world_name,
            loading_world_name: None,
            last_seen_exit_event_id: 0,
        })
    }

    fn state_key(suffix: &str) -> String {
        LogStream::Telemetry.state_key(suffix)
    }

    pub fn active_world_name(&self) -> &str {
        &self.active_world_name
    }

    fn set_active_world(&mut self, world_name: String) -> StorageResult<()> {
        if world_name.is_empty() || world_name == self.active_world_name {
            return Ok(());
        }
        tracing::debug!(world_name = %world_name, "Active practice world changed");
        self.database
            .set_state(&Self::state_key("active_world_name"), &world_name)?;
        self.active_world_name = world_name;
        Ok(())
    }

    fn track_world_lines(&mut self, event: &RawEvent, body: &str) -> StorageResult<()> {
        if let Some(transition_world) = transition_world_name(body) {
            if !self.active_world_name.is_empty() && transition_world != self.active_world_name {
                self.ingest_latest_world(event)?;
            }
            self.loading_world_name = Some(transition_world);
            return Ok(());
        }

        if is_in_world_line(body) {
            if let Some(world_name) = self.loading_world_name.take() {
                self.set_active_world(world_name)?;
            }
            return Ok(());
        }

        if let Some(world) = WORLD_SAVE_CHUNKS
            .captures(body)
            .and_then(|captures| captures.name("world"))
        {
            self.set_active_world(world.as_str().trim().to_string())?;
        }
        Ok(())
    }

    fn record_ingest_outcome(
        &self,
        outcome: IngestOutcome,
        world_name: &str,
        detail: &str,
    ) -> StorageResult<()> {
        self.database
            .set_state(&Self::state_key("ingest.last_reason"), outcome.as_str())?;
        self.database
            .set_state(&Self::state_key("ingest.last_world"), world_name)?;
        self.database
            .set_state(&Self::state_key("ingest.last_detail"), detail)?;

        if outcome == IngestOutcome::Inserted {
            tracing::info!(world_name, "Telemetry attempt ingested");
        } else {
            tracing::info!(
                world_name,
                reason = outcome.as_str(),
                detail,
                "Telemetry ingest skipped"
            );
        }
        Ok(())
    }

    /// Re-reads the snapshot while it still looks like a fresh, unwritten world.
    fn read_initialized_snapshot(&self, storage_path: &Path) -> Option<TelemetrySnapshot> {
        let is_ready = |snapshot: &TelemetrySnapshot| {
            snapshot
                .metrics
                .as_ref()
                .is_some_and(|metrics| !metrics.looks_uninitialized())
        };

        let snapshot = decode_snapshot(storage_path);
        if is_ready(&snapshot) {
            return Some(snapshot);
        }

        let deadline = Instant::now() + self.config.uninitialized_retry;
        while Instant::now() < deadline {
            thread::sleep(self.config.uninitialized_poll_interval);
            let refreshed = decode_snapshot(storage_path);
            if is_ready(&refreshed) {
                return Some(refreshed);
            }
        }
        None
    }

    fn ingest_latest_world(&mut self, event: &RawEvent) -> StorageResult<()> {
        let Some(world_dir) = world_for_ingest(&self.config.saves_dir, &self.active_world_name)
        else {
            return self.record_ingest_outcome(IngestOutcome::NoWorld, "", "");
        };
        let world_name = world_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let last_ingested_key = Self::state_key("last_ingested_world");
        if self.database.get_state(&last_ingested_key)?.as_deref() == Some(world_name.as_str()) {
            return self.record_ingest_outcome(IngestOutcome::DuplicateWorld, &world_name, "");
        }
        if self.database.telemetry_attempt_exists_for_world(&world_name)? {
            self.database.set_state(&last_ingested_key, &world_name)?;
            return self.record_ingest_outcome(IngestOutcome::AlreadyInserted, &world_name, "");
        }

        let Some(storage_path) = snapshot_file(&world_dir) else {
            return self.record_ingest_outcome(IngestOutcome::NoStorage, &world_name, "");
        };
        if !wait_for_stable_size(&storage_path, &self.config.storage_wait) {
            tracing::warn!(path = %storage_path.display(), "Telemetry snapshot never settled");
            return self.record_ingest_outcome(
                IngestOutcome::StorageNotReady,
                &world_name,
                &storage_path.display().to_string(),
            );
        }

        let Some(snapshot) = self.read_initialized_snapshot(&storage_path) else {
            return self.record_ingest_outcome(
                IngestOutcome::UninitializedSnapshot,
                &world_name,
                "",
            );
        };
        let Some(metrics) = snapshot.metrics.as_ref() else {
            return self.record_ingest_outcome(
                IngestOutcome::UninitializedSnapshot,
                &world_name,
                "",
            );
        };

        let end_ticks = metrics.end_ticks();
        if end_ticks < self.config.min_end_ticks {
            return self.record_ingest_outcome(
                IngestOutcome::MinEndTicksNotMet,
                &world_name,
                &format!("end_ticks={end_ticks}, min={}", self.config.min_end_ticks),
            );
        }

        let (attempt, beds) =
            self.build_attempt(event, &world_dir, &world_name, &snapshot, metrics);
        let attempt_id = self.database.insert_telemetry_attempt(&attempt, &beds)?;
        tracing::debug!(
            attempt_id,
            status = attempt.status.as_str(),
            bed_count = beds.len(),
            "Stored telemetry attempt"
        );

        self.database.set_state(&last_ingested_key, &world_name)?;
        self.record_ingest_outcome(IngestOutcome::Inserted, &world_name, "")
    }

    fn build_attempt(
        &self,
        event: &RawEvent,
        world_dir: &Path,
        world_name: &str,
        snapshot: &TelemetrySnapshot,
        metrics: &RunMetrics,
    ) -> (TelemetryAttempt, Vec<NewAttemptBed>) {
        let node = dominant_node(&snapshot.samples, self.config.window_ticks);
        let direction = rotation(&snapshot.samples, self.config.window_ticks);
        let tower_height = node.and_then(|node| {
            let (x, z) = node.terrain_anchor();
            self.terrain
                .ceiling_near(world_dir, x, z, self.config.terrain_radius)
        });

        let (status, fail_reason) = telemetry_outcome(metrics);
        let duration_seconds = metrics.duration_seconds();
        let ended_at_utc = event.ingested_at_utc.clone();
        let started_at_utc = seconds_before(&ended_at_utc, duration_seconds);

        let beds: Vec<NewAttemptBed> = metrics
            .attributed_damage
            .iter()
            .filter(|entry| entry.source.is_explosive() && entry.event.hp_loss > 0)
            .enumerate()
            .map(|(bed_index, entry)| NewAttemptBed {
                event_id: event.id,
                bed_index: bed_index as i64,
                damage: entry.event.hp_loss,
                kind: DamageKind::classify(entry.event.hp_loss, self.config.major_damage_threshold),
                created_at: ended_at_utc.clone(),
            })
            .collect();

        let attempt = TelemetryAttempt {
            started_event_id: event.id,
            started_at_utc,
            ended_at_utc,
            clock_time: event.line.clock_time.clone(),
            status,
            fail_reason: fail_reason.map(str::to_string),
            success_time_seconds: (status == AttemptStatus::Success && duration_seconds > 0.0)
                .then_some(duration_seconds),
            tower_name: tower_name_for_height(tower_height),
            tower_code: tower_height.map(|height| height.to_string()),
            zero_type: zero_type_label(node, direction),
            standing_height: metrics.explosive_standing_y,
            explosives_used: (metrics.explosives_base_count > 0)
                .then_some(metrics.explosives_base_count),
            explosives_left: (metrics.explosives_plus_one_count > 0)
                .then_some(metrics.explosives_plus_one_count),
            beds_exploded: metrics.beds_exploded,
            anchors_exploded: metrics.anchors_exploded,
            bow_shots: metrics.bows_shot,
            crossbow_shots: metrics.crossbows_shot,
            other_damage_total: metrics.other_damage,
            o_level: metrics.o_level(),
            flyaway_detected: metrics.flyaway_detected,
            flyaway_gt: metrics.flyaway_gt,
            flyaway_dragon_y: metrics.flyaway_dragon_y,
            flyaway_node: metrics.flyaway_node.clone(),
            flyaway_crystals_alive: metrics.flyaway_crystals_alive,
            world_name: world_name.to_string(),
        };

        (attempt, beds)
    }
}

impl Tracker for TelemetryReconstructor {
    fn handle_event(&mut self, event: &RawEvent) -> StorageResult<()> {
        if event.line.is_chat {
            return Ok(());
        }
        let body = event.line.trimmed_body();
        if body.is_empty() {
            return Ok(());
        }

        self.track_world_lines(event, body)?;

        if event.id <= self.last_seen_exit_event_id || !is_world_exit_line(body) {
            return Ok(());
        }
        self.last_seen_exit_event_id = event.id;
        self.ingest_latest_world(event)
    }
}
