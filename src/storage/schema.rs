pub(crate) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS raw_log_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stream TEXT NOT NULL,
    ingested_at_utc TEXT NOT NULL,
    clock_time TEXT,
    thread_name TEXT,
    level TEXT,
    source TEXT,
    is_chat INTEGER NOT NULL,
    chat_message TEXT,
    body TEXT NOT NULL,
    raw_line TEXT NOT NULL,
    file_offset INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_stream_chat
    ON raw_log_events (stream, is_chat, id);

CREATE TABLE IF NOT EXISTS attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_event_id INTEGER,
    started_at_utc TEXT NOT NULL,
    started_clock TEXT,
    ended_at_utc TEXT,
    ended_clock TEXT,
    status TEXT NOT NULL DEFAULT 'in_progress',
    fail_reason TEXT,
    first_bed_seconds REAL,
    success_time_seconds REAL,
    distance_blocks REAL,
    tower_name TEXT,
    tower_code TEXT,
    zero_type TEXT,
    standing_height INTEGER,
    explosives_used INTEGER,
    explosives_left INTEGER,
    total_damage INTEGER NOT NULL DEFAULT 0,
    bed_count INTEGER NOT NULL DEFAULT 0,
    beds_exploded INTEGER NOT NULL DEFAULT 0,
    anchors_exploded INTEGER NOT NULL DEFAULT 0,
    bow_shots INTEGER NOT NULL DEFAULT 0,
    crossbow_shots INTEGER NOT NULL DEFAULT 0,
    major_damage_total INTEGER NOT NULL DEFAULT 0,
    major_hit_count INTEGER NOT NULL DEFAULT 0,
    setup_damage_total INTEGER NOT NULL DEFAULT 0,
    setup_hit_count INTEGER NOT NULL DEFAULT 0,
    max_damage_single_bed INTEGER NOT NULL DEFAULT 0,
    other_damage_total INTEGER NOT NULL DEFAULT 0,
    attempt_source TEXT NOT NULL,
    o_level INTEGER,
    flyaway_detected INTEGER NOT NULL DEFAULT 0,
    flyaway_gt INTEGER NOT NULL DEFAULT 0,
    flyaway_dragon_y INTEGER,
    flyaway_node TEXT,
    flyaway_crystals_alive INTEGER,
    world_name TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY(started_event_id) REFERENCES raw_log_events(id)
);

CREATE INDEX IF NOT EXISTS idx_attempts_status_id
    ON attempts (status, id);
CREATE INDEX IF NOT EXISTS idx_attempts_source_started
    ON attempts (attempt_source, started_at_utc);
CREATE INDEX IF NOT EXISTS idx_attempts_source_world
    ON attempts (attempt_source, world_name);

CREATE TABLE IF NOT EXISTS attempt_beds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    attempt_id INTEGER NOT NULL,
    event_id INTEGER NOT NULL,
    bed_index INTEGER NOT NULL,
    damage INTEGER NOT NULL,
    damage_kind TEXT NOT NULL,
    is_major INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY(attempt_id) REFERENCES attempts(id) ON DELETE CASCADE,
    FOREIGN KEY(event_id) REFERENCES raw_log_events(id)
);

CREATE INDEX IF NOT EXISTS idx_attempt_beds_attempt
    ON attempt_beds (attempt_id, bed_index);

CREATE TABLE IF NOT EXISTS attempt_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    attempt_id INTEGER NOT NULL,
    event_id INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    value_text TEXT,
    value_num REAL,
    created_at TEXT NOT NULL,
    FOREIGN KEY(attempt_id) REFERENCES attempts(id) ON DELETE CASCADE,
    FOREIGN KEY(event_id) REFERENCES raw_log_events(id)
);

CREATE INDEX IF NOT EXISTS idx_attempt_events_attempt
    ON attempt_events (attempt_id);

CREATE TABLE IF NOT EXISTS ingest_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
