use serde::Serialize;

use crate::log_line::LogLine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Chat,
    Telemetry,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Chat => "chat",
            LogStream::Telemetry => "telemetry",
        }
    }

    pub(crate) fn state_key(self, suffix: &str) -> String {
        format!("{}.{suffix}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Success,
    Fail,
    Flyaway,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Success => "success",
            AttemptStatus::Fail => "fail",
            AttemptStatus::Flyaway => "flyaway",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(AttemptStatus::InProgress),
            "success" => Some(AttemptStatus::Success),
            "fail" => Some(AttemptStatus::Fail),
            "flyaway" => Some(AttemptStatus::Flyaway),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSource {
    Chat,
    Telemetry,
}

impl AttemptSource {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptSource::Chat => "chat",
            AttemptSource::Telemetry => "telemetry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageKind {
    Major,
    Setup,
}

impl DamageKind {
    pub fn classify(damage: i64, major_threshold: i64) -> Self {
        if damage >= major_threshold {
            DamageKind::Major
        } else {
            DamageKind::Setup
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DamageKind::Major => "major",
            DamageKind::Setup => "setup",
        }
    }

    pub fn is_major(self) -> bool {
        matches!(self, DamageKind::Major)
    }
}

/// Stored form of one tailed line. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub id: i64,
    pub stream: LogStream,
    pub ingested_at_utc: String,
    pub file_offset: u64,
    pub line: LogLine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatAttemptStart {
    pub started_event_id: i64,
    pub started_at_utc: String,
    pub started_clock: Option<String>,
    pub first_bed_seconds: f64,
    pub tower_name: Option<String>,
    pub tower_code: Option<String>,
    pub zero_type: Option<String>,
}

/// In-place field changes driven by recap/summary chat lines.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFieldUpdate {
    DistanceBlocks(f64),
    Explosives { used: i64, left: Option<i64> },
    SuccessTime(f64),
    Tower { name: String, code: Option<String> },
    ZeroType(String),
    StandingHeight(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAttemptBed {
    pub event_id: i64,
    pub bed_index: i64,
    pub damage: i64,
    pub kind: DamageKind,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAttemptEvent {
    pub event_id: i64,
    pub event_type: String,
    pub value_text: Option<String>,
    pub value_num: Option<f64>,
    pub created_at: String,
}

/// Fully reconstructed attempt from one telemetry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryAttempt {
    pub started_event_id: i64,
    pub started_at_utc: String,
    pub ended_at_utc: String,
    pub clock_time: Option<String>,
    pub status: AttemptStatus,
    pub fail_reason: Option<String>,
    pub success_time_seconds: Option<f64>,
    pub tower_name: String,
    pub tower_code: Option<String>,
    pub zero_type: String,
    pub standing_height: Option<i64>,
    pub explosives_used: Option<i64>,
    pub explosives_left: Option<i64>,
    pub beds_exploded: i64,
    pub anchors_exploded: i64,
    pub bow_shots: i64,
    pub crossbow_shots: i64,
    pub other_damage_total: i64,
    pub o_level: Option<i64>,
    pub flyaway_detected: bool,
    pub flyaway_gt: i64,
    pub flyaway_dragon_y: Option<i64>,
    pub flyaway_node: Option<String>,
    pub flyaway_crystals_alive: Option<i64>,
    pub world_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRow {
    pub id: i64,
    pub started_event_id: Option<i64>,
    pub started_at_utc: String,
    pub started_clock: Option<String>,
    pub ended_at_utc: Option<String>,
    pub ended_clock: Option<String>,
    pub status: String,
    pub fail_reason: Option<String>,
    pub first_bed_seconds: Option<f64>,
    pub success_time_seconds: Option<f64>,
    pub distance_blocks: Option<f64>,
    pub tower_name: Option<String>,
    pub tower_code: Option<String>,
    pub zero_type: Option<String>,
    pub standing_height: Option<i64>,
    pub explosives_used: Option<i64>,
    pub explosives_left: Option<i64>,
    pub total_damage: i64,
    pub bed_count: i64,
    pub major_damage_total: i64,
    pub major_hit_count: i64,
    pub setup_damage_total: i64,
    pub setup_hit_count: i64,
    pub max_damage_single_bed: i64,
    pub other_damage_total: i64,
    pub attempt_source: String,
    pub world_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptBedRow {
    pub attempt_id: i64,
    pub event_id: i64,
    pub bed_index: i64,
    pub damage: i64,
    pub damage_kind: String,
    pub is_major: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptEventRow {
    pub attempt_id: i64,
    pub event_id: i64,
    pub event_type: String,
    pub value_text: Option<String>,
    pub value_num: Option<f64>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::AttemptStatus;

    #[test]
    fn parses_stored_status_text() {
        for status in [
            AttemptStatus::InProgress,
            AttemptStatus::Success,
            AttemptStatus::Fail,
            AttemptStatus::Flyaway,
        ] {
            assert_eq!(AttemptStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AttemptStatus::parse("aborted"), None);
    }
}
