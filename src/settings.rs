use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tracker::world::StabilityWait;
use crate::tracker::{ChatTrackerConfig, TelemetryConfig};

const DEFAULT_DATABASE_PATH: &str = "data/zero_cycles.db";
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Durations are written as seconds in the settings file.
mod seconds {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = f64::deserialize(deserializer)?;
        super::duration_from_seconds(value).map_err(D::Error::custom)
    }
}

/// Poll intervals below the floor are raised to it.
mod poll_seconds {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub use super::seconds::serialize;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = f64::deserialize(deserializer)?;
        super::poll_interval_from_seconds(value).map_err(D::Error::custom)
    }
}

fn duration_from_seconds(value: f64) -> Result<Duration, String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("expected a non-negative number of seconds, got {value}"));
    }
    Ok(Duration::from_secs_f64(value))
}

fn poll_interval_from_seconds(value: f64) -> Result<Duration, String> {
    duration_from_seconds(value).map(|interval| interval.max(MIN_POLL_INTERVAL))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub pending_context_ttl_events: i64,
    pub context_scan_limit: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        let defaults = ChatTrackerConfig::default();
        Self {
            pending_context_ttl_events: defaults.pending_context_ttl_events,
            context_scan_limit: defaults.context_scan_limit,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub window_ticks: i64,
    pub terrain_radius: i32,
    #[serde(with = "seconds")]
    pub storage_wait_timeout: Duration,
    #[serde(with = "seconds")]
    pub storage_stable_for: Duration,
    #[serde(with = "poll_seconds")]
    pub storage_poll_interval: Duration,
    #[serde(with = "seconds")]
    pub uninitialized_retry: Duration,
    pub min_end_ticks: i64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        let defaults = TelemetryConfig::new(PathBuf::new());
        Self {
            window_ticks: defaults.window_ticks,
            terrain_radius: defaults.terrain_radius,
            storage_wait_timeout: defaults.storage_wait.timeout,
            storage_stable_for: defaults.storage_wait.stable_for,
            storage_poll_interval: defaults.storage_wait.poll_interval,
            uninitialized_retry: defaults.uninitialized_retry,
            min_end_ticks: defaults.min_end_ticks,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub chat_log_path: Option<PathBuf>,
    pub telemetry_log_path: Option<PathBuf>,
    pub saves_dir: Option<PathBuf>,
    #[serde(with = "poll_seconds")]
    pub poll_interval: Duration,
    pub major_damage_threshold: i64,
    pub require_fresh_context: bool,
    pub chat: ChatSettings,
    pub telemetry: TelemetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            chat_log_path: None,
            telemetry_log_path: None,
            saves_dir: None,
            poll_interval: Duration::from_millis(400),
            major_damage_threshold: 15,
            require_fresh_context: true,
            chat: ChatSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{key}: expected a boolean, got '{other}'")),
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl Settings {
    /// Reads the optional JSON file, then applies `ZERO_DASH_*` variables.
    pub fn load(config_path: Option<&Path>) -> Result<Self, String> {
        let mut settings = match config_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|error| {
                    format!("Failed to read settings '{}': {error}", path.display())
                })?;
                serde_json::from_str(&contents).map_err(|error| {
                    format!("Invalid settings file '{}': {error}", path.display())
                })?
            }
            None => Settings::default(),
        };

        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ZERO_DASH_DB_PATH").as_deref().and_then(non_empty_path) {
            self.database_path = value;
        }
        if let Some(value) = lookup("ZERO_DASH_LOG_PATH") {
            self.chat_log_path = non_empty_path(&value);
        }
        if let Some(value) = lookup("ZERO_DASH_TELEMETRY_LOG_PATH") {
            self.telemetry_log_path = non_empty_path(&value);
        }
        if let Some(value) = lookup("ZERO_DASH_SAVES_DIR") {
            self.saves_dir = non_empty_path(&value);
        }
        if let Some(value) = lookup("ZERO_DASH_POLL_SECONDS") {
            let seconds = value
                .trim()
                .parse::<f64>()
                .map_err(|error| format!("ZERO_DASH_POLL_SECONDS: {error}"))?;
            self.poll_interval = poll_interval_from_seconds(seconds)
                .map_err(|error| format!("ZERO_DASH_POLL_SECONDS: {error}"))?;
        }
        if let Some(value) = lookup("ZERO_DASH_MAJOR_DAMAGE_THRESHOLD") {
            self.major_damage_threshold = value
                .trim()
                .parse()
                .map_err(|error| format!("ZERO_DASH_MAJOR_DAMAGE_THRESHOLD: {error}"))?;
        }
        if let Some(value) = lookup("ZERO_DASH_REQUIRE_CONTEXT") {
            self.require_fresh_context = parse_flag("ZERO_DASH_REQUIRE_CONTEXT", &value)?;
        }
        Ok(())
    }

    /// Explicit saves directory, else `saves/` next to the telemetry log's folder.
    pub fn resolved_saves_dir(&self) -> Option<PathBuf> {
        if let Some(saves_dir) = &self.saves_dir {
            return Some(saves_dir.clone());
        }
        self.telemetry_log_path
            .as_deref()
            .and_then(Path::parent)
            .and_then(Path::parent)
            .map(|game_dir| game_dir.join("saves"))
    }

    pub fn chat_tracker_config(&self) -> ChatTrackerConfig {
        ChatTrackerConfig {
            major_damage_threshold: self.major_damage_threshold,
            require_fresh_context: self.require_fresh_context,
            pending_context_ttl_events: self.chat.pending_context_ttl_events,
            context_scan_limit: self.chat.context_scan_limit,
        }
    }

    pub fn telemetry_config(&self, saves_dir: PathBuf) -> TelemetryConfig {
        TelemetryConfig {
            window_ticks: self.telemetry.window_ticks,
            terrain_radius: self.telemetry.terrain_radius,
            storage_wait: StabilityWait {
                timeout: self.telemetry.storage_wait_timeout,
                stable_for: self.telemetry.storage_stable_for,
                poll_interval: self.telemetry.storage_poll_interval,
            },
            uninitialized_retry: self.telemetry.uninitialized_retry,
            min_end_ticks: self.telemetry.min_end_ticks,
            major_damage_threshold: self.major_damage_threshold,
            ..TelemetryConfig::new(saves_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::Settings;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let directory = tempfile::tempdir().expect("Expected temp dir");
        let path = directory.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"chatLogPath": "logs/latest.log", "pollInterval": 1.5, "telemetry": {"minEndTicks": 40}}"#,
        )
        .expect("Expected settings write");

        let mut settings: Settings = serde_json::from_str(
            &std::fs::read_to_string(&path).expect("Expected settings read"),
        )
        .expect("Expected settings to parse");
        settings
            .apply_overrides(lookup(&[]))
            .expect("Expected no overrides");

        assert_eq!(settings.chat_log_path, Some(PathBuf::from("logs/latest.log")));
        assert_eq!(settings.poll_interval, Duration::from_millis(1_500));
        assert_eq!(settings.telemetry.min_end_ticks, 40);
        assert_eq!(settings.telemetry.window_ticks, 600);
        assert_eq!(settings.chat.pending_context_ttl_events, 300);
        assert_eq!(settings.database_path, PathBuf::from("data/zero_cycles.db"));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(lookup(&[
                ("ZERO_DASH_DB_PATH", "/tmp/zero.db"),
                ("ZERO_DASH_POLL_SECONDS", "0.25"),
                ("ZERO_DASH_MAJOR_DAMAGE_THRESHOLD", "20"),
                ("ZERO_DASH_REQUIRE_CONTEXT", "off"),
                ("ZERO_DASH_TELEMETRY_LOG_PATH", "/games/mc/logs/latest.log"),
            ]))
            .expect("Expected overrides to apply");

        assert_eq!(settings.database_path, PathBuf::from("/tmp/zero.db"));
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert!(!settings.require_fresh_context);
        assert_eq!(settings.chat_tracker_config().major_damage_threshold, 20);
        assert_eq!(
            settings.resolved_saves_dir(),
            Some(PathBuf::from("/games/mc/saves"))
        );
        assert_eq!(
            settings
                .telemetry_config(PathBuf::from("/games/mc/saves"))
                .major_damage_threshold,
            20
        );
    }

    #[test]
    fn raises_zero_poll_intervals_to_floor() {
        let settings: Settings = serde_json::from_str(
            r#"{"pollInterval": 0, "telemetry": {"storagePollInterval": 0.001}}"#,
        )
        .expect("Expected settings to parse");
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
        assert_eq!(settings.telemetry.storage_poll_interval, Duration::from_millis(50));

        let mut settings = Settings::default();
        settings
            .apply_overrides(lookup(&[("ZERO_DASH_POLL_SECONDS", "0")]))
            .expect("Expected overrides to apply");
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut settings = Settings::default();
        assert!(settings
            .apply_overrides(lookup(&[("ZERO_DASH_REQUIRE_CONTEXT", "maybe")]))
            .is_err());
        assert!(settings
            .apply_overrides(lookup(&[("ZERO_DASH_POLL_SECONDS", "-1")]))
            .is_err());
        assert!(serde_json::from_str::<Settings>(r#"{"pollInterval": -2}"#).is_err());
        assert!(Settings::load(Some(std::path::Path::new("/nonexistent/zero.json"))).is_err());
    }
}
