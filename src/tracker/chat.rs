use std::sync::Arc;

use super::rules::{
    classify_chat_message, is_left_practice_line, split_tower_text, ChatSignal,
    CONTEXT_MESSAGE_PREFIX,
};
use super::Tracker;
use crate::storage::{
    AttemptFieldUpdate, AttemptSource, AttemptStatus, ChatAttemptStart, DamageKind, Database,
    LogStream, NewAttemptBed, NewAttemptEvent, RawEvent, StorageResult,
};

const FAIL_NEW_ATTEMPT_STARTED: &str = "new_attempt_started";
const FAIL_LEFT_PRACTICE_MAP: &str = "left_practice_map";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTrackerConfig {
    pub major_damage_threshold: i64,
    pub require_fresh_context: bool,
    pub pending_context_ttl_events: i64,
    pub context_scan_limit: usize,
}

impl Default for ChatTrackerConfig {
    fn default() -> Self {
        Self {
            major_damage_threshold: 15,
            require_fresh_context: true,
            pending_context_ttl_events: 300,
            context_scan_limit: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenAttempt {
    id: i64,
    status: AttemptStatus,
    next_bed_index: i64,
}

/// Tower/type announced ahead of the next attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PendingContext {
    tower_name: Option<String>,
    tower_code: Option<String>,
    zero_type: Option<String>,
    anchor_event_id: Option<i64>,
}

impl PendingContext {
    fn is_complete(&self) -> bool {
        self.tower_name.is_some() && self.zero_type.is_some()
    }

    fn is_fresh_at(&self, event_id: i64, ttl_events: i64) -> bool {
        if !self.is_complete() {
            return false;
        }
        self.anchor_event_id
            .is_some_and(|anchor| event_id - anchor <= ttl_events)
    }

    fn set_tower(&mut self, name: String, code: Option<String>) {
        self.tower_name = Some(name);
        self.tower_code = code;
    }
}

/// Attempt state machine driven by the client's chat output.
pub struct ChatTracker {
    database: Arc<Database>,
    config: ChatTrackerConfig,
    current: Option<OpenAttempt>,
    pending: PendingContext,
}

impl ChatTracker {
    /// Creates the tracker and adopts the newest chat attempt still in progress.
    pub fn new(database: Arc<Database>, config: ChatTrackerConfig) -> StorageResult<Self> {
        let mut tracker = Self {
            database,
            config,
            current: None,
            pending: PendingContext::default(),
        };
        tracker.adopt_in_progress_attempt()?;
        Ok(tracker)
    }

    fn adopt_in_progress_attempt(&mut self) -> StorageResult<()> {
        let Some(attempt_id) = self
            .database
            .latest_in_progress_attempt(AttemptSource::Chat)?
        else {
            return Ok(());
        };

        let next_bed_index = self
            .database
            .max_bed_index(attempt_id)?
            .map_or(0, |max_index| max_index + 1);
        tracing::info!(attempt_id, next_bed_index, "Resuming in-progress attempt");
        self.current = Some(OpenAttempt {
            id: attempt_id,
            status: AttemptStatus::InProgress,
            next_bed_index,
        });
        Ok(())
    }

    pub fn current_attempt_id(&self) -> Option<i64> {
        self.current.map(|attempt| attempt.id)
    }

    fn handle_chat_message(&mut self, event: &RawEvent, message: &str) -> StorageResult<()> {
        let message = message.trim();
        let signal = classify_chat_message(message);

        if let Some(signal) = signal.as_ref().filter(|signal| signal.applies_while_idle()) {
            return self.apply_context_or_start(event, signal.clone());
        }

        let Some(current) = self.current else {
            return Ok(());
        };

        if message.is_empty() && current.status.is_terminal() {
            self.current = None;
            return Ok(());
        }

        let Some(signal) = signal else {
            return Ok(());
        };

        match signal {
            ChatSignal::Damage(damage) => self.record_damage(event, damage),
            ChatSignal::DistanceBlocks(blocks) => {
                self.update_fields(AttemptFieldUpdate::DistanceBlocks(blocks))?;
                self.annotate(event, "distance_blocks", None, Some(blocks))
            }
            ChatSignal::DragonKilled => {
                self.mark_success(event)?;
                self.annotate(event, "dragon_killed", None, None)
            }
            ChatSignal::CrystalDestroyed => self.annotate(event, "crystal_destroyed", None, None),
            ChatSignal::Explosives { used, left } => {
                self.update_fields(AttemptFieldUpdate::Explosives { used, left })?;
                self.annotate(event, "explosives", Some(message.to_string()), None)
            }
            ChatSignal::RunTime(seconds) => {
                self.update_fields(AttemptFieldUpdate::SuccessTime(seconds))?;
                self.annotate(event, "run_time", None, Some(seconds))
            }
            ChatSignal::RecapTower { name, code } => {
                self.update_fields(AttemptFieldUpdate::Tower { name, code })?;
                self.annotate(event, "tower", Some(message.to_string()), None)
            }
            ChatSignal::RecapZeroType(zero_type) => {
                self.update_fields(AttemptFieldUpdate::ZeroType(zero_type.clone()))?;
                self.annotate(event, "zero_type", Some(zero_type), None)
            }
            ChatSignal::StandingHeight(height) => {
                self.update_fields(AttemptFieldUpdate::StandingHeight(height))?;
                self.annotate(event, "standing_height", None, Some(height as f64))
            }
            ChatSignal::ContextTower { .. }
            | ChatSignal::ContextZeroType(_)
            | ChatSignal::FirstBedPlaced { .. } => Ok(()),
        }
    }

    fn apply_context_or_start(&mut self, event: &RawEvent, signal: ChatSignal) -> StorageResult<()> {
        match signal {
            ChatSignal::ContextTower { name, code } => {
                self.finalize_open_attempt(event, FAIL_NEW_ATTEMPT_STARTED)?;
                self.pending.set_tower(name, code);
                self.pending.anchor_event_id = Some(event.id);
                Ok(())
            }
            ChatSignal::ContextZeroType(zero_type) => {
                self.finalize_open_attempt(event, FAIL_NEW_ATTEMPT_STARTED)?;
                self.pending.zero_type = Some(zero_type);
                self.pending.anchor_event_id = Some(event.id);
                Ok(())
            }
            ChatSignal::FirstBedPlaced { seconds } => self.start_attempt(event, seconds),
            _ => Ok(()),
        }
    }

    fn start_attempt(&mut self, event: &RawEvent, first_bed_seconds: f64) -> StorageResult<()> {
        self.recover_context_from_history(event.id)?;
        if self.config.require_fresh_context
            && !self
                .pending
                .is_fresh_at(event.id, self.config.pending_context_ttl_events)
        {
            tracing::debug!(
                event_id = event.id,
                "Ignoring first bed without fresh tower/type context"
            );
            return Ok(());
        }

        self.finalize_open_attempt(event, FAIL_NEW_ATTEMPT_STARTED)?;

        let context = std::mem::take(&mut self.pending);
        let attempt_id = self.database.insert_chat_attempt(&ChatAttemptStart {
            started_event_id: event.id,
            started_at_utc: event.ingested_at_utc.clone(),
            started_clock: event.line.clock_time.clone(),
            first_bed_seconds,
            tower_name: context.tower_name.clone(),
            tower_code: context.tower_code.clone(),
            zero_type: context.zero_type.clone(),
        })?;
        tracing::info!(
            attempt_id,
            first_bed_seconds,
            tower = context.tower_name.as_deref().unwrap_or("-"),
            zero_type = context.zero_type.as_deref().unwrap_or("-"),
            "Attempt started"
        );

        self.current = Some(OpenAttempt {
            id: attempt_id,
            status: AttemptStatus::InProgress,
            next_bed_index: 0,
        });
        self.annotate(event, "first_bed_placed", None, Some(first_bed_seconds))
    }

    /// Refills empty context slots from recent `[ZDASH]` chat rows, newest first.
    fn recover_context_from_history(&mut self, event_id: i64) -> StorageResult<()> {
        if self.pending.is_complete() {
            return Ok(());
        }

        let messages = self.database.recent_chat_messages_with_prefix(
            LogStream::Chat,
            event_id,
            CONTEXT_MESSAGE_PREFIX,
            self.config.context_scan_limit,
        )?;

        for message in messages {
            match classify_chat_message(&message) {
                Some(ChatSignal::ContextTower { name, code })
                    if self.pending.tower_name.is_none() =>
                {
                    self.pending.set_tower(name, code);
                }
                Some(ChatSignal::ContextZeroType(zero_type))
                    if self.pending.zero_type.is_none() =>
                {
                    self.pending.zero_type = Some(zero_type);
                }
                _ => {}
            }

            if self.pending.is_complete() {
                self.pending.anchor_event_id = Some(event_id);
                tracing::debug!(event_id, "Recovered attempt context from chat history");
                break;
            }
        }

        Ok(())
    }

    fn record_damage(&mut self, event: &RawEvent, damage: i64) -> StorageResult<()> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };

        let kind = DamageKind::classify(damage, self.config.major_damage_threshold);
        self.database.record_attempt_bed(
            current.id,
            &NewAttemptBed {
                event_id: event.id,
                bed_index: current.next_bed_index,
                damage,
                kind,
                created_at: event.ingested_at_utc.clone(),
            },
        )?;
        current.next_bed_index += 1;

        let event_type = format!("damage_{}", kind.as_str());
        self.annotate(event, &event_type, None, Some(damage as f64))
    }

    fn mark_success(&mut self, event: &RawEvent) -> StorageResult<()> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };

        self.database.mark_attempt_success(
            current.id,
            &event.ingested_at_utc,
            event.line.clock_time.as_deref(),
        )?;
        current.status = AttemptStatus::Success;
        tracing::info!(attempt_id = current.id, "Attempt succeeded");
        self.annotate(event, "status_success", None, None)
    }

    /// Fails an in-progress attempt with `reason`; a finished one is only released.
    fn finalize_open_attempt(&mut self, event: &RawEvent, reason: &str) -> StorageResult<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        if current.status.is_terminal() {
            return Ok(());
        }

        self.database.mark_attempt_fail(
            current.id,
            reason,
            &event.ingested_at_utc,
            event.line.clock_time.as_deref(),
        )?;
        tracing::info!(attempt_id = current.id, fail_reason = reason, "Attempt failed");
        Ok(())
    }

    fn update_fields(&self, update: AttemptFieldUpdate) -> StorageResult<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        self.database.update_attempt_fields(current.id, &update)
    }

    fn annotate(
        &self,
        event: &RawEvent,
        event_type: &str,
        value_text: Option<String>,
        value_num: Option<f64>,
    ) -> StorageResult<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        self.database.insert_attempt_event(
            current.id,
            &NewAttemptEvent {
                event_id: event.id,
                event_type: event_type.to_string(),
                value_text,
                value_num,
                created_at: event.ingested_at_utc.clone(),
            },
        )
    }

    fn handle_log_line(&mut self, event: &RawEvent) -> StorageResult<()> {
        if !is_left_practice_line(&event.line.body) {
            return Ok(());
        }

        self.pending = PendingContext::default();
        self.finalize_open_attempt(event, FAIL_LEFT_PRACTICE_MAP)
    }
}

impl Tracker for ChatTracker {
    fn handle_event(&mut self, event: &RawEvent) -> StorageResult<()> {
        match event.line.chat_message.as_deref() {
            Some(message) if event.line.is_chat => self.handle_chat_message(event, message),
            _ => self.handle_log_line(event),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::test_support::{chat_line, feed_lines, system_line};
    use super::{ChatTracker, ChatTrackerConfig};
    use crate::storage::{Database, LogStream};

    fn setup() -> (Arc<Database>, ChatTracker) {
        let database = Arc::new(Database::open_in_memory().expect("Expected in-memory database"));
        let tracker = ChatTracker::new(Arc::clone(&database), ChatTrackerConfig::default())
            .expect("Expected tracker to start");
        (database, tracker)
    }

    fn chat(messages: &[&str]) -> Vec<String> {
        messages.iter().map(|message| chat_line(message)).collect()
    }

    #[test]
    fn records_successful_attempt_with_context() {
        let (database, mut tracker) = setup();

        feed_lines(
            &mut tracker,
            &database,
            LogStream::Chat,
            &chat(&[
                "[ZDASH] Tower: Tall Boy (103)",
                "[ZDASH] Type: Front Diagonal CW",
                "17.25s 1st Bed Placed",
                "Damage: 42",
                "Dragon Killed!",
            ]),
        );

        let attempts = database.attempts().expect("Expected attempts query");
        assert_eq!(attempts.len(), 1);
        let attempt = &attempts[0];
        assert_eq!(attempt.tower_name.as_deref(), Some("Tall Boy"));
        assert_eq!(attempt.tower_code.as_deref(), Some("103"));
        assert_eq!(attempt.zero_type.as_deref(), Some("Front Diagonal CW"));
        assert_eq!(attempt.status, "success");
        assert_eq!(attempt.first_bed_seconds, Some(17.25));
        assert_eq!(attempt.bed_count, 1);
        assert_eq!(attempt.total_damage, 42);
        assert_eq!(attempt.major_hit_count, 1);
        assert_eq!(attempt.attempt_source, "chat");

        let event_types: Vec<String> = database
            .attempt_events(attempt.id)
            .expect("Expected events query")
            .into_iter()
            .map(|event| event.event_type)
            .collect();
        assert_eq!(
            event_types,
            vec![
                "first_bed_placed",
                "damage_major",
                "status_success",
                "dragon_killed"
            ]
        );
    }

    #[test]
    fn new_context_mid_attempt_fails_previous_attempt() {
        let (database, mut tracker) = setup();

        feed_lines(
            &mut tracker,
            &database,
            LogStream::Chat,
            &chat(&[
                "[ZDASH] Tower: Tall Boy (103)",
                "[ZDASH] Type: Front Diagonal CW",
                "17.25s 1st Bed Placed",
                "Damage: 6",
                "[ZDASH] Tower: Small Boy (76)",
                "[ZDASH] Type: Back Straight CCW",
                "15.00s 1st Bed Placed",
            ]),
        );

        let attempts = database.attempts().expect("Expected attempts query");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, "fail");
        assert_eq!(attempts[0].fail_reason.as_deref(), Some("new_attempt_started"));
        assert_eq!(attempts[0].setup_hit_count, 1);
        assert_eq!(attempts[1].status, "in_progress");
        assert_eq!(attempts[1].tower_name.as_deref(), Some("Small Boy"));
        assert_eq!(tracker.current_attempt_id(), Some(attempts[1].id));
    }

    #[test]
    fn honors_pending_context_ttl() {
        let (database, mut tracker) = setup();
        let mut lines = chat(&["[ZDASH] Tower: M-88 (88)", "[ZDASH] Type: Front Straight CW"]);
        lines.extend((0..100).map(|index| system_line(&format!("Chunk update {index}"))));
        lines.push(chat_line("20.10s 1st Bed Placed"));
        feed_lines(&mut tracker, &database, LogStream::Chat, &lines);
        assert_eq!(database.attempts().unwrap().len(), 1);

        let (database, mut tracker) = setup();
        let mut lines = chat(&["[ZDASH] Tower: M-88 (88)", "[ZDASH] Type: Front Straight CW"]);
        lines.extend((0..300).map(|index| system_line(&format!("Chunk update {index}"))));
        lines.push(chat_line("20.10s 1st Bed Placed"));
        feed_lines(&mut tracker, &database, LogStream::Chat, &lines);
        assert!(database.attempts().unwrap().is_empty());
    }

    #[test]
    fn starts_without_context_when_not_required() {
        let database = Arc::new(Database::open_in_memory().expect("Expected in-memory database"));
        let mut tracker = ChatTracker::new(
            Arc::clone(&database),
            ChatTrackerConfig {
                require_fresh_context: false,
                ..ChatTrackerConfig::default()
            },
        )
        .expect("Expected tracker to start");

        feed_lines(
            &mut tracker,
            &database,
            LogStream::Chat,
            &chat(&["18.00s 1st Bed Placed"]),
        );

        let attempts = database.attempts().unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].tower_name.is_none());
    }

    #[test]
    fn recovers_context_from_history_after_restart() {
        let (database, mut tracker) = setup();
        feed_lines(
            &mut tracker,
            &database,
            LogStream::Chat,
            &chat(&["[ZDASH] Tower: T-97 (97)", "[ZDASH] Type: Back Diagonal CW"]),
        );
        drop(tracker);

        let mut restarted = ChatTracker::new(Arc::clone(&database), ChatTrackerConfig::default())
            .expect("Expected tracker to restart");
        feed_lines(
            &mut restarted,
            &database,
            LogStream::Chat,
            &chat(&["16.40s 1st Bed Placed"]),
        );

        let attempts = database.attempts().unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].tower_name.as_deref(), Some("T-97"));
        assert_eq!(attempts[0].zero_type.as_deref(), Some("Back Diagonal CW"));
    }

    #[test]
    fn adopts_in_progress_attempt_and_resumes_bed_index() {
        let (database, mut tracker) = setup();
        feed_lines(
            &mut tracker,
            &database,
            LogStream::Chat,
            &chat(&[
                "[ZDASH] Tower: Tall Boy (103)",
                "[ZDASH] Type: Front Diagonal CW",
                "17.25s 1st Bed Placed",
                "Damage: 10",
                "Damage: 20",
            ]),
        );
        drop(tracker);

        let mut restarted = ChatTracker::new(Arc::clone(&database), ChatTrackerConfig::default())
            .expect("Expected tracker to restart");
        let attempt_id = restarted
            .current_attempt_id()
            .expect("Expected adopted attempt");
        feed_lines(&mut restarted, &database, LogStream::Chat, &chat(&["Damage: 30"]));

        let bed_indexes: Vec<i64> = database
            .attempt_beds(attempt_id)
            .unwrap()
            .into_iter()
            .map(|bed| bed.bed_index)
            .collect();
        assert_eq!(bed_indexes, vec![0, 1, 2]);
        let attempt = &database.attempts().unwrap()[0];
        assert_eq!(attempt.total_damage, 60);
        assert_eq!(attempt.max_damage_single_bed, 30);
    }

    #[test]
    fn leaving_practice_map_fails_attempt_and_drops_context() {
        let (database, mut tracker) = setup();
        let mut lines = chat(&[
            "[ZDASH] Tower: Tall Boy (103)",
            "[ZDASH] Type: Front Diagonal CW",
            "17.25s 1st Bed Placed",
        ]);
        lines.push(system_line("StateOutput State: title"));
        lines.push(chat_line("[ZDASH] Type: Front Diagonal CW"));
        lines.push(chat_line("19.00s 1st Bed Placed"));
        feed_lines(&mut tracker, &database, LogStream::Chat, &lines);

        let attempts = database.attempts().unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].fail_reason.as_deref(), Some("left_practice_map"));
        assert_eq!(attempts[1].tower_name.as_deref(), Some("Tall Boy"));
    }

    #[test]
    fn recap_lines_update_finished_attempt_until_blank_line() {
        let (database, mut tracker) = setup();
        feed_lines(
            &mut tracker,
            &database,
            LogStream::Chat,
            &chat(&[
                "[ZDASH] Tower: Tall Boy (103)",
                "[ZDASH] Type: Front Diagonal CW",
                "17.25s 1st Bed Placed",
                "Dragon Killed!",
                "Time: 28.95s",
                "Explosives: 4+1",
                "Standing Height: 101",
                "12.5 Blocks",
                "",
                "Damage: 99",
            ]),
        );

        let attempts = database.attempts().unwrap();
        let attempt = &attempts[0];
        assert_eq!(attempt.success_time_seconds, Some(28.95));
        assert_eq!(attempt.explosives_used, Some(4));
        assert_eq!(attempt.explosives_left, Some(1));
        assert_eq!(attempt.standing_height, Some(101));
        assert_eq!(attempt.distance_blocks, Some(12.5));
        assert_eq!(attempt.bed_count, 0);
        assert_eq!(tracker.current_attempt_id(), None);

        let explosives = database
            .attempt_events(attempt.id)
            .unwrap()
            .into_iter()
            .find(|event| event.event_type == "explosives")
            .expect("Expected explosives annotation");
        assert_eq!(explosives.value_text.as_deref(), Some("Explosives: 4+1"));
    }
}
