//! Turns stored raw events into attempt rows.

pub mod chat;
pub(crate) mod rules;
pub mod telemetry;
pub mod world;

use crate::storage::{RawEvent, StorageResult};

pub use chat::{ChatTracker, ChatTrackerConfig};
pub use telemetry::{TelemetryConfig, TelemetryReconstructor};

/// Consumer of one stream's raw events, called in insertion order.
pub trait Tracker: Send {
    fn handle_event(&mut self, event: &RawEvent) -> StorageResult<()>;
}
