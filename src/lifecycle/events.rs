//! Closed catalogue of lifecycle events.
//!
//! Each event is bound to one entity kind, one timestamp column, and one target status.
//! Dispatch goes through `match` on [`EventKind`], never through name lookup.

use crate::{
    config::PoolConfig,
    models::{EntityKind, Status},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EpochLockStart,
    EpochStart,
    EpochCalculatingStart,
    EpochCompletedStart,
    RoundStart,
    RoundLockStart,
    RoundCalculatingStart,
    RoundCompletedStart,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::EpochLockStart,
        EventKind::EpochStart,
        EventKind::EpochCalculatingStart,
        EventKind::EpochCompletedStart,
        EventKind::RoundStart,
        EventKind::RoundLockStart,
        EventKind::RoundCalculatingStart,
        EventKind::RoundCompletedStart,
    ];

    /// Stable name, used as the job-key prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EpochLockStart => "process_epoch_lock_start",
            EventKind::EpochStart => "process_epoch_start",
            EventKind::EpochCalculatingStart => "process_epoch_calculating_start",
            EventKind::EpochCompletedStart => "process_epoch_completed_start",
            EventKind::RoundStart => "process_round_start",
            EventKind::RoundLockStart => "process_round_lock_start",
            EventKind::RoundCalculatingStart => "process_round_calculating_start",
            EventKind::RoundCompletedStart => "process_round_completed_start",
        }
    }

    pub fn entity(&self) -> EntityKind {
        match self {
            EventKind::EpochLockStart
            | EventKind::EpochStart
            | EventKind::EpochCalculatingStart
            | EventKind::EpochCompletedStart => EntityKind::Epoch,
            EventKind::RoundStart
            | EventKind::RoundLockStart
            | EventKind::RoundCalculatingStart
            | EventKind::RoundCompletedStart => EntityKind::Round,
        }
    }

    pub fn target_status(&self) -> Status {
        match self {
            EventKind::EpochLockStart | EventKind::RoundLockStart => Status::Locked,
            EventKind::EpochStart | EventKind::RoundStart => Status::Active,
            EventKind::EpochCalculatingStart | EventKind::RoundCalculatingStart => {
                Status::Calculating
            }
            EventKind::EpochCompletedStart | EventKind::RoundCompletedStart => Status::Completed,
        }
    }

    /// Completion is not a live status, so it never conflicts with another entity.
    pub fn reconciles(&self) -> bool {
        self.target_status().is_live()
    }

    /// The event that closes an entity's lifecycle.
    pub fn completion_of(kind: EntityKind) -> EventKind {
        match kind {
            EntityKind::Epoch => EventKind::EpochCompletedStart,
            EntityKind::Round => EventKind::RoundCompletedStart,
        }
    }

    /// Where the due instant comes from for this event under `cfg`.
    pub fn schedule(&self, cfg: &PoolConfig) -> EventSchedule {
        let (column, offset_secs) = match self {
            EventKind::EpochLockStart => ("lock_start", 0),
            EventKind::EpochStart => ("start_time", 0),
            EventKind::EpochCalculatingStart => ("end_time", 0),
            EventKind::EpochCompletedStart => ("end_time", cfg.epoch_calculating_grace_secs),
            EventKind::RoundStart => ("start_time", 0),
            EventKind::RoundLockStart => ("lock_start", 0),
            EventKind::RoundCalculatingStart => ("lock_end", -cfg.round_calculating_grace_secs),
            EventKind::RoundCompletedStart => ("lock_end", 0),
        };
        EventSchedule {
            event: *self,
            column,
            offset_secs,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Due-time rule: `column + offset_secs` on the event's entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSchedule {
    pub event: EventKind,
    pub column: &'static str,
    pub offset_secs: i64,
}

/// Unique identity of a one-shot job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub event: EventKind,
    pub entity_id: i64,
}

impl JobKey {
    pub fn new(event: EventKind, entity_id: i64) -> Self {
        Self { event, entity_id }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.event.as_str(), self.entity_id)
    }
}

/// A transition instant discovered in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueEvent {
    pub key: JobKey,
    pub due: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_display_format() {
        let key = JobKey::new(EventKind::RoundCalculatingStart, 42);
        assert_eq!(key.to_string(), "process_round_calculating_start_42");
    }

    #[test]
    fn test_every_event_targets_a_lifecycle_status() {
        for event in EventKind::ALL {
            assert!(event.entity().rank(event.target_status()).is_some());
        }
    }

    #[test]
    fn test_only_completion_skips_reconcile() {
        let skipping: Vec<_> = EventKind::ALL
            .into_iter()
            .filter(|e| !e.reconciles())
            .collect();
        assert_eq!(
            skipping,
            vec![EventKind::EpochCompletedStart, EventKind::RoundCompletedStart]
        );
    }

    #[test]
    fn test_grace_offsets_follow_config() {
        let cfg = PoolConfig {
            epoch_calculating_grace_secs: 90,
            round_calculating_grace_secs: 7,
            ..PoolConfig::default()
        };
        assert_eq!(
            EventKind::EpochCompletedStart.schedule(&cfg).offset_secs,
            90
        );
        let round_calc = EventKind::RoundCalculatingStart.schedule(&cfg);
        assert_eq!(round_calc.column, "lock_end");
        assert_eq!(round_calc.offset_secs, -7);
    }
}
