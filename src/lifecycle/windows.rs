//! Rolling-horizon window generation.
//!
//! Planning is pure (`plan_epochs`) so contiguity and partitioning can be tested without a
//! store; `WindowGenerator` persists the plan idempotently.

use crate::{
    config::PoolConfig,
    models::{EpochWindow, RoundWindow},
    store::PoolDb,
};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// `now` rounded down to the start of its hour.
pub fn truncate_to_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(now)
}

/// Rounds partitioning `[epoch_start, epoch_end)`. The last round absorbs any remainder
/// left by integer division of the epoch length.
pub fn plan_rounds(
    cfg: &PoolConfig,
    epoch_start: DateTime<Utc>,
    epoch_end: DateTime<Utc>,
) -> Vec<RoundWindow> {
    let count = cfg.rounds_per_epoch;
    let round_dur = Duration::seconds(cfg.round_duration_secs());
    let unlocked = Duration::seconds(cfg.round_unlocked_secs());

    let mut rounds = Vec::with_capacity(count as usize);
    let mut start = epoch_start;
    for i in 0..count {
        let lock_start = start + unlocked;
        let lock_end = if i + 1 == count {
            epoch_end
        } else {
            start + round_dur
        };
        rounds.push(RoundWindow {
            start_time: start,
            end_time: lock_start,
            lock_start,
            lock_end,
        });
        start = lock_end;
    }
    rounds
}

/// Epoch windows (with their rounds) needed to cover the horizon ahead of `now`.
///
/// Windows continue from `latest_end` when it is not older than the current hour, so
/// consecutive runs never leave a gap or overlap even if the epoch length doesn't divide
/// an hour.
pub fn plan_epochs(
    cfg: &PoolConfig,
    now: DateTime<Utc>,
    latest_end: Option<DateTime<Utc>>,
) -> Vec<(EpochWindow, Vec<RoundWindow>)> {
    let base = truncate_to_hour(now);
    let horizon_end = base + Duration::seconds(cfg.generation_horizon_secs);
    let epoch_dur = cfg.epoch_duration();
    let lock = Duration::seconds(cfg.epoch_lock_secs);

    let mut start = match latest_end {
        Some(end) if end >= base => end,
        _ => base,
    };

    let mut plan = Vec::new();
    while start + epoch_dur <= horizon_end {
        let end = start + epoch_dur;
        let epoch = EpochWindow {
            start_time: start,
            end_time: end,
            lock_start: start - lock,
            lock_end: start,
        };
        plan.push((epoch, plan_rounds(cfg, start, end)));
        start = end;
    }
    plan
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub created: usize,
    pub skipped: usize,
}

pub struct WindowGenerator {
    db: PoolDb,
    cfg: Arc<PoolConfig>,
}

impl WindowGenerator {
    pub fn new(db: PoolDb, cfg: Arc<PoolConfig>) -> Self {
        Self { db, cfg }
    }

    pub fn run(&self, now: DateTime<Utc>) -> Result<GenerationReport> {
        let latest_end = self.db.latest_epoch_end()?;
        let plan = plan_epochs(&self.cfg, now, latest_end);

        let mut report = GenerationReport::default();
        for (epoch, rounds) in &plan {
            match self.db.insert_epoch_plan(epoch, rounds)? {
                Some(epoch_id) => {
                    debug!(
                        epoch_id,
                        start = %epoch.start_time,
                        rounds = rounds.len(),
                        "epoch window created"
                    );
                    report.created += 1;
                }
                None => report.skipped += 1,
            }
        }

        if report.created > 0 {
            info!(
                "🗓️  Generated {} epochs ({} already present)",
                report.created, report.skipped
            );
        } else {
            debug!("window generator: horizon already covered");
        }
        Ok(report)
    }
}
