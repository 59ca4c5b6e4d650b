use super::{
    dispatcher::Scheduler,
    events::{DueEvent, EventKind, JobKey},
};
use crate::{config::PoolConfig, models::EntityKind, store::PoolDb};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub registered: usize,
    pub overdue: usize,
}

/// Turns stored window boundaries into dispatcher jobs.
pub struct EventRefresher {
    db: PoolDb,
    cfg: Arc<PoolConfig>,
}

impl EventRefresher {
    pub fn new(db: PoolDb, cfg: Arc<PoolConfig>) -> Self {
        Self { db, cfg }
    }

    fn limit_for(&self, event: EventKind) -> i64 {
        match event.entity() {
            EntityKind::Epoch => -1,
            EntityKind::Round => self.cfg.round_batch_limit as i64,
        }
    }

    /// Every upcoming transition, soonest first.
    pub fn upcoming(&self, now: DateTime<Utc>) -> Result<Vec<DueEvent>> {
        let mut out = Vec::new();
        for event in EventKind::ALL {
            let schedule = event.schedule(&self.cfg);
            for (id, due) in self.db.get_due(&schedule, now, self.limit_for(event))? {
                out.push(DueEvent {
                    key: JobKey::new(event, id),
                    due,
                });
            }
        }
        out.sort_by_key(|e| (e.due, e.key));
        Ok(out)
    }

    /// Missed transitions inside the catch-up window, at most one per entity: the one that
    /// comes first in its lifecycle, so recovery replays transitions in order across
    /// refresh cycles.
    pub fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<DueEvent>> {
        if self.cfg.missed_event_catchup_secs <= 0 {
            return Ok(Vec::new());
        }
        let cutoff = now - Duration::seconds(self.cfg.missed_event_catchup_secs);

        let mut earliest: HashMap<(EntityKind, i64), DueEvent> = HashMap::new();
        let rank = |e: EventKind| e.entity().rank(e.target_status()).unwrap_or(usize::MAX);
        for event in EventKind::ALL {
            let schedule = event.schedule(&self.cfg);
            let close = EventKind::completion_of(event.entity()).schedule(&self.cfg);
            for (id, due) in
                self.db
                    .get_overdue(&schedule, &close, now, cutoff, self.limit_for(event))?
            {
                let candidate = DueEvent {
                    key: JobKey::new(event, id),
                    due,
                };
                earliest
                    .entry((event.entity(), id))
                    .and_modify(|cur| {
                        if (candidate.due, rank(candidate.key.event)) < (cur.due, rank(cur.key.event))
                        {
                            *cur = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }

        let mut out: Vec<_> = earliest.into_values().collect();
        out.sort_by_key(|e| (e.due, e.key));
        Ok(out)
    }

    pub fn refresh(&self, scheduler: &Arc<Scheduler>, now: DateTime<Utc>) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();

        for event in self.upcoming(now)? {
            if scheduler.register(event.key, event.due) {
                report.registered += 1;
            }
        }

        for event in self.overdue(now)? {
            if scheduler.register(event.key, event.due) {
                info!(
                    job = %event.key,
                    "⏪ Catching up missed event due at {}",
                    event.due
                );
                report.overdue += 1;
            }
        }

        let pruned = scheduler.prune_fired(
            now - Duration::seconds(self.cfg.missed_event_catchup_secs.max(0)),
        );
        if pruned > 0 {
            debug!("pruned {} fired job keys", pruned);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{dispatcher::EventHandler, windows::WindowGenerator};
    use chrono::TimeZone;

    struct Noop;

    #[async_trait::async_trait]
    impl EventHandler for Noop {
        async fn handle_event(&self, _key: JobKey) -> Result<()> {
            Ok(())
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 1, h, m, s).unwrap()
    }

    fn seeded(cfg: PoolConfig, gen_at: DateTime<Utc>) -> (PoolDb, EventRefresher) {
        let db = PoolDb::new(":memory:").unwrap();
        let cfg = Arc::new(cfg);
        WindowGenerator::new(db.clone(), cfg.clone())
            .run(gen_at)
            .unwrap();
        (db.clone(), EventRefresher::new(db, cfg))
    }

    #[test]
    fn test_upcoming_is_bounded_for_rounds_only() {
        let cfg = PoolConfig {
            round_batch_limit: 5,
            ..PoolConfig::default()
        };
        let (_, refresher) = seeded(cfg, at(0, 0, 0));
        let events = refresher.upcoming(at(0, 0, 1)).unwrap();

        let per_kind = |k: EventKind| events.iter().filter(|e| e.key.event == k).count();
        assert_eq!(per_kind(EventKind::RoundStart), 5);
        assert_eq!(per_kind(EventKind::RoundCompletedStart), 5);
        // 216 epochs, the first already started
        assert_eq!(per_kind(EventKind::EpochStart), 215);
        assert_eq!(per_kind(EventKind::EpochCompletedStart), 216);
        assert!(events.windows(2).all(|w| w[0].due <= w[1].due));
    }

    #[test]
    fn test_overdue_picks_first_missed_step_per_entity() {
        let (db, refresher) = seeded(PoolConfig::default(), at(0, 0, 0));
        // 2.5 minutes into the first epoch with nothing processed
        let overdue = refresher.overdue(at(0, 2, 30)).unwrap();

        let epoch_events: Vec<_> = overdue
            .iter()
            .filter(|e| e.key.event.entity() == EntityKind::Epoch)
            .collect();
        assert_eq!(epoch_events.len(), 1);
        assert_eq!(epoch_events[0].key.event, EventKind::EpochLockStart);
        assert_eq!(epoch_events[0].due, at(0, 0, 0) - Duration::seconds(60));

        // rounds 1 and 2 closed without ever starting; only round 3 is caught up
        let rounds: Vec<_> = overdue
            .iter()
            .filter(|e| e.key.event.entity() == EntityKind::Round)
            .collect();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].key.event, EventKind::RoundStart);
        assert_eq!(rounds[0].due, at(0, 2, 0));

        let epoch_id = epoch_events[0].key.entity_id;
        let third = &db.rounds_for_epoch(epoch_id).unwrap()[2];
        assert_eq!(rounds[0].key.entity_id, third.id);
    }

    #[test]
    fn test_catchup_disabled_with_zero_window() {
        let cfg = PoolConfig {
            missed_event_catchup_secs: 0,
            ..PoolConfig::default()
        };
        let (_, refresher) = seeded(cfg, at(0, 0, 0));
        assert!(refresher.overdue(at(0, 5, 0)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_registers_each_key_once() {
        let (_, refresher) = seeded(PoolConfig::default(), at(0, 0, 0));
        let scheduler = Scheduler::new(Arc::new(Noop));
        let now = at(0, 0, 1);

        let first = refresher.refresh(&scheduler, now).unwrap();
        assert!(first.registered > 0);
        // epoch 1 lock-start and round 1 start were due moments ago
        assert_eq!(first.overdue, 2);
        let second = refresher.refresh(&scheduler, now).unwrap();
        assert_eq!(second.registered, 0);
        scheduler.shutdown();
    }
}
