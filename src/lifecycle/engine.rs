//! Epoch and round state machines.
//!
//! Fallible side effects (price fetch, eligible-user read) run before anything is written.
//! The status change, reconcile and dependent rows then commit in one store transaction,
//! so a failed handler leaves the entity exactly where it was. The commit re-checks the
//! status, so a transition that lost a race with a later event is dropped whole.

use super::{
    dispatcher::EventHandler,
    events::{EventKind, JobKey},
};
use crate::{
    models::{EntityKind, Status},
    price::PriceSource,
    settlement::{compute_weights, weights::split_for_push, SettlementSink},
    store::{PoolDb, TransitionCommit, TransitionEffect},
};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    Applied(TransitionCommit),
    /// Entity already at or past the target, or aligned out of the lifecycle.
    Skipped { current: Status },
}

pub struct LifecycleEngine {
    db: PoolDb,
    price: Arc<dyn PriceSource>,
    sink: Arc<dyn SettlementSink>,
}

impl LifecycleEngine {
    pub fn new(db: PoolDb, price: Arc<dyn PriceSource>, sink: Arc<dyn SettlementSink>) -> Self {
        Self { db, price, sink }
    }

    pub async fn handle(&self, event: EventKind, id: i64) -> Result<HandleOutcome> {
        let kind = event.entity();
        let target = event.target_status();
        let current = self
            .db
            .status_of(kind, id)?
            .ok_or_else(|| anyhow!("{kind} {id} not found"))?;

        if !Self::precedes(kind, current, target) {
            warn!(
                event = %event,
                "{} {} is {}, skipping transition to {}",
                kind, id, current, target
            );
            return Ok(HandleOutcome::Skipped { current });
        }

        info!(event = %event, "{} {}: {} -> {}", kind, id, current, target);

        let applied = match event {
            EventKind::EpochLockStart => self.epoch_lock_start(id).await?,
            EventKind::EpochStart => self.transition(event, id, TransitionEffect::None)?,
            EventKind::EpochCalculatingStart => self.epoch_calculating_start(id).await?,
            EventKind::EpochCompletedStart => self.transition(event, id, TransitionEffect::None)?,
            EventKind::RoundStart => self.round_start(id).await?,
            EventKind::RoundLockStart => self.transition(event, id, TransitionEffect::None)?,
            EventKind::RoundCalculatingStart => self.round_calculating_start(id).await?,
            EventKind::RoundCompletedStart => self.transition(event, id, TransitionEffect::None)?,
        };

        // Another event for this entity committed while side effects were in flight.
        let Some(commit) = applied else {
            let current = self
                .db
                .status_of(kind, id)?
                .ok_or_else(|| anyhow!("{kind} {id} not found"))?;
            warn!(
                event = %event,
                "{} {} moved to {} meanwhile, dropping transition to {}",
                kind, id, current, target
            );
            return Ok(HandleOutcome::Skipped { current });
        };

        for aligned in &commit.aligned {
            warn!(
                event = %event,
                "⚠️  {} {} was still {}, moved to aligned",
                kind, aligned, target
            );
        }
        Ok(HandleOutcome::Applied(commit))
    }

    fn precedes(kind: EntityKind, current: Status, target: Status) -> bool {
        match (kind.rank(current), kind.rank(target)) {
            (Some(c), Some(t)) => c < t,
            _ => false,
        }
    }

    fn transition(
        &self,
        event: EventKind,
        id: i64,
        effect: TransitionEffect<'_>,
    ) -> Result<Option<TransitionCommit>> {
        self.db.commit_transition(
            event.entity(),
            id,
            event.target_status(),
            event.reconciles(),
            effect,
        )
    }

    async fn epoch_lock_start(&self, id: i64) -> Result<Option<TransitionCommit>> {
        let users = self.sink.get_eligible_users().await?;
        let Some(commit) = self.transition(
            EventKind::EpochLockStart,
            id,
            TransitionEffect::EligibleUsers(&users),
        )?
        else {
            return Ok(None);
        };
        info!(epoch_id = id, "🔒 Epoch locked with {} eligible users", users.len());
        Ok(Some(commit))
    }

    async fn epoch_calculating_start(&self, id: i64) -> Result<Option<TransitionCommit>> {
        let stats = self.db.get_user_epoch_stats(id)?;
        let weights = compute_weights(&stats);
        let Some(commit) = self.transition(
            EventKind::EpochCalculatingStart,
            id,
            TransitionEffect::Weights(&weights),
        )?
        else {
            return Ok(None);
        };

        if stats.is_empty() {
            info!(epoch_id = id, "No user statistics for epoch");
        } else if weights.is_empty() {
            warn!(epoch_id = id, "No correct predictions in epoch, no weights pushed");
        } else {
            info!(epoch_id = id, "Calculated weights for {} users", weights.len());
            let (users, values) = split_for_push(&weights);
            if self.sink.update_user_weights(&users, &values).await {
                info!(epoch_id = id, "Weights pushed to settlement sink");
            } else {
                error!(epoch_id = id, "Failed to push weights to settlement sink");
            }
        }
        Ok(Some(commit))
    }

    async fn round_start(&self, id: i64) -> Result<Option<TransitionCommit>> {
        let price = self.price.fetch_price().await?;
        let commit = self.transition(
            EventKind::RoundStart,
            id,
            TransitionEffect::StartingPrice(price),
        )?;
        if commit.is_some() {
            info!(round_id = id, starting_price = price, "▶️  Round started");
        }
        Ok(commit)
    }

    async fn round_calculating_start(&self, id: i64) -> Result<Option<TransitionCommit>> {
        let ending_price = self.price.fetch_price().await?;
        let commit = self.transition(
            EventKind::RoundCalculatingStart,
            id,
            TransitionEffect::Settle { ending_price },
        )?;
        if let Some(eval) = commit.as_ref().and_then(|c| c.evaluation.as_ref()) {
            info!(
                round_id = id,
                direction = %eval.direction,
                "📈 Round result: start {} end {}, {}/{} predictions correct",
                eval.starting_price,
                eval.ending_price,
                eval.correct,
                eval.predictions
            );
        }
        Ok(commit)
    }
}

#[async_trait::async_trait]
impl EventHandler for LifecycleEngine {
    async fn handle_event(&self, key: JobKey) -> Result<()> {
        self.handle(key.event, key.entity_id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, EpochWindow, RoundWindow};
    use chrono::{DateTime, TimeZone, Utc};
    use num_bigint::BigUint;
    use parking_lot::Mutex;

    struct FixedPrices(Mutex<Vec<f64>>);

    #[async_trait::async_trait]
    impl PriceSource for FixedPrices {
        async fn fetch_price(&self) -> Result<f64> {
            let mut prices = self.0.lock();
            if prices.is_empty() {
                Err(anyhow!("feed down"))
            } else {
                Ok(prices.remove(0))
            }
        }
    }

    /// Answers only after `delay`, long enough for a later event to land first.
    struct SlowPrice {
        delay: std::time::Duration,
        price: f64,
    }

    #[async_trait::async_trait]
    impl PriceSource for SlowPrice {
        async fn fetch_price(&self) -> Result<f64> {
            tokio::time::sleep(self.delay).await;
            Ok(self.price)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        users: Vec<String>,
        pushed: Mutex<Vec<(Vec<String>, Vec<u64>)>>,
    }

    #[async_trait::async_trait]
    impl SettlementSink for RecordingSink {
        async fn get_eligible_users(&self) -> Result<Vec<String>> {
            Ok(self.users.clone())
        }
        async fn get_user_balance(&self, _: &str) -> Result<BigUint> {
            Ok(BigUint::default())
        }
        async fn get_user_weight(&self, _: &str) -> Result<BigUint> {
            Ok(BigUint::default())
        }
        async fn get_epoch_baseline(&self) -> Result<BigUint> {
            Ok(BigUint::default())
        }
        async fn get_epoch_total_supply(&self) -> Result<BigUint> {
            Ok(BigUint::default())
        }
        async fn get_total_vault_value(&self) -> Result<BigUint> {
            Ok(BigUint::default())
        }
        async fn update_user_weights(&self, users: &[String], weights: &[u64]) -> bool {
            self.pushed.lock().push((users.to_vec(), weights.to_vec()));
            true
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn setup(prices: Vec<f64>) -> (LifecycleEngine, PoolDb, Arc<RecordingSink>, i64, Vec<i64>) {
        let db = PoolDb::new(":memory:").unwrap();
        let epoch = EpochWindow {
            start_time: t(0),
            end_time: t(120),
            lock_start: t(-60),
            lock_end: t(0),
        };
        let rounds = vec![
            RoundWindow {
                start_time: t(0),
                end_time: t(30),
                lock_start: t(30),
                lock_end: t(60),
            },
            RoundWindow {
                start_time: t(60),
                end_time: t(90),
                lock_start: t(90),
                lock_end: t(120),
            },
        ];
        let epoch_id = db.insert_epoch_plan(&epoch, &rounds).unwrap().unwrap();
        let round_ids = db
            .rounds_for_epoch(epoch_id)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        let sink = Arc::new(RecordingSink {
            users: vec!["0xA".into(), "0xB".into()],
            ..Default::default()
        });
        let engine = LifecycleEngine::new(
            db.clone(),
            Arc::new(FixedPrices(Mutex::new(prices))),
            sink.clone(),
        );
        (engine, db, sink, epoch_id, round_ids)
    }

    #[tokio::test]
    async fn test_full_epoch_cycle() {
        let (engine, db, sink, epoch_id, rounds) = setup(vec![100.0, 105.0, 105.0, 101.0]);

        engine.handle(EventKind::EpochLockStart, epoch_id).await.unwrap();
        assert!(db.is_eligible("0xa", epoch_id).unwrap());
        engine.handle(EventKind::EpochStart, epoch_id).await.unwrap();

        for (i, round_id) in rounds.iter().enumerate() {
            engine.handle(EventKind::RoundStart, *round_id).await.unwrap();
            db.submit_prediction("0xa", *round_id, Direction::Up).unwrap();
            if i == 0 {
                db.submit_prediction("0xb", *round_id, Direction::Down).unwrap();
            }
            engine.handle(EventKind::RoundLockStart, *round_id).await.unwrap();
            let outcome = engine
                .handle(EventKind::RoundCalculatingStart, *round_id)
                .await
                .unwrap();
            assert!(matches!(outcome, HandleOutcome::Applied(ref c) if c.evaluation.is_some()));
            engine
                .handle(EventKind::RoundCompletedStart, *round_id)
                .await
                .unwrap();
        }

        // round 1 went up (a right), round 2 went down (b had no prediction)
        let a = db.user_stats("0xa", epoch_id).unwrap().unwrap();
        let b = db.user_stats("0xb", epoch_id).unwrap().unwrap();
        assert_eq!((a.correct_predictions, a.total_predictions), (1, 2));
        assert_eq!((b.correct_predictions, b.total_predictions), (0, 1));

        engine
            .handle(EventKind::EpochCalculatingStart, epoch_id)
            .await
            .unwrap();
        assert_eq!(
            db.user_stats("0xa", epoch_id).unwrap().unwrap().weight,
            100
        );
        let pushed = sink.pushed.lock().clone();
        assert_eq!(pushed, vec![(vec!["0xa".to_string(), "0xb".to_string()], vec![100, 0])]);

        engine
            .handle(EventKind::EpochCompletedStart, epoch_id)
            .await
            .unwrap();
        assert_eq!(
            db.status_of(EntityKind::Epoch, epoch_id).unwrap(),
            Some(Status::Completed)
        );
    }

    #[tokio::test]
    async fn test_repeat_event_is_skipped() {
        let (engine, _db, _, _, rounds) = setup(vec![100.0]);
        engine.handle(EventKind::RoundStart, rounds[0]).await.unwrap();
        let again = engine.handle(EventKind::RoundStart, rounds[0]).await.unwrap();
        assert_eq!(
            again,
            HandleOutcome::Skipped {
                current: Status::Active
            }
        );
    }

    #[tokio::test]
    async fn test_price_failure_leaves_state_untouched() {
        let (engine, db, _, _, rounds) = setup(vec![]);
        assert!(engine.handle(EventKind::RoundStart, rounds[0]).await.is_err());
        let round = db.get_round(rounds[0]).unwrap().unwrap();
        assert_eq!(round.status, Status::Scheduled);
        assert_eq!(round.starting_price, 0.0);
    }

    #[tokio::test]
    async fn test_drifted_round_is_aligned() {
        let (engine, db, _, _, rounds) = setup(vec![100.0, 101.0]);
        engine.handle(EventKind::RoundStart, rounds[0]).await.unwrap();
        // lock/calculating for round 1 were missed
        let outcome = engine.handle(EventKind::RoundStart, rounds[1]).await.unwrap();
        match outcome {
            HandleOutcome::Applied(commit) => assert_eq!(commit.aligned, vec![rounds[0]]),
            other => panic!("unexpected {other:?}"),
        }
        // an aligned round never re-enters the lifecycle
        let late = engine
            .handle(EventKind::RoundLockStart, rounds[0])
            .await
            .unwrap();
        assert_eq!(
            late,
            HandleOutcome::Skipped {
                current: Status::Aligned
            }
        );
        assert_eq!(
            db.status_of(EntityKind::Round, rounds[1]).unwrap(),
            Some(Status::Active)
        );
    }

    #[tokio::test]
    async fn test_unknown_entity_is_an_error() {
        let (engine, ..) = setup(vec![]);
        assert!(engine.handle(EventKind::EpochStart, 404).await.is_err());
    }

    fn slow_engine(db: &PoolDb, sink: Arc<RecordingSink>, price: f64) -> Arc<LifecycleEngine> {
        Arc::new(LifecycleEngine::new(
            db.clone(),
            Arc::new(SlowPrice {
                delay: std::time::Duration::from_millis(300),
                price,
            }),
            sink,
        ))
    }

    #[tokio::test]
    async fn test_late_round_start_does_not_reopen_locked_round() {
        let (engine, db, sink, epoch_id, rounds) = setup(vec![]);
        db.insert_eligible_users(epoch_id, &["0xa".into()]).unwrap();
        let slow = slow_engine(&db, sink, 100.0);

        let start = tokio::spawn({
            let slow = slow.clone();
            let id = rounds[0];
            async move { slow.handle(EventKind::RoundStart, id).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // the lock is due while the start is still waiting on the price
        let lock = engine
            .handle(EventKind::RoundLockStart, rounds[0])
            .await
            .unwrap();
        assert!(matches!(lock, HandleOutcome::Applied(_)));

        let late = start.await.unwrap().unwrap();
        assert_eq!(
            late,
            HandleOutcome::Skipped {
                current: Status::Locked
            }
        );
        let round = db.get_round(rounds[0]).unwrap().unwrap();
        assert_eq!(round.status, Status::Locked);
        assert_eq!(round.starting_price, 0.0);
        assert!(db
            .submit_prediction("0xa", rounds[0], Direction::Up)
            .is_err());
    }

    #[tokio::test]
    async fn test_late_round_settlement_does_not_undo_completion() {
        let (engine, db, sink, epoch_id, rounds) = setup(vec![100.0]);
        db.insert_eligible_users(epoch_id, &["0xa".into()]).unwrap();
        engine.handle(EventKind::RoundStart, rounds[0]).await.unwrap();
        db.submit_prediction("0xa", rounds[0], Direction::Up).unwrap();
        engine
            .handle(EventKind::RoundLockStart, rounds[0])
            .await
            .unwrap();

        let slow = slow_engine(&db, sink, 150.0);
        let calculating = tokio::spawn({
            let slow = slow.clone();
            let id = rounds[0];
            async move { slow.handle(EventKind::RoundCalculatingStart, id).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        engine
            .handle(EventKind::RoundCompletedStart, rounds[0])
            .await
            .unwrap();

        let late = calculating.await.unwrap().unwrap();
        assert_eq!(
            late,
            HandleOutcome::Skipped {
                current: Status::Completed
            }
        );
        let round = db.get_round(rounds[0]).unwrap().unwrap();
        assert_eq!(round.status, Status::Completed);
        assert_eq!(round.ending_price, 0.0);
        let predictions = db.predictions_for_round(rounds[0]).unwrap();
        assert!(predictions.iter().all(|p| p.is_correct.is_none()));
        assert_eq!(
            db.user_stats("0xa", epoch_id)
                .unwrap()
                .unwrap()
                .correct_predictions,
            0
        );
    }
}
