//! One-shot job dispatcher plus the two recurring loops (window generator, refresher).
//!
//! Jobs are keyed by `(event, entity_id)`. A key is accepted once per process: while it is
//! pending, and after it has fired (successfully or not), registering it again is a no-op.

use super::{
    events::JobKey,
    refresher::EventRefresher,
    windows::WindowGenerator,
};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Longest single sleep while waiting for a job; the wall clock is re-read after each slice.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(30);

/// Receives fired jobs.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, key: JobKey) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Created,
    Running,
    Stopped,
}

pub struct Scheduler {
    handler: Arc<dyn EventHandler>,
    state: Mutex<SchedulerState>,
    jobs: Arc<Mutex<HashMap<JobKey, JoinHandle<()>>>>,
    /// Keys that already fired, with their due instant, kept until pruned.
    fired: Arc<Mutex<HashMap<JobKey, DateTime<Utc>>>>,
    recurring: Mutex<Vec<JoinHandle<()>>>,
}

/// Sleeps until the wall clock reaches `due`, never returning early.
pub async fn sleep_until_wall(due: DateTime<Utc>) {
    loop {
        let remaining = match (due - Utc::now()).to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return,
        };
        sleep(remaining.min(MAX_SLEEP_SLICE)).await;
    }
}

impl Scheduler {
    pub fn new(handler: Arc<dyn EventHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            state: Mutex::new(SchedulerState::Created),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            fired: Arc::new(Mutex::new(HashMap::new())),
            recurring: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_known(&self, key: &JobKey) -> bool {
        self.jobs.lock().contains_key(key) || self.fired.lock().contains_key(key)
    }

    /// Registers a one-shot job firing at `due` (immediately if `due` has passed).
    /// Returns `false` when the key is pending, already fired, or the scheduler stopped.
    pub fn register(&self, key: JobKey, due: DateTime<Utc>) -> bool {
        if self.state() == SchedulerState::Stopped {
            return false;
        }

        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&key) || self.fired.lock().contains_key(&key) {
            return false;
        }

        let handler = Arc::clone(&self.handler);
        let job_map = Arc::clone(&self.jobs);
        let fired = Arc::clone(&self.fired);
        let handle = tokio::spawn(async move {
            sleep_until_wall(due).await;

            // Move to `fired` before running so a concurrent refresh can't re-register it.
            {
                let mut jobs = job_map.lock();
                jobs.remove(&key);
                fired.lock().insert(key, due);
            }

            debug!(job = %key, "firing");
            if let Err(e) = handler.handle_event(key).await {
                error!(job = %key, "❌ Job failed: {:#}", e);
            }
        });
        jobs.insert(key, handle);
        debug!(job = %key, due = %due, "job registered");
        true
    }

    /// Forgets fired keys due before `cutoff`; they can no longer be rediscovered.
    pub fn prune_fired(&self, cutoff: DateTime<Utc>) -> usize {
        let mut fired = self.fired.lock();
        let before = fired.len();
        fired.retain(|_, due| *due >= cutoff);
        before - fired.len()
    }

    /// Moves `Created -> Running`: one immediate generator pass, then both recurring loops.
    pub fn start(
        self: &Arc<Self>,
        generator: WindowGenerator,
        refresher: EventRefresher,
        generator_every: Duration,
        refresh_every: Duration,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SchedulerState::Created {
                bail!("scheduler cannot start from {:?}", *state);
            }
            *state = SchedulerState::Running;
        }

        if let Err(e) = generator.run(Utc::now()) {
            error!("Initial window generation failed: {:#}", e);
        }

        let generator_task = tokio::spawn(async move {
            let mut ticker = interval(generator_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = generator.run(Utc::now()) {
                    error!("Window generation failed: {:#}", e);
                }
            }
        });

        let scheduler = Arc::clone(self);
        let refresher_task = tokio::spawn(async move {
            let mut ticker = interval(refresh_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if scheduler.state() != SchedulerState::Running {
                    break;
                }
                match refresher.refresh(&scheduler, Utc::now()) {
                    Ok(report) if report.registered + report.overdue > 0 => info!(
                        "🔄 Registered {} upcoming and {} overdue jobs ({} pending)",
                        report.registered,
                        report.overdue,
                        scheduler.pending_jobs()
                    ),
                    Ok(_) => debug!("refresh: nothing new"),
                    Err(e) => error!("Event refresh failed: {:#}", e),
                }
            }
        });

        self.recurring
            .lock()
            .extend([generator_task, refresher_task]);
        info!(
            "⏱️  Scheduler running (generator every {:?}, refresh every {:?})",
            generator_every, refresh_every
        );
        Ok(())
    }

    /// Moves to `Stopped`, cancelling recurring loops and every pending job.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == SchedulerState::Stopped {
                return;
            }
            *state = SchedulerState::Stopped;
        }
        for task in self.recurring.lock().drain(..) {
            task.abort();
        }
        let pending: Vec<_> = self.jobs.lock().drain().collect();
        if !pending.is_empty() {
            warn!("Dropping {} pending jobs on shutdown", pending.len());
        }
        for (_, handle) in pending {
            handle.abort();
        }
        info!("Scheduler stopped");
    }
}
