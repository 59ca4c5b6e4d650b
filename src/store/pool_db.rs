//! SQLite-backed state store for epochs, rounds, predictions and per-user stats
//!
//! - WAL mode so the read paths (CLI, leaderboard) don't block lifecycle writes
//! - Times are stored as unix seconds
//! - "At most one entity per live status per kind" is a partial unique index, so a missed
//!   reconcile fails the transaction instead of silently corrupting state
//! - Every multi-row write runs inside one transaction

use crate::{
    lifecycle::events::EventSchedule,
    models::{
        normalize_address, Direction, EntityKind, Epoch, EpochWindow, Prediction, Round,
        RoundWindow, Status, UserEpochStat, UserStatsSummary, WeightAssignment,
    },
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{
    params, types::Type, Connection, OpenFlags, OptionalExtension, Row, Transaction,
};
use serde::Serialize;
use std::{str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS epochs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time INTEGER NOT NULL UNIQUE,
    end_time INTEGER NOT NULL,
    lock_start INTEGER NOT NULL,
    lock_end INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'scheduled',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_epochs_live_status
    ON epochs(status) WHERE status IN ('active', 'locked', 'calculating');

CREATE INDEX IF NOT EXISTS idx_epochs_lock_start ON epochs(lock_start);
CREATE INDEX IF NOT EXISTS idx_epochs_end_time ON epochs(end_time);

CREATE TABLE IF NOT EXISTS rounds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    epoch_id INTEGER NOT NULL REFERENCES epochs(id),
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    lock_start INTEGER NOT NULL,
    lock_end INTEGER NOT NULL,
    starting_price REAL NOT NULL DEFAULT 0,
    ending_price REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'scheduled',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE (epoch_id, start_time)
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_rounds_live_status
    ON rounds(status) WHERE status IN ('active', 'locked', 'calculating');

CREATE INDEX IF NOT EXISTS idx_rounds_start_time ON rounds(start_time);
CREATE INDEX IF NOT EXISTS idx_rounds_lock_end ON rounds(lock_end);

CREATE TABLE IF NOT EXISTS eligible_users (
    user_address TEXT NOT NULL,
    epoch_id INTEGER NOT NULL REFERENCES epochs(id),
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (user_address, epoch_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_address TEXT NOT NULL,
    round_id INTEGER NOT NULL REFERENCES rounds(id),
    direction TEXT NOT NULL,
    is_correct INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE (user_address, round_id)
);

CREATE INDEX IF NOT EXISTS idx_predictions_round ON predictions(round_id);

CREATE TABLE IF NOT EXISTS user_epoch_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_address TEXT NOT NULL,
    epoch_id INTEGER NOT NULL REFERENCES epochs(id),
    correct_predictions INTEGER NOT NULL DEFAULT 0,
    total_predictions INTEGER NOT NULL DEFAULT 0,
    weight INTEGER NOT NULL DEFAULT 0,
    UNIQUE (user_address, epoch_id)
);

CREATE INDEX IF NOT EXISTS idx_stats_epoch ON user_epoch_stats(epoch_id, correct_predictions DESC);
"#;

const EPOCH_COLUMNS: &str =
    "id, start_time, end_time, lock_start, lock_end, status, created_at, updated_at";

const ROUND_COLUMNS: &str = "id, epoch_id, start_time, end_time, lock_start, lock_end, \
     starting_price, ending_price, status, created_at, updated_at";

const STAT_COLUMNS: &str =
    "id, user_address, epoch_id, correct_predictions, total_predictions, weight";

/// Why a prediction was not accepted.
#[derive(Debug, Error)]
pub enum PredictionRejected {
    #[error("round {0} does not exist")]
    RoundNotFound(i64),
    #[error("round {round_id} is {status}, predictions are only accepted while active")]
    RoundNotActive { round_id: i64, status: Status },
    #[error("{user_address} is not eligible for epoch {epoch_id}")]
    NotEligible { user_address: String, epoch_id: i64 },
    #[error("{user_address} already predicted round {round_id}")]
    Duplicate { user_address: String, round_id: i64 },
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

/// Data written in the same transaction as a status change.
#[derive(Debug, Clone, Copy)]
pub enum TransitionEffect<'a> {
    None,
    /// Epoch lock: snapshot of the addresses allowed to predict.
    EligibleUsers(&'a [String]),
    /// Round start: opening price.
    StartingPrice(f64),
    /// Round calculating: closing price, evaluation of every prediction, stat increments.
    Settle { ending_price: f64 },
    /// Epoch calculating: per-stat weights.
    Weights(&'a [WeightAssignment]),
}

/// Outcome of settling one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundEvaluation {
    pub round_id: i64,
    pub epoch_id: i64,
    pub starting_price: f64,
    pub ending_price: f64,
    pub direction: Direction,
    pub predictions: usize,
    pub correct: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionCommit {
    /// Ids demoted to `aligned` by the reconcile step.
    pub aligned: Vec<i64>,
    pub evaluation: Option<RoundEvaluation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub epochs: u64,
    pub rounds: u64,
    pub predictions: u64,
}

pub struct PoolDb {
    conn: Arc<Mutex<Connection>>,
}

impl Clone for PoolDb {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

fn ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn col_time(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            anyhow!("timestamp out of range: {secs}").into(),
        )
    })
}

fn col_parse<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn col_u64(row: &Row, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    Ok(v.max(0) as u64)
}

/// Static SQL list of status literals; the values come from the enum, never from input.
fn status_list(statuses: &[Status]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl PoolDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        debug!("journal_mode = {}", journal_mode);

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        let counts = db.counts()?;
        info!(
            "📊 Pool database ready at {} ({} epochs, {} rounds, {} predictions)",
            db_path, counts.epochs, counts.rounds, counts.predictions
        );
        Ok(db)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.conn.lock();
        let count = |table: &str| -> Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| {
                r.get(0)
            })?;
            Ok(n.max(0) as u64)
        };
        Ok(StoreCounts {
            epochs: count("epochs")?,
            rounds: count("rounds")?,
            predictions: count("predictions")?,
        })
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    /// Inserts an epoch and its rounds atomically. Returns `None` when an epoch with the
    /// same `start_time` already exists, in which case no rounds are written.
    pub fn insert_epoch_plan(
        &self,
        epoch: &EpochWindow,
        rounds: &[RoundWindow],
    ) -> Result<Option<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = Self::insert_epoch_if_absent(&tx, epoch)?;
        if let Some(epoch_id) = inserted {
            Self::insert_rounds(&tx, epoch_id, rounds)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn insert_epoch_if_absent(tx: &Transaction, epoch: &EpochWindow) -> Result<Option<i64>> {
        let now = ts(Utc::now());
        let changes = tx.execute(
            "INSERT OR IGNORE INTO epochs
             (start_time, end_time, lock_start, lock_end, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'scheduled', ?5, ?5)",
            params![
                ts(epoch.start_time),
                ts(epoch.end_time),
                ts(epoch.lock_start),
                ts(epoch.lock_end),
                now
            ],
        )?;
        Ok((changes > 0).then(|| tx.last_insert_rowid()))
    }

    fn insert_rounds(tx: &Transaction, epoch_id: i64, rounds: &[RoundWindow]) -> Result<usize> {
        let now = ts(Utc::now());
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO rounds
             (epoch_id, start_time, end_time, lock_start, lock_end, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'scheduled', ?6, ?6)",
        )?;
        let mut inserted = 0usize;
        for r in rounds {
            inserted += stmt.execute(params![
                epoch_id,
                ts(r.start_time),
                ts(r.end_time),
                ts(r.lock_start),
                ts(r.lock_end),
                now
            ])?;
        }
        Ok(inserted)
    }

    /// End of the latest stored epoch, used to keep generated windows contiguous.
    pub fn latest_epoch_end(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let secs: Option<i64> =
            conn.query_row("SELECT MAX(end_time) FROM epochs", [], |r| r.get(0))?;
        Ok(secs.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)))
    }

    // ------------------------------------------------------------------
    // Scheduling queries
    // ------------------------------------------------------------------

    /// Entities whose due instant for `schedule` is strictly after `now`.
    /// A negative `limit` means unbounded.
    pub fn get_due(
        &self,
        schedule: &EventSchedule,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<(i64, DateTime<Utc>)>> {
        let kind = schedule.event.entity();
        let sql = format!(
            "SELECT id, {col} + ?1 AS due FROM {table}
             WHERE {col} + ?1 > ?2 AND status NOT IN ('completed', 'aligned')
             ORDER BY due ASC LIMIT ?3",
            col = schedule.column,
            table = kind.table(),
        );
        self.query_due(&sql, params![schedule.offset_secs, ts(now), limit])
    }

    /// Entities whose due instant lies in `[cutoff, now]` and whose status still precedes
    /// the event's target. Entities still `scheduled` once their `close` instant has passed
    /// are left alone: they never went live and their window is gone.
    pub fn get_overdue(
        &self,
        schedule: &EventSchedule,
        close: &EventSchedule,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<(i64, DateTime<Utc>)>> {
        let kind = schedule.event.entity();
        let before = kind.statuses_before(schedule.event.target_status());
        if before.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, {col} + ?1 AS due FROM {table}
             WHERE {col} + ?1 <= ?2 AND {col} + ?1 >= ?3 AND status IN ({statuses})
               AND (status != 'scheduled' OR {close_col} + ?5 > ?2)
             ORDER BY due ASC LIMIT ?4",
            col = schedule.column,
            close_col = close.column,
            table = kind.table(),
            statuses = status_list(&before),
        );
        self.query_due(
            &sql,
            params![
                schedule.offset_secs,
                ts(now),
                ts(cutoff),
                limit,
                close.offset_secs
            ],
        )
    }

    fn query_due(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<(i64, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| Ok((row.get::<_, i64>(0)?, col_time(row, 1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    pub fn status_of(&self, kind: EntityKind, id: i64) -> Result<Option<Status>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT status FROM {} WHERE id = ?1", kind.table()),
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|s| s.parse::<Status>()).transpose()
    }

    /// Plain status write without reconcile.
    pub fn set_status(&self, kind: EntityKind, id: i64, status: Status) -> Result<()> {
        let conn = self.conn.lock();
        let changes = Self::write_status(&conn, kind, id, status)?;
        if changes == 0 {
            return Err(anyhow!("{kind} {id} not found"));
        }
        Ok(())
    }

    /// Demotes every other entity of `kind` holding `status` to `aligned`.
    pub fn align_conflicting(
        &self,
        kind: EntityKind,
        status: Status,
        except_id: i64,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        Self::align_in(&conn, kind, status, except_id)
    }

    fn write_status(conn: &Connection, kind: EntityKind, id: i64, status: Status) -> Result<usize> {
        let changes = conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, updated_at = ?2 WHERE id = ?3",
                kind.table()
            ),
            params![status.as_str(), ts(Utc::now()), id],
        )?;
        Ok(changes)
    }

    fn align_in(
        conn: &Connection,
        kind: EntityKind,
        status: Status,
        except_id: i64,
    ) -> Result<Vec<i64>> {
        let ids = {
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM {} WHERE status = ?1 AND id != ?2",
                kind.table()
            ))?;
            let ids = stmt
                .query_map(params![status.as_str(), except_id], |r| r.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        for id in &ids {
            Self::write_status(conn, kind, *id, Status::Aligned)?;
        }
        Ok(ids)
    }

    /// Writes `target` only while the entity still sits before it in the lifecycle.
    fn advance_status(tx: &Transaction, kind: EntityKind, id: i64, target: Status) -> Result<usize> {
        let changes = tx.execute(
            &format!(
                "UPDATE {} SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
                kind.table(),
                status_list(&kind.statuses_before(target))
            ),
            params![target.as_str(), ts(Utc::now()), id],
        )?;
        Ok(changes)
    }

    /// Moves an entity to `target` together with its dependent writes, in one transaction.
    /// With `reconcile`, conflicting holders of `target` are aligned first.
    ///
    /// Returns `None`, with nothing written, when the entity has meanwhile reached or
    /// passed `target` (or was aligned).
    pub fn commit_transition(
        &self,
        kind: EntityKind,
        id: i64,
        target: Status,
        reconcile: bool,
        effect: TransitionEffect<'_>,
    ) -> Result<Option<TransitionCommit>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                &format!("SELECT status FROM {} WHERE id = ?1", kind.table()),
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        if current.is_none() {
            return Err(anyhow!("{kind} {id} not found"));
        }

        let mut commit = TransitionCommit::default();
        if reconcile {
            commit.aligned = Self::align_in(&tx, kind, target, id)?;
        }
        if Self::advance_status(&tx, kind, id, target)? == 0 {
            tx.rollback()?;
            return Ok(None);
        }

        match effect {
            TransitionEffect::None => {}
            TransitionEffect::EligibleUsers(users) => {
                Self::insert_eligible_in(&tx, id, users)?;
            }
            TransitionEffect::StartingPrice(price) => {
                tx.execute(
                    "UPDATE rounds SET starting_price = ?1 WHERE id = ?2",
                    params![price, id],
                )?;
            }
            TransitionEffect::Settle { ending_price } => {
                commit.evaluation = Some(Self::settle_round(&tx, id, ending_price)?);
            }
            TransitionEffect::Weights(weights) => {
                for w in weights {
                    tx.execute(
                        "UPDATE user_epoch_stats SET weight = ?1 WHERE id = ?2 AND epoch_id = ?3",
                        params![w.weight as i64, w.stat_id, id],
                    )?;
                }
            }
        }

        tx.commit()
            .with_context(|| format!("Failed to commit {kind} {id} -> {target}"))?;
        Ok(Some(commit))
    }

    fn settle_round(tx: &Transaction, round_id: i64, ending_price: f64) -> Result<RoundEvaluation> {
        let (epoch_id, starting_price): (i64, f64) = tx.query_row(
            "SELECT epoch_id, starting_price FROM rounds WHERE id = ?1",
            params![round_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        tx.execute(
            "UPDATE rounds SET ending_price = ?1 WHERE id = ?2",
            params![ending_price, round_id],
        )?;

        let direction = Direction::from_prices(starting_price, ending_price);
        let predictions = tx.execute(
            "UPDATE predictions SET is_correct = (direction = ?1) WHERE round_id = ?2",
            params![direction.as_str(), round_id],
        )?;
        let correct = tx.execute(
            "UPDATE user_epoch_stats SET correct_predictions = correct_predictions + 1
             WHERE epoch_id = ?1 AND user_address IN (
                 SELECT user_address FROM predictions WHERE round_id = ?2 AND is_correct = 1
             )",
            params![epoch_id, round_id],
        )?;

        Ok(RoundEvaluation {
            round_id,
            epoch_id,
            starting_price,
            ending_price,
            direction,
            predictions,
            correct,
        })
    }

    // ------------------------------------------------------------------
    // Eligibility, stats, predictions
    // ------------------------------------------------------------------

    pub fn insert_eligible_users(&self, epoch_id: i64, users: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let n = Self::insert_eligible_in(&tx, epoch_id, users)?;
        tx.commit()?;
        Ok(n)
    }

    fn insert_eligible_in(conn: &Connection, epoch_id: i64, users: &[String]) -> Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO eligible_users (user_address, epoch_id) VALUES (?1, ?2)",
        )?;
        let mut inserted = 0usize;
        for user in users {
            inserted += stmt.execute(params![normalize_address(user), epoch_id])?;
        }
        Ok(inserted)
    }

    pub fn is_eligible(&self, user_address: &str, epoch_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM eligible_users WHERE user_address = ?1 AND epoch_id = ?2",
                params![normalize_address(user_address), epoch_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn eligible_users(&self, epoch_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_address FROM eligible_users WHERE epoch_id = ?1 ORDER BY user_address",
        )?;
        let users = stmt
            .query_map(params![epoch_id], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    /// Accepts one prediction and bumps the user's `total_predictions` for the round's epoch.
    pub fn submit_prediction(
        &self,
        user_address: &str,
        round_id: i64,
        direction: Direction,
    ) -> std::result::Result<i64, PredictionRejected> {
        let user_address = normalize_address(user_address);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let round: Option<(i64, String)> = tx
            .query_row(
                "SELECT epoch_id, status FROM rounds WHERE id = ?1",
                params![round_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (epoch_id, status) = round.ok_or(PredictionRejected::RoundNotFound(round_id))?;
        let status = status.parse::<Status>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into())
        })?;
        if status != Status::Active {
            return Err(PredictionRejected::RoundNotActive { round_id, status });
        }

        let eligible: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM eligible_users WHERE user_address = ?1 AND epoch_id = ?2",
                params![user_address, epoch_id],
                |r| r.get(0),
            )
            .optional()?;
        if eligible.is_none() {
            return Err(PredictionRejected::NotEligible {
                user_address,
                epoch_id,
            });
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO predictions (user_address, round_id, direction, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_address, round_id, direction.as_str(), ts(Utc::now())],
        )?;
        if inserted == 0 {
            return Err(PredictionRejected::Duplicate {
                user_address,
                round_id,
            });
        }
        let prediction_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO user_epoch_stats (user_address, epoch_id, correct_predictions, total_predictions, weight)
             VALUES (?1, ?2, 0, 1, 0)
             ON CONFLICT (user_address, epoch_id)
             DO UPDATE SET total_predictions = total_predictions + 1",
            params![user_address, epoch_id],
        )?;

        tx.commit()?;
        Ok(prediction_id)
    }

    pub fn get_user_epoch_stats(&self, epoch_id: i64) -> Result<Vec<UserEpochStat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STAT_COLUMNS} FROM user_epoch_stats WHERE epoch_id = ?1 ORDER BY id"
        ))?;
        let stats = stmt
            .query_map(params![epoch_id], Self::row_to_stat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    pub fn update_stat_weight(&self, stat_id: i64, weight: u64) -> Result<()> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "UPDATE user_epoch_stats SET weight = ?1 WHERE id = ?2",
            params![weight as i64, stat_id],
        )?;
        if changes == 0 {
            return Err(anyhow!("stat {stat_id} not found"));
        }
        Ok(())
    }

    pub fn user_stats(&self, user_address: &str, epoch_id: i64) -> Result<Option<UserEpochStat>> {
        let conn = self.conn.lock();
        let stat = conn
            .query_row(
                &format!(
                    "SELECT {STAT_COLUMNS} FROM user_epoch_stats
                     WHERE user_address = ?1 AND epoch_id = ?2"
                ),
                params![normalize_address(user_address), epoch_id],
                Self::row_to_stat,
            )
            .optional()?;
        Ok(stat)
    }

    /// Best predictors of an epoch: most correct first, ties broken by volume.
    pub fn leaderboard(&self, epoch_id: i64, limit: usize) -> Result<Vec<UserStatsSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STAT_COLUMNS} FROM user_epoch_stats WHERE epoch_id = ?1
             ORDER BY correct_predictions DESC, total_predictions DESC, user_address ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![epoch_id, limit as i64], Self::row_to_stat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.iter().map(UserStatsSummary::from).collect())
    }

    pub fn predictions_for_round(&self, round_id: i64) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_address, round_id, direction, is_correct, created_at
             FROM predictions WHERE round_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![round_id], |row| {
                Ok(Prediction {
                    id: row.get(0)?,
                    user_address: row.get(1)?,
                    round_id: row.get(2)?,
                    direction: col_parse(row, 3)?,
                    is_correct: row.get::<_, Option<i64>>(4)?.map(|v| v != 0),
                    created_at: col_time(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Entity reads
    // ------------------------------------------------------------------

    pub fn get_epoch(&self, id: i64) -> Result<Option<Epoch>> {
        self.epoch_where("id = ?1", params![id])
    }

    pub fn get_round(&self, id: i64) -> Result<Option<Round>> {
        self.round_where("id = ?1", params![id])
    }

    /// The epoch currently open for predictions.
    pub fn current_epoch(&self) -> Result<Option<Epoch>> {
        self.epoch_where("status = 'active'", [])
    }

    /// The round currently accepting predictions.
    pub fn current_round(&self) -> Result<Option<Round>> {
        self.round_where("status = 'active'", [])
    }

    pub fn latest_completed_epoch(&self) -> Result<Option<Epoch>> {
        self.epoch_where(
            "status = 'completed' ORDER BY start_time DESC LIMIT 1",
            [],
        )
    }

    pub fn list_epochs(&self, limit: usize) -> Result<Vec<Epoch>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EPOCH_COLUMNS} FROM epochs ORDER BY start_time ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_epoch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn rounds_for_epoch(&self, epoch_id: i64) -> Result<Vec<Round>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUND_COLUMNS} FROM rounds WHERE epoch_id = ?1 ORDER BY start_time ASC"
        ))?;
        let rows = stmt
            .query_map(params![epoch_id], Self::row_to_round)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn epoch_where(&self, clause: &str, params: impl rusqlite::Params) -> Result<Option<Epoch>> {
        let conn = self.conn.lock();
        let epoch = conn
            .query_row(
                &format!("SELECT {EPOCH_COLUMNS} FROM epochs WHERE {clause}"),
                params,
                Self::row_to_epoch,
            )
            .optional()?;
        Ok(epoch)
    }

    fn round_where(&self, clause: &str, params: impl rusqlite::Params) -> Result<Option<Round>> {
        let conn = self.conn.lock();
        let round = conn
            .query_row(
                &format!("SELECT {ROUND_COLUMNS} FROM rounds WHERE {clause}"),
                params,
                Self::row_to_round,
            )
            .optional()?;
        Ok(round)
    }

    fn row_to_epoch(row: &Row) -> rusqlite::Result<Epoch> {
        Ok(Epoch {
            id: row.get(0)?,
            start_time: col_time(row, 1)?,
            end_time: col_time(row, 2)?,
            lock_start: col_time(row, 3)?,
            lock_end: col_time(row, 4)?,
            status: col_parse(row, 5)?,
            created_at: col_time(row, 6)?,
            updated_at: col_time(row, 7)?,
        })
    }

    fn row_to_round(row: &Row) -> rusqlite::Result<Round> {
        Ok(Round {
            id: row.get(0)?,
            epoch_id: row.get(1)?,
            start_time: col_time(row, 2)?,
            end_time: col_time(row, 3)?,
            lock_start: col_time(row, 4)?,
            lock_end: col_time(row, 5)?,
            starting_price: row.get(6)?,
            ending_price: row.get(7)?,
            status: col_parse(row, 8)?,
            created_at: col_time(row, 9)?,
            updated_at: col_time(row, 10)?,
        })
    }

    fn row_to_stat(row: &Row) -> rusqlite::Result<UserEpochStat> {
        Ok(UserEpochStat {
            id: row.get(0)?,
            user_address: row.get(1)?,
            epoch_id: row.get(2)?,
            correct_predictions: col_u64(row, 3)?,
            total_predictions: col_u64(row, 4)?,
            weight: col_u64(row, 5)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::events::EventKind;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn epoch_at(start: i64) -> EpochWindow {
        EpochWindow {
            start_time: t(start),
            end_time: t(start + 600),
            lock_start: t(start - 60),
            lock_end: t(start),
        }
    }

    fn two_rounds(start: i64) -> Vec<RoundWindow> {
        vec![
            RoundWindow {
                start_time: t(start),
                end_time: t(start + 150),
                lock_start: t(start + 150),
                lock_end: t(start + 300),
            },
            RoundWindow {
                start_time: t(start + 300),
                end_time: t(start + 450),
                lock_start: t(start + 450),
                lock_end: t(start + 600),
            },
        ]
    }

    fn seeded() -> (PoolDb, i64, Vec<Round>) {
        let db = PoolDb::new(":memory:").unwrap();
        let epoch_id = db
            .insert_epoch_plan(&epoch_at(0), &two_rounds(0))
            .unwrap()
            .unwrap();
        let rounds = db.rounds_for_epoch(epoch_id).unwrap();
        (db, epoch_id, rounds)
    }

    #[test]
    fn test_duplicate_epoch_skips_rounds() {
        let (db, _, _) = seeded();
        let again = db.insert_epoch_plan(&epoch_at(0), &two_rounds(0)).unwrap();
        assert_eq!(again, None);
        let counts = db.counts().unwrap();
        assert_eq!(counts.epochs, 1);
        assert_eq!(counts.rounds, 2);
    }

    #[test]
    fn test_live_status_is_unique_per_kind() {
        let (db, epoch_id, _) = seeded();
        let other = db
            .insert_epoch_plan(&epoch_at(600), &two_rounds(600))
            .unwrap()
            .unwrap();
        db.set_status(EntityKind::Epoch, epoch_id, Status::Active)
            .unwrap();
        assert!(db
            .set_status(EntityKind::Epoch, other, Status::Active)
            .is_err());
        // different live statuses coexist
        db.set_status(EntityKind::Epoch, other, Status::Locked)
            .unwrap();
    }

    #[test]
    fn test_reconcile_aligns_previous_holder() {
        let (db, _, rounds) = seeded();
        db.set_status(EntityKind::Round, rounds[0].id, Status::Active)
            .unwrap();
        let commit = db
            .commit_transition(
                EntityKind::Round,
                rounds[1].id,
                Status::Active,
                true,
                TransitionEffect::StartingPrice(2000.0),
            )
            .unwrap()
            .unwrap();
        assert_eq!(commit.aligned, vec![rounds[0].id]);
        assert_eq!(
            db.status_of(EntityKind::Round, rounds[0].id).unwrap(),
            Some(Status::Aligned)
        );
        let r1 = db.get_round(rounds[1].id).unwrap().unwrap();
        assert_eq!(r1.status, Status::Active);
        assert_eq!(r1.starting_price, 2000.0);
    }

    #[test]
    fn test_stale_transition_writes_nothing() {
        let (db, epoch_id, rounds) = seeded();
        let round_id = rounds[0].id;
        db.set_status(EntityKind::Round, rounds[1].id, Status::Active)
            .unwrap();
        db.set_status(EntityKind::Round, round_id, Status::Locked)
            .unwrap();

        // a start that lands after the lock must not reopen the round or touch the holder
        let stale = db
            .commit_transition(
                EntityKind::Round,
                round_id,
                Status::Active,
                true,
                TransitionEffect::StartingPrice(2000.0),
            )
            .unwrap();
        assert!(stale.is_none());
        let round = db.get_round(round_id).unwrap().unwrap();
        assert_eq!(round.status, Status::Locked);
        assert_eq!(round.starting_price, 0.0);
        assert_eq!(
            db.status_of(EntityKind::Round, rounds[1].id).unwrap(),
            Some(Status::Active)
        );

        db.set_status(EntityKind::Epoch, epoch_id, Status::Aligned)
            .unwrap();
        assert!(db
            .commit_transition(
                EntityKind::Epoch,
                epoch_id,
                Status::Locked,
                false,
                TransitionEffect::EligibleUsers(&["0xa".to_string()]),
            )
            .unwrap()
            .is_none());
        assert!(!db.is_eligible("0xa", epoch_id).unwrap());

        assert!(db
            .commit_transition(
                EntityKind::Round,
                9_999,
                Status::Active,
                false,
                TransitionEffect::None,
            )
            .is_err());
    }

    #[test]
    fn test_submit_prediction_rules() {
        let (db, epoch_id, rounds) = seeded();
        let round_id = rounds[0].id;

        assert!(matches!(
            db.submit_prediction("0xA", 9_999, Direction::Up),
            Err(PredictionRejected::RoundNotFound(9_999))
        ));
        assert!(matches!(
            db.submit_prediction("0xA", round_id, Direction::Up),
            Err(PredictionRejected::RoundNotActive { .. })
        ));

        db.set_status(EntityKind::Round, round_id, Status::Active)
            .unwrap();
        assert!(matches!(
            db.submit_prediction("0xA", round_id, Direction::Up),
            Err(PredictionRejected::NotEligible { .. })
        ));

        db.insert_eligible_users(epoch_id, &["0xA".to_string()])
            .unwrap();
        db.submit_prediction(" 0xa ", round_id, Direction::Up).unwrap();
        assert!(matches!(
            db.submit_prediction("0xA", round_id, Direction::Down),
            Err(PredictionRejected::Duplicate { .. })
        ));

        let stat = db.user_stats("0xA", epoch_id).unwrap().unwrap();
        assert_eq!(stat.total_predictions, 1);
        assert_eq!(stat.correct_predictions, 0);
    }

    #[test]
    fn test_settle_marks_every_prediction() {
        let (db, epoch_id, rounds) = seeded();
        let round_id = rounds[0].id;
        db.insert_eligible_users(epoch_id, &["0xa".into(), "0xb".into()])
            .unwrap();
        db.commit_transition(
            EntityKind::Round,
            round_id,
            Status::Active,
            true,
            TransitionEffect::StartingPrice(100.0),
        )
        .unwrap();
        db.submit_prediction("0xa", round_id, Direction::Up).unwrap();
        db.submit_prediction("0xb", round_id, Direction::Down).unwrap();

        let before = db.predictions_for_round(round_id).unwrap();
        assert!(before.iter().all(|p| p.is_correct.is_none()));

        let commit = db
            .commit_transition(
                EntityKind::Round,
                round_id,
                Status::Calculating,
                true,
                TransitionEffect::Settle {
                    ending_price: 101.0,
                },
            )
            .unwrap()
            .unwrap();
        let eval = commit.evaluation.unwrap();
        assert_eq!(eval.direction, Direction::Up);
        assert_eq!(eval.predictions, 2);
        assert_eq!(eval.correct, 1);

        let after = db.predictions_for_round(round_id).unwrap();
        assert!(after.iter().all(|p| p.is_correct.is_some()));
        let a = db.user_stats("0xa", epoch_id).unwrap().unwrap();
        let b = db.user_stats("0xb", epoch_id).unwrap().unwrap();
        assert_eq!((a.correct_predictions, b.correct_predictions), (1, 0));

        let board = db.leaderboard(epoch_id, 10).unwrap();
        assert_eq!(board[0].user_address, "0xa");
        assert_eq!(board[0].accuracy, 1.0);
    }

    #[test]
    fn test_due_and_overdue_queries() {
        let (db, _, rounds) = seeded();
        let cfg = crate::config::PoolConfig::default();
        let start = EventKind::RoundStart.schedule(&cfg);

        let due = db.get_due(&start, t(-10), 100).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0], (rounds[0].id, t(0)));

        let due = db.get_due(&start, t(10), 1).unwrap();
        assert_eq!(due, vec![(rounds[1].id, t(300))]);

        let close = EventKind::RoundCompletedStart.schedule(&cfg);
        let cutoff = t(10) - Duration::seconds(900);
        let overdue = db.get_overdue(&start, &close, t(10), cutoff, 100).unwrap();
        assert_eq!(overdue, vec![(rounds[0].id, t(0))]);

        // a round that never started is not revived once its window closed
        let late = db
            .get_overdue(&start, &close, t(400), t(400) - Duration::seconds(900), 100)
            .unwrap();
        assert_eq!(late, vec![(rounds[1].id, t(300))]);

        db.set_status(EntityKind::Round, rounds[0].id, Status::Active)
            .unwrap();
        let overdue = db.get_overdue(&start, &close, t(10), cutoff, 100).unwrap();
        assert!(overdue.is_empty());

        // but a live one is still driven forward after its window
        let lock = EventKind::RoundLockStart.schedule(&cfg);
        let overdue = db
            .get_overdue(&lock, &close, t(400), t(400) - Duration::seconds(900), 100)
            .unwrap();
        assert_eq!(overdue, vec![(rounds[0].id, t(150))]);
    }

    #[test]
    fn test_align_and_weight_primitives() {
        let (db, epoch_id, rounds) = seeded();
        db.set_status(EntityKind::Round, rounds[0].id, Status::Locked)
            .unwrap();
        let aligned = db
            .align_conflicting(EntityKind::Round, Status::Locked, rounds[1].id)
            .unwrap();
        assert_eq!(aligned, vec![rounds[0].id]);
        assert!(db
            .align_conflicting(EntityKind::Round, Status::Locked, rounds[1].id)
            .unwrap()
            .is_empty());

        db.insert_eligible_users(epoch_id, &["0xa".into()]).unwrap();
        db.set_status(EntityKind::Round, rounds[1].id, Status::Active)
            .unwrap();
        db.submit_prediction("0xa", rounds[1].id, Direction::Down)
            .unwrap();
        let stat = &db.get_user_epoch_stats(epoch_id).unwrap()[0];
        db.update_stat_weight(stat.id, 42).unwrap();
        assert_eq!(db.user_stats("0xa", epoch_id).unwrap().unwrap().weight, 42);
        assert!(db.update_stat_weight(9_999, 1).is_err());
    }

    #[test]
    fn test_latest_epoch_end_and_reads() {
        let (db, epoch_id, _) = seeded();
        assert_eq!(db.latest_epoch_end().unwrap(), Some(t(600)));
        assert!(db.current_epoch().unwrap().is_none());
        db.set_status(EntityKind::Epoch, epoch_id, Status::Completed)
            .unwrap();
        let done = db.latest_completed_epoch().unwrap().unwrap();
        assert_eq!(done.id, epoch_id);
        assert_eq!(done.lock_start, t(-60));
    }
}
