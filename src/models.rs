use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Lifecycle status shared by epochs and rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Scheduled,
    Active,
    Locked,
    Calculating,
    Completed,
    /// Demoted by drift reconciliation; never re-enters the lifecycle.
    Aligned,
}

impl Status {
    pub const LIVE: [Status; 3] = [Status::Active, Status::Locked, Status::Calculating];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Scheduled => "scheduled",
            Status::Active => "active",
            Status::Locked => "locked",
            Status::Calculating => "calculating",
            Status::Completed => "completed",
            Status::Aligned => "aligned",
        }
    }

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Status::Scheduled),
            "active" => Ok(Status::Active),
            "locked" => Ok(Status::Locked),
            "calculating" => Ok(Status::Calculating),
            "completed" => Ok(Status::Completed),
            "aligned" => Ok(Status::Aligned),
            other => Err(anyhow::anyhow!("unknown status: {other}")),
        }
    }
}

/// The two entity kinds driven through the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Epoch,
    Round,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Epoch => "epoch",
            EntityKind::Round => "round",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            EntityKind::Epoch => "epochs",
            EntityKind::Round => "rounds",
        }
    }

    /// Ordered lifecycle. Epochs lock before they start (eligibility snapshot);
    /// rounds lock at the tail of their window.
    pub fn lifecycle(&self) -> &'static [Status] {
        match self {
            EntityKind::Epoch => &[
                Status::Scheduled,
                Status::Locked,
                Status::Active,
                Status::Calculating,
                Status::Completed,
            ],
            EntityKind::Round => &[
                Status::Scheduled,
                Status::Active,
                Status::Locked,
                Status::Calculating,
                Status::Completed,
            ],
        }
    }

    /// Position of `status` in the lifecycle. `Aligned` sits outside of it.
    pub fn rank(&self, status: Status) -> Option<usize> {
        self.lifecycle().iter().position(|s| *s == status)
    }

    /// Statuses strictly before `target` in this kind's lifecycle.
    pub fn statuses_before(&self, target: Status) -> Vec<Status> {
        match self.rank(target) {
            Some(idx) => self.lifecycle()[..idx].to_vec(),
            None => Vec::new(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicted (or realised) price movement over a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    /// Strictly greater is `Up`; a flat round resolves to `Down`.
    pub fn from_prices(starting_price: f64, ending_price: f64) -> Self {
        if ending_price > starting_price {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(anyhow::anyhow!("direction must be \"up\" or \"down\", got {other}")),
        }
    }
}

/// Epoch window as produced by the generator, before it has an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochWindow {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub lock_start: DateTime<Utc>,
    pub lock_end: DateTime<Utc>,
}

/// Round window as produced by the generator. `end_time` equals `lock_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundWindow {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub lock_start: DateTime<Utc>,
    pub lock_end: DateTime<Utc>,
}

impl RoundWindow {
    pub fn duration_secs(&self) -> i64 {
        (self.lock_end - self.start_time).num_seconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub lock_start: DateTime<Utc>,
    pub lock_end: DateTime<Utc>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: i64,
    pub epoch_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub lock_start: DateTime<Utc>,
    pub lock_end: DateTime<Utc>,
    pub starting_price: f64,
    pub ending_price: f64,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: i64,
    pub user_address: String,
    pub round_id: i64,
    pub direction: Direction,
    pub is_correct: Option<bool>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEpochStat {
    pub id: i64,
    pub user_address: String,
    pub epoch_id: i64,
    pub correct_predictions: u64,
    pub total_predictions: u64,
    pub weight: u64,
}

impl UserEpochStat {
    pub fn accuracy(&self) -> f64 {
        if self.total_predictions == 0 {
            0.0
        } else {
            self.correct_predictions as f64 / self.total_predictions as f64
        }
    }
}

/// Per-user summary for leaderboards and reward reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatsSummary {
    pub user_address: String,
    pub epoch_id: i64,
    pub correct_predictions: u64,
    pub total_predictions: u64,
    pub accuracy: f64,
    pub weight: u64,
}

impl From<&UserEpochStat> for UserStatsSummary {
    fn from(stat: &UserEpochStat) -> Self {
        Self {
            user_address: stat.user_address.clone(),
            epoch_id: stat.epoch_id,
            correct_predictions: stat.correct_predictions,
            total_predictions: stat.total_predictions,
            accuracy: stat.accuracy(),
            weight: stat.weight,
        }
    }
}

/// Weight computed for one stat row at epoch close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightAssignment {
    pub stat_id: i64,
    pub user_address: String,
    pub weight: u64,
}

/// Lowercase, trimmed wallet address used as the canonical key everywhere.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}
