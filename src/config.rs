//! Runtime configuration
//!
//! Everything is read from the environment (after `.env` loading in `main`) with defaults
//! suited to a 10-minute epoch game. `validate` must pass before the scheduler starts.

use chrono::Duration as ChronoDuration;
use std::{env, str::FromStr, time::Duration};
use thiserror::Error;

pub const SECONDS_PER_YEAR: i64 = 365 * 24 * 60 * 60;

pub const DEFAULT_PRICE_API_URL: &str = "https://api.binance.com/api/v3/ticker/price?symbol=";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("round lock fraction must be in (0, 1), got {0}")]
    LockFraction(f64),
    #[error("rounds per epoch must be at least 1")]
    NoRounds,
    #[error("epoch duration {epoch_secs}s is shorter than {rounds} rounds of one second")]
    EpochTooShort { epoch_secs: i64, rounds: u32 },
    #[error("generation horizon {horizon_secs}s does not cover one epoch of {epoch_secs}s")]
    HorizonTooShort { horizon_secs: i64, epoch_secs: i64 },
    #[error("round calculating grace {grace_secs}s must be shorter than the locked part of a round ({locked_secs}s)")]
    GraceTooLong { grace_secs: i64, locked_secs: i64 },
    #[error("epoch lock window {lock_secs}s must be shorter than the epoch ({epoch_secs}s)")]
    EpochLockTooLong { lock_secs: i64, epoch_secs: i64 },
    #[error("epoch calculating grace {grace_secs}s must be shorter than the epoch ({epoch_secs}s)")]
    EpochGraceTooLong { grace_secs: i64, epoch_secs: i64 },
    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub database_path: String,

    // Windows
    pub epoch_duration_secs: i64,
    pub epoch_lock_secs: i64,
    pub epoch_calculating_grace_secs: i64,
    pub rounds_per_epoch: u32,
    pub round_lock_fraction: f64,
    pub round_calculating_grace_secs: i64,
    pub generation_horizon_secs: i64,

    // Scheduling cadence
    pub generator_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub round_batch_limit: usize,
    /// Overdue events younger than this are fired on recovery. Zero disables catch-up.
    pub missed_event_catchup_secs: i64,

    // Price source
    pub price_api_url: String,
    pub price_symbol: String,
    pub price_fetch_max_tries: u32,
    pub price_backoff_base_ms: u64,
    pub price_backoff_max_ms: u64,
    pub price_timeout_secs: u64,

    // Settlement
    pub display_scale_factor: i64,
    pub rpc_url: String,
    pub contract_address: Option<String>,
    pub operator_address: Option<String>,
    pub receipt_poll_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_path: "predictpool.db".to_string(),

            epoch_duration_secs: 600,
            epoch_lock_secs: 60,
            epoch_calculating_grace_secs: 60,
            rounds_per_epoch: 10,
            round_lock_fraction: 0.5,
            round_calculating_grace_secs: 5,
            generation_horizon_secs: 36 * 3600,

            generator_interval_secs: 3600,
            refresh_interval_secs: 60,
            round_batch_limit: 100,
            missed_event_catchup_secs: 900,

            price_api_url: DEFAULT_PRICE_API_URL.to_string(),
            price_symbol: "ETHUSDT".to_string(),
            price_fetch_max_tries: 10,
            price_backoff_base_ms: 1_000,
            price_backoff_max_ms: 60_000,
            price_timeout_secs: 5,

            display_scale_factor: 10,
            rpc_url: "http://localhost:8545".to_string(),
            contract_address: None,
            operator_address: None,
            receipt_poll_attempts: 60,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let d = Self::default();

        Self {
            database_path: env_string("DATABASE_PATH")
                .or_else(|| env_string("DB_PATH"))
                .unwrap_or(d.database_path),

            epoch_duration_secs: env_parse("EPOCH_DURATION_SECS", d.epoch_duration_secs),
            epoch_lock_secs: env_parse("EPOCH_LOCK_SECS", d.epoch_lock_secs),
            epoch_calculating_grace_secs: env_parse(
                "EPOCH_CALCULATING_GRACE_SECS",
                d.epoch_calculating_grace_secs,
            ),
            rounds_per_epoch: env_parse("ROUNDS_PER_EPOCH", d.rounds_per_epoch),
            round_lock_fraction: env_parse("ROUND_LOCK_FRACTION", d.round_lock_fraction),
            round_calculating_grace_secs: env_parse(
                "ROUND_CALCULATING_GRACE_SECS",
                d.round_calculating_grace_secs,
            ),
            generation_horizon_secs: env_parse(
                "GENERATION_HORIZON_SECS",
                d.generation_horizon_secs,
            ),

            generator_interval_secs: env_parse(
                "GENERATOR_INTERVAL_SECS",
                d.generator_interval_secs,
            ),
            refresh_interval_secs: env_parse("REFRESH_INTERVAL_SECS", d.refresh_interval_secs),
            round_batch_limit: env_parse("ROUND_BATCH_LIMIT", d.round_batch_limit),
            missed_event_catchup_secs: env_parse(
                "MISSED_EVENT_CATCHUP_SECS",
                d.missed_event_catchup_secs,
            ),

            price_api_url: env_string("PRICE_API_URL").unwrap_or(d.price_api_url),
            price_symbol: env_string("PRICE_SYMBOL")
                .or_else(|| env_string("SYMBOL"))
                .unwrap_or(d.price_symbol),
            price_fetch_max_tries: env_parse("PRICE_FETCH_MAX_TRIES", d.price_fetch_max_tries),
            price_backoff_base_ms: env_parse("PRICE_BACKOFF_BASE_MS", d.price_backoff_base_ms),
            price_backoff_max_ms: env_parse("PRICE_BACKOFF_MAX_MS", d.price_backoff_max_ms),
            price_timeout_secs: env_parse("PRICE_TIMEOUT_SECS", d.price_timeout_secs),

            display_scale_factor: env_parse("DISPLAY_SCALE_FACTOR", d.display_scale_factor),
            rpc_url: env_string("RPC_URL").unwrap_or(d.rpc_url),
            contract_address: env_string("CONTRACT_ADDRESS"),
            operator_address: env_string("OPERATOR_ADDRESS"),
            receipt_poll_attempts: env_parse("RECEIPT_POLL_ATTEMPTS", d.receipt_poll_attempts),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.round_lock_fraction > 0.0 && self.round_lock_fraction < 1.0) {
            return Err(ConfigError::LockFraction(self.round_lock_fraction));
        }
        if self.rounds_per_epoch == 0 {
            return Err(ConfigError::NoRounds);
        }
        if self.epoch_duration_secs < i64::from(self.rounds_per_epoch) {
            return Err(ConfigError::EpochTooShort {
                epoch_secs: self.epoch_duration_secs,
                rounds: self.rounds_per_epoch,
            });
        }
        if self.generation_horizon_secs < self.epoch_duration_secs {
            return Err(ConfigError::HorizonTooShort {
                horizon_secs: self.generation_horizon_secs,
                epoch_secs: self.epoch_duration_secs,
            });
        }
        let locked_secs = self.round_duration_secs() - self.round_unlocked_secs();
        if self.round_calculating_grace_secs < 0 || self.round_calculating_grace_secs >= locked_secs
        {
            return Err(ConfigError::GraceTooLong {
                grace_secs: self.round_calculating_grace_secs,
                locked_secs,
            });
        }
        if self.epoch_lock_secs < 0 {
            return Err(ConfigError::NotPositive("epoch lock window"));
        }
        if self.epoch_calculating_grace_secs < 0 {
            return Err(ConfigError::NotPositive("epoch calculating grace"));
        }
        if self.epoch_lock_secs >= self.epoch_duration_secs {
            return Err(ConfigError::EpochLockTooLong {
                lock_secs: self.epoch_lock_secs,
                epoch_secs: self.epoch_duration_secs,
            });
        }
        if self.epoch_calculating_grace_secs >= self.epoch_duration_secs {
            return Err(ConfigError::EpochGraceTooLong {
                grace_secs: self.epoch_calculating_grace_secs,
                epoch_secs: self.epoch_duration_secs,
            });
        }
        if self.display_scale_factor <= 0 {
            return Err(ConfigError::NotPositive("display scale factor"));
        }
        if self.price_fetch_max_tries == 0 {
            return Err(ConfigError::NotPositive("price fetch retry bound"));
        }
        if self.generator_interval_secs == 0 || self.refresh_interval_secs == 0 {
            return Err(ConfigError::NotPositive("scheduler interval"));
        }
        Ok(())
    }

    pub fn epoch_duration(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.epoch_duration_secs)
    }

    pub fn round_duration_secs(&self) -> i64 {
        self.epoch_duration_secs / i64::from(self.rounds_per_epoch.max(1))
    }

    /// Seconds of a round during which predictions are open. Rounded to the whole second
    /// so fractions like 0.9 don't lose a second to float error.
    pub fn round_unlocked_secs(&self) -> i64 {
        (self.round_duration_secs() as f64 * (1.0 - self.round_lock_fraction)).round() as i64
    }

    /// Settlement periods in a year for the configured epoch length (52,560 for 10 minutes).
    pub fn periods_per_year(&self) -> f64 {
        SECONDS_PER_YEAR as f64 / self.epoch_duration_secs.max(1) as f64
    }

    pub fn generator_interval(&self) -> Duration {
        Duration::from_secs(self.generator_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
