//! Per-user reward and APY estimate for the current vault epoch
//!
//! All amounts stay in `BigUint` with floor division; only the APY figures, which are
//! ratios, are converted to `f64` at the end.

use super::sink::SettlementSink;
use crate::{
    models::{normalize_address, UserStatsSummary},
    store::PoolDb,
};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("display scale factor must be a positive integer, got {0}")]
    InvalidScaleFactor(i64),
    #[error("settlement sink unavailable: {0:#}")]
    Sink(anyhow::Error),
    #[error("store read failed: {0:#}")]
    Store(anyhow::Error),
}

fn as_decimal<S: Serializer>(v: &BigUint, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(v)
}

/// One user's on-chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPosition {
    pub address: String,
    pub balance: BigUint,
    pub weight: BigUint,
}

/// Vault-wide figures plus every user's position, fetched once per pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardInputs {
    pub total_vault_value: BigUint,
    pub epoch_baseline: BigUint,
    pub epoch_total_supply: BigUint,
    pub users: Vec<UserPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserReward {
    #[serde(serialize_with = "as_decimal")]
    pub deposited: BigUint,
    #[serde(serialize_with = "as_decimal")]
    pub rewards: BigUint,
    pub apy: f64,
    pub annualized_apy: f64,
    pub display_apy: f64,
    #[serde(serialize_with = "as_decimal")]
    pub epoch_rewards: BigUint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<UserStatsSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardReport {
    /// Latest completed epoch whose stats were attached, if any.
    pub epoch_id: Option<i64>,
    #[serde(serialize_with = "as_decimal")]
    pub epoch_rewards: BigUint,
    pub users: BTreeMap<String, UserReward>,
}

fn deposited(balance: &BigUint, baseline: &BigUint, total_supply: &BigUint) -> BigUint {
    if balance.is_zero() || total_supply.is_zero() {
        return BigUint::zero();
    }
    balance * baseline / total_supply
}

fn ratio(num: &BigUint, den: &BigUint) -> f64 {
    match (num.to_f64(), den.to_f64()) {
        (Some(n), Some(d)) if d > 0.0 => n / d,
        _ => 0.0,
    }
}

/// Pure reward computation over already-fetched inputs.
///
/// `periods_per_year` annualises a single epoch's APY; the display figure multiplies
/// that by `display_scale_factor`, which must be positive.
pub fn compute_rewards(
    inputs: &RewardInputs,
    display_scale_factor: i64,
    periods_per_year: f64,
) -> Result<RewardReport, SettlementError> {
    if display_scale_factor <= 0 {
        return Err(SettlementError::InvalidScaleFactor(display_scale_factor));
    }

    let epoch_rewards = if inputs.total_vault_value > inputs.epoch_baseline {
        &inputs.total_vault_value - &inputs.epoch_baseline
    } else {
        BigUint::zero()
    };

    let deposits: Vec<BigUint> = inputs
        .users
        .iter()
        .map(|u| {
            deposited(
                &u.balance,
                &inputs.epoch_baseline,
                &inputs.epoch_total_supply,
            )
        })
        .collect();

    let denominator: BigUint = inputs
        .users
        .iter()
        .zip(&deposits)
        .map(|(u, d)| &u.weight * d)
        .sum();

    let mut users = BTreeMap::new();
    for (user, deposited) in inputs.users.iter().zip(deposits) {
        let rewards = if epoch_rewards.is_zero() || denominator.is_zero() {
            BigUint::zero()
        } else {
            &epoch_rewards * &user.weight * &deposited / &denominator
        };
        let apy = if deposited.is_zero() {
            0.0
        } else {
            100.0 * ratio(&rewards, &deposited)
        };
        let annualized_apy = apy * periods_per_year;
        let display_apy = annualized_apy * display_scale_factor as f64;

        users.insert(
            user.address.clone(),
            UserReward {
                deposited,
                rewards,
                apy,
                annualized_apy,
                display_apy,
                epoch_rewards: epoch_rewards.clone(),
                stats: None,
            },
        );
    }

    Ok(RewardReport {
        epoch_id: None,
        epoch_rewards,
        users,
    })
}

/// Fetches every input from the sink. Balance and weight are read once per user.
pub async fn collect_inputs(sink: &dyn SettlementSink) -> anyhow::Result<RewardInputs> {
    let total_vault_value = sink.get_total_vault_value().await?;
    let epoch_baseline = sink.get_epoch_baseline().await?;
    let epoch_total_supply = sink.get_epoch_total_supply().await?;

    let addresses = sink.get_eligible_users().await?;
    let mut users = Vec::with_capacity(addresses.len());
    for address in addresses {
        let balance = sink.get_user_balance(&address).await?;
        let weight = sink.get_user_weight(&address).await?;
        users.push(UserPosition {
            address: normalize_address(&address),
            balance,
            weight,
        });
    }

    Ok(RewardInputs {
        total_vault_value,
        epoch_baseline,
        epoch_total_supply,
        users,
    })
}

/// Full reward pass: sink reads, computation, then stats from the latest completed epoch.
pub async fn reward_report(
    sink: &dyn SettlementSink,
    db: &PoolDb,
    display_scale_factor: i64,
    periods_per_year: f64,
) -> Result<RewardReport, SettlementError> {
    if display_scale_factor <= 0 {
        return Err(SettlementError::InvalidScaleFactor(display_scale_factor));
    }

    let inputs = collect_inputs(sink).await.map_err(SettlementError::Sink)?;
    if inputs.epoch_total_supply.is_zero() {
        warn!("epoch total supply is zero, deposits count as zero");
    }
    let mut report = compute_rewards(&inputs, display_scale_factor, periods_per_year)?;

    let latest = db.latest_completed_epoch().map_err(SettlementError::Store)?;
    if let Some(epoch) = latest {
        report.epoch_id = Some(epoch.id);
        for (address, reward) in report.users.iter_mut() {
            reward.stats = db
                .user_stats(address, epoch.id)
                .map_err(SettlementError::Store)?
                .as_ref()
                .map(UserStatsSummary::from);
        }
    }

    info!(
        users = report.users.len(),
        epoch_rewards = %report.epoch_rewards,
        "reward pass complete"
    );
    Ok(report)
}
