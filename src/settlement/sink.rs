use anyhow::Result;
use num_bigint::BigUint;

/// External system that consumes weights and exposes vault balances.
///
/// Reads return raw on-chain integers. `update_user_weights` reports success as a bool
/// because a failed push is logged and tolerated, never retried.
#[async_trait::async_trait]
pub trait SettlementSink: Send + Sync {
    async fn get_eligible_users(&self) -> Result<Vec<String>>;

    async fn get_user_balance(&self, user: &str) -> Result<BigUint>;

    async fn get_user_weight(&self, user: &str) -> Result<BigUint>;

    async fn get_epoch_baseline(&self) -> Result<BigUint>;

    async fn get_epoch_total_supply(&self) -> Result<BigUint>;

    async fn get_total_vault_value(&self) -> Result<BigUint>;

    async fn update_user_weights(&self, users: &[String], weights: &[u64]) -> bool;
}
