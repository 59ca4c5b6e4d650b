//! Vault contract over plain Ethereum JSON-RPC
//!
//! Reads go through `eth_call`. The weight push is an `eth_sendTransaction` from a
//! node-managed operator account, followed by receipt polling.

use super::{abi, sink::SettlementSink};
use crate::config::PoolConfig;
use anyhow::{anyhow, Context, Result};
use num_bigint::BigUint;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::time::sleep;
use tracing::{error, info, warn};

const GET_USERS: &str = "getUsers()";
const BALANCE_OF: &str = "balanceOf(address)";
const USER_WEIGHTS: &str = "userWeights(address)";
const EPOCH_BASELINE: &str = "epochBaseline()";
const EPOCH_TOTAL_SUPPLY: &str = "epochTotalSupply()";
const TOTAL_VAULT_VALUE: &str = "totalMON()";
const BATCH_UPDATE_WEIGHTS: &str = "batchUpdateUserWeights(address[],uint256[])";

/// Gas limit for the weight batch (0x1e8480 = 2,000,000).
const WEIGHT_PUSH_GAS: &str = "0x1e8480";

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: Option<i64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

pub struct RpcSettlementSink {
    http: Client,
    rpc_url: String,
    contract: String,
    operator: Option<String>,
    receipt_poll_attempts: u32,
    receipt_poll_interval: Duration,
    next_id: AtomicU64,
}

impl RpcSettlementSink {
    pub fn new(cfg: &PoolConfig) -> Result<Self> {
        let contract = cfg
            .contract_address
            .clone()
            .ok_or_else(|| anyhow!("CONTRACT_ADDRESS is not set"))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build RPC HTTP client")?;
        Ok(Self {
            http,
            rpc_url: cfg.rpc_url.clone(),
            contract,
            operator: cfg.operator_address.clone(),
            receipt_poll_attempts: cfg.receipt_poll_attempts.max(1),
            receipt_poll_interval: Duration::from_secs(2),
            next_id: AtomicU64::new(1),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;

        if !resp.status().is_success() {
            return Err(anyhow!("{method} returned HTTP {}", resp.status()));
        }

        let rpc: RpcResponse = resp
            .json()
            .await
            .with_context(|| format!("{method} response is not JSON-RPC"))?;

        if let Some(err) = rpc.error {
            return Err(anyhow!(
                "{method} failed: {} (code {})",
                err.message.unwrap_or_default(),
                err.code.unwrap_or_default()
            ));
        }
        Ok(rpc.result.unwrap_or(Value::Null))
    }

    async fn eth_call(&self, data: String) -> Result<String> {
        let result = self
            .rpc(
                "eth_call",
                json!([{ "to": self.contract, "data": data }, "latest"]),
            )
            .await?;
        result
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("eth_call returned {result}"))
    }

    async fn call_uint(&self, signature: &str) -> Result<BigUint> {
        let raw = self.eth_call(abi::encode_call(signature)).await?;
        abi::decode_uint(&raw).with_context(|| format!("decoding {signature}"))
    }

    async fn call_uint_for(&self, signature: &str, user: &str) -> Result<BigUint> {
        let raw = self
            .eth_call(abi::encode_address_call(signature, user)?)
            .await?;
        abi::decode_uint(&raw).with_context(|| format!("decoding {signature} for {user}"))
    }

    /// Polls until the receipt exists; `Ok(true)` only for status `0x1`.
    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<bool> {
        for _ in 0..self.receipt_poll_attempts {
            let receipt = self
                .rpc("eth_getTransactionReceipt", json!([tx_hash]))
                .await?;
            if !receipt.is_null() {
                let status = receipt.get("status").and_then(Value::as_str).unwrap_or("");
                return Ok(status == "0x1");
            }
            sleep(self.receipt_poll_interval).await;
        }
        Err(anyhow!(
            "no receipt for {tx_hash} after {} polls",
            self.receipt_poll_attempts
        ))
    }

    async fn push_weights(&self, users: &[String], weights: &[u64]) -> Result<bool> {
        let operator = self
            .operator
            .as_deref()
            .ok_or_else(|| anyhow!("OPERATOR_ADDRESS is not set"))?;
        let data = abi::encode_batch_update(BATCH_UPDATE_WEIGHTS, users, weights)?;

        let tx = json!({
            "from": operator,
            "to": self.contract,
            "data": data,
            "gas": WEIGHT_PUSH_GAS,
        });
        let hash = self.rpc("eth_sendTransaction", json!([tx])).await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| anyhow!("eth_sendTransaction returned {hash}"))?
            .to_owned();
        info!("⛓️  Weight batch submitted: {} ({} users)", hash, users.len());

        self.wait_for_receipt(&hash).await
    }
}

#[async_trait::async_trait]
impl SettlementSink for RpcSettlementSink {
    async fn get_eligible_users(&self) -> Result<Vec<String>> {
        let raw = self.eth_call(abi::encode_call(GET_USERS)).await?;
        abi::decode_address_array(&raw).context("decoding getUsers()")
    }

    async fn get_user_balance(&self, user: &str) -> Result<BigUint> {
        self.call_uint_for(BALANCE_OF, user).await
    }

    async fn get_user_weight(&self, user: &str) -> Result<BigUint> {
        self.call_uint_for(USER_WEIGHTS, user).await
    }

    async fn get_epoch_baseline(&self) -> Result<BigUint> {
        self.call_uint(EPOCH_BASELINE).await
    }

    async fn get_epoch_total_supply(&self) -> Result<BigUint> {
        self.call_uint(EPOCH_TOTAL_SUPPLY).await
    }

    async fn get_total_vault_value(&self) -> Result<BigUint> {
        self.call_uint(TOTAL_VAULT_VALUE).await
    }

    async fn update_user_weights(&self, users: &[String], weights: &[u64]) -> bool {
        match self.push_weights(users, weights).await {
            Ok(true) => {
                info!("✅ Weights updated on contract for {} users", users.len());
                true
            }
            Ok(false) => {
                warn!("Weight batch transaction reverted");
                false
            }
            Err(e) => {
                error!("Failed to update weights on contract: {:#}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_contract_address() {
        let cfg = PoolConfig::default();
        assert!(RpcSettlementSink::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_push_without_operator_reports_failure() {
        let cfg = PoolConfig {
            contract_address: Some("0x1111111111111111111111111111111111111111".into()),
            rpc_url: "http://127.0.0.1:9".into(),
            ..PoolConfig::default()
        };
        let sink = RpcSettlementSink::new(&cfg).unwrap();
        assert!(
            !sink
                .update_user_weights(&["0x2222222222222222222222222222222222222222".into()], &[100])
                .await
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_is_an_error() {
        let cfg = PoolConfig {
            contract_address: Some("0x1111111111111111111111111111111111111111".into()),
            rpc_url: "http://127.0.0.1:9".into(),
            ..PoolConfig::default()
        };
        let sink = RpcSettlementSink::new(&cfg).unwrap();
        assert!(sink.get_epoch_baseline().await.is_err());
    }
}
