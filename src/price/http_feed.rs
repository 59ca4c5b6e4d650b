//! HTTP spot price feed (Binance-style `ticker/price` endpoint)

use super::{Backoff, PriceSource};
use crate::config::PoolConfig;
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: Value,
}

/// Accepts `{"price": "2012.55"}` as well as a bare number.
pub fn parse_ticker(body: &str) -> Result<f64> {
    let ticker: TickerResponse =
        serde_json::from_str(body).context("price response is not a ticker object")?;
    let price = match &ticker.price {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("unparseable price {s:?}"))?,
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| anyhow!("price {n} is not representable"))?,
        other => return Err(anyhow!("unexpected price value {other}")),
    };
    if !price.is_finite() || price <= 0.0 {
        return Err(anyhow!("price must be positive, got {price}"));
    }
    Ok(price)
}

pub struct HttpPriceSource {
    client: Client,
    url: String,
    max_tries: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    request_timeout: Duration,
}

impl HttpPriceSource {
    pub fn new(cfg: &PoolConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.price_timeout_secs.max(1)))
            .build()
            .context("Failed to build price HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}{}", cfg.price_api_url, cfg.price_symbol),
            max_tries: cfg.price_fetch_max_tries.max(1),
            backoff_base_ms: cfg.price_backoff_base_ms,
            backoff_max_ms: cfg.price_backoff_max_ms,
            request_timeout: Duration::from_secs(cfg.price_timeout_secs.max(1)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_once(&self) -> Result<f64> {
        let response = timeout(self.request_timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| anyhow!("price request timed out"))?
            .context("price request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("price API returned {status}"));
        }
        let body = response.text().await.context("price body unreadable")?;
        parse_ticker(&body)
    }
}

#[async_trait::async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch_price(&self) -> Result<f64> {
        let mut backoff = Backoff::new(self.backoff_base_ms, self.backoff_max_ms);
        let mut last_err = anyhow!("price fetch never attempted");

        for attempt in 1..=self.max_tries {
            match self.fetch_once().await {
                Ok(price) => {
                    debug!(price, attempt, "price fetched");
                    return Ok(price);
                }
                Err(e) => {
                    if attempt < self.max_tries {
                        let wait = backoff.next_backoff();
                        warn!(
                            "Price fetch failed (attempt {}/{}): {:#}; retrying in {:?}",
                            attempt, self.max_tries, e, wait
                        );
                        sleep(wait).await;
                    } else {
                        warn!(
                            "Price fetch failed (attempt {}/{}): {:#}",
                            attempt, self.max_tries, e
                        );
                    }
                    last_err = e;
                }
            }
        }

        Err(last_err.context(format!(
            "price unavailable after {} attempts from {}",
            self.max_tries, self.url
        )))
    }
}
