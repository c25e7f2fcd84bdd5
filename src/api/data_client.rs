//! Polymarket Data API client: the monitored trader's activity and positions.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{Activity, ActivityEvent, MarketPosition, Side};

use super::error::ApiError;
use super::retry::RetryPolicy;
use super::types::*;

const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where new activity for the monitored account comes from.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Most recent activity, newest first as the API returns it.
    async fn fetch_recent_activity(&self, account: &str, limit: u32) -> Result<Vec<Activity>, ApiError>;
}

/// Live view of the monitored trader's holdings in one market.
#[async_trait]
pub trait TargetPositionSource: Send + Sync {
    /// Outcome shares held by `account` in `market_id`; `None` when flat.
    async fn fetch_market_position(
        &self,
        account: &str,
        market_id: &str,
    ) -> Result<Option<MarketPosition>, ApiError>;
}

/// Client for Polymarket Data API (read-only operations).
pub struct DataClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl DataClient {
    /// Create a new data client with default settings.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(DATA_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        debug!(url = %url, "GET");
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Other(anyhow::anyhow!("Failed to parse response from {}: {}", url, e)))
    }

    /// Fetch raw activity rows.
    pub async fn get_activity(&self, address: &str, limit: u32) -> Result<Vec<ActivityResponse>, ApiError> {
        let url = format!(
            "{}/activity?user={}&limit={}",
            self.base_url,
            address,
            limit.min(500)
        );
        self.retry.run("activity", || self.get_json(&url)).await
    }

    /// Fetch raw position rows for one market.
    pub async fn get_positions(
        &self,
        address: &str,
        market_id: &str,
    ) -> Result<Vec<PositionResponse>, ApiError> {
        let url = format!(
            "{}/positions?user={}&market={}&sizeThreshold=0",
            self.base_url, address, market_id
        );
        self.retry.run("positions", || self.get_json(&url)).await
    }
}

#[async_trait]
impl ActivitySource for DataClient {
    async fn fetch_recent_activity(&self, account: &str, limit: u32) -> Result<Vec<Activity>, ApiError> {
        let rows = self.get_activity(account, limit).await?;
        Ok(rows.into_iter().map(decode_activity).collect())
    }
}

#[async_trait]
impl TargetPositionSource for DataClient {
    async fn fetch_market_position(
        &self,
        account: &str,
        market_id: &str,
    ) -> Result<Option<MarketPosition>, ApiError> {
        let rows = self.get_positions(account, market_id).await?;
        Ok(fold_positions(market_id, &rows))
    }
}

/// Collapse per-outcome rows into one [`MarketPosition`].
pub fn fold_positions(market_id: &str, rows: &[PositionResponse]) -> Option<MarketPosition> {
    let mut position = MarketPosition::default();
    for row in rows.iter().filter(|r| r.condition_id == market_id) {
        let index = match row.outcome_index {
            0 => 0,
            1 => 1,
            other => {
                warn!(market = %market_id, outcome_index = other, "Ignoring non-binary outcome");
                continue;
            }
        };
        let cost = if row.initial_value.is_zero() {
            row.size * row.avg_price
        } else {
            row.initial_value
        };
        position.apply_buy(index, row.size, cost);
    }
    if position.is_empty() {
        None
    } else {
        Some(position)
    }
}

/// Decode one API row into a typed activity.
pub fn decode_activity(row: ActivityResponse) -> Activity {
    let id = Some(row.transaction_hash.trim().to_string()).filter(|h| !h.is_empty());
    let occurred_at = Utc
        .timestamp_opt(row.timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now);

    match row.activity_type.to_uppercase().as_str() {
        "TRADE" => match decode_trade(&row, id.clone(), occurred_at) {
            Some(event) => Activity::Trade(event),
            None => {
                warn!(
                    tx = ?id,
                    side = %row.side,
                    price = %row.price,
                    outcome_index = ?row.outcome_index,
                    "Malformed trade row"
                );
                Activity::Unknown {
                    id,
                    occurred_at,
                    kind: "TRADE(malformed)".to_string(),
                }
            }
        },
        "REDEEM" => Activity::Redeem {
            id,
            occurred_at,
            market_id: row.condition_id,
            usdc_amount: row.usdc_size,
        },
        "SPLIT" | "MERGE" | "CONVERSION" | "TRANSFER" => Activity::Transfer {
            id,
            occurred_at,
            market_id: row.condition_id,
        },
        other => Activity::Unknown {
            id,
            occurred_at,
            kind: other.to_string(),
        },
    }
}

fn decode_trade(
    row: &ActivityResponse,
    id: Option<String>,
    occurred_at: chrono::DateTime<Utc>,
) -> Option<ActivityEvent> {
    let side = Side::parse(&row.side)?;
    let outcome_index = match row.outcome_index? {
        0 => 0,
        1 => 1,
        _ => return None,
    };
    if row.price <= Decimal::ZERO || row.price >= Decimal::ONE || row.condition_id.is_empty() {
        return None;
    }
    let notional = if row.usdc_size.is_zero() {
        row.size * row.price
    } else {
        row.usdc_size
    };

    Some(ActivityEvent {
        id,
        occurred_at,
        market_id: row.condition_id.clone(),
        market_title: row.title.clone(),
        market_slug: row.slug.clone(),
        token_id: row.asset.clone(),
        outcome_index,
        outcome_label: row.outcome.clone(),
        side,
        price: row.price,
        notional,
        shares: row.size,
    })
}
