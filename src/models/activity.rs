//! Activity records observed on the monitored trader's account.
//!
//! Raw API rows are decoded once at the boundary into [`Activity`]; only the
//! `Trade` variant carries an [`ActivityEvent`] that flows through the copy
//! pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// Parse the API's side string (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed trade by the monitored trader. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Transaction hash; `None` when the source row was malformed
    pub id: Option<String>,

    /// When the trade happened on-chain
    pub occurred_at: DateTime<Utc>,

    /// Market condition ID
    pub market_id: String,

    /// Human-readable market title
    #[serde(default)]
    pub market_title: String,

    /// Market slug (used for asset and close-time detection)
    #[serde(default)]
    pub market_slug: String,

    /// Outcome token ID (the tradable asset)
    pub token_id: String,

    /// 0 or 1 for binary markets
    pub outcome_index: usize,

    /// Outcome label ("Up", "No", ...)
    #[serde(default)]
    pub outcome_label: String,

    pub side: Side,

    /// Fill price as a fraction of a dollar, strictly within (0, 1)
    pub price: Decimal,

    /// USDC notional of the trade
    pub notional: Decimal,

    /// Number of outcome shares traded
    pub shares: Decimal,
}

impl ActivityEvent {
    /// Best-effort identity, stable across polls.
    ///
    /// Falls back to a composite of time, market, outcome and side when the
    /// transaction hash is missing.
    pub fn identity(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!(
                "{}_{}_{}_{}",
                self.occurred_at.timestamp(),
                self.market_id,
                self.outcome_index,
                self.side.as_str()
            ),
        }
    }

    /// Title truncated for log lines.
    pub fn short_title(&self, max_len: usize) -> String {
        if self.market_title.chars().count() <= max_len {
            self.market_title.clone()
        } else {
            let cut: String = self.market_title.chars().take(max_len.saturating_sub(3)).collect();
            format!("{}...", cut)
        }
    }
}

/// Decoded activity row.
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    /// A BUY or SELL fill
    Trade(ActivityEvent),

    /// Redemption of a resolved market
    Redeem {
        id: Option<String>,
        occurred_at: DateTime<Utc>,
        market_id: String,
        usdc_amount: Decimal,
    },

    /// Split, merge, conversion or plain token transfer
    Transfer {
        id: Option<String>,
        occurred_at: DateTime<Utc>,
        market_id: String,
    },

    /// Anything else; processed as a no-op
    Unknown {
        id: Option<String>,
        occurred_at: DateTime<Utc>,
        kind: String,
    },
}

impl Activity {
    /// Source identity, if the row carried one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Activity::Trade(ev) => ev.id.as_deref(),
            Activity::Redeem { id, .. }
            | Activity::Transfer { id, .. }
            | Activity::Unknown { id, .. } => id.as_deref(),
        }
    }

    /// Identity used for deduplication: the source id, or a composite of
    /// time, market and kind when the row had none.
    pub fn identity(&self) -> String {
        match self {
            Activity::Trade(ev) => ev.identity(),
            Activity::Redeem { id: Some(id), .. }
            | Activity::Transfer { id: Some(id), .. }
            | Activity::Unknown { id: Some(id), .. } => id.clone(),
            Activity::Redeem { market_id, .. } | Activity::Transfer { market_id, .. } => {
                format!("{}_{}_{}", self.occurred_at().timestamp(), market_id, self.kind())
            }
            Activity::Unknown { kind, .. } => {
                format!("{}_{}", self.occurred_at().timestamp(), kind)
            }
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Activity::Trade(ev) => ev.occurred_at,
            Activity::Redeem { occurred_at, .. }
            | Activity::Transfer { occurred_at, .. }
            | Activity::Unknown { occurred_at, .. } => *occurred_at,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Activity::Trade(_) => "TRADE",
            Activity::Redeem { .. } => "REDEEM",
            Activity::Transfer { .. } => "TRANSFER",
            Activity::Unknown { kind, .. } => kind,
        }
    }
}
