//! API response types for the Polymarket Data and CLOB APIs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Activity row from the /activity endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub proxy_wallet: String,
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub usdc_size: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub outcome_index: Option<i64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
}

/// Position row from the /positions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    #[serde(default)]
    pub proxy_wallet: String,
    pub condition_id: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub outcome_index: i64,
    pub size: Decimal,
    #[serde(default)]
    pub avg_price: Decimal,
    #[serde(default)]
    pub initial_value: Decimal,
    #[serde(default)]
    pub cur_price: Decimal,
}

/// Order book entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Order book snapshot for one outcome token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Highest bid (the CLOB does not guarantee level ordering).
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|l| l.price).max()
    }

    /// Lowest ask.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|l| l.price).min()
    }
}

/// Collateral balance from /balance-allowance.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    /// USDC in base units (6 decimals)
    pub balance: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decode_activity_row() {
        let raw = r#"{
            "type": "TRADE",
            "proxyWallet": "0xabc",
            "conditionId": "0xmarket",
            "size": "100",
            "usdcSize": "40",
            "price": "0.4",
            "timestamp": 1700000000,
            "transactionHash": "0xhash",
            "asset": "123",
            "side": "BUY",
            "outcome": "Up",
            "outcomeIndex": 0,
            "title": "Bitcoin Up or Down",
            "slug": "btc-updown-15m-1700000000"
        }"#;
        let row: ActivityResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(row.activity_type, "TRADE");
        assert_eq!(row.usdc_size, dec!(40));
        assert_eq!(row.outcome_index, Some(0));
    }

    #[test]
    fn test_book_best_prices_ignore_ordering() {
        let raw = r#"{
            "bids": [{"price": "0.38", "size": "10"}, {"price": "0.41", "size": "5"}],
            "asks": [{"price": "0.47", "size": "10"}, {"price": "0.43", "size": "5"}]
        }"#;
        let book: OrderBook = serde_json::from_str(raw).unwrap();
        assert_eq!(book.best_bid(), Some(dec!(0.41)));
        assert_eq!(book.best_ask(), Some(dec!(0.43)));
    }
}
