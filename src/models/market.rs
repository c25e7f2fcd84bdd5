//! Market metadata helpers: underlying asset detection and close-time estimation.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Crypto underlyings with dedicated copy ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
    Sol,
    Unknown,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Sol => "SOL",
            Asset::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
}

/// Detect the underlying from a market title or slug.
///
/// "Bitcoin Up or Down - January 7, 9:15PM-9:30PM ET" -> `Asset::Btc`.
pub fn classify_market(text: &str) -> Asset {
    for word in words(text) {
        match word.as_str() {
            "bitcoin" | "btc" => return Asset::Btc,
            "ethereum" | "eth" => return Asset::Eth,
            "solana" | "sol" => return Asset::Sol,
            _ => {}
        }
    }
    Asset::Unknown
}

/// Group key for a market: the slug when present, else a lowercase title.
pub fn normalize_slug(slug: &str, title: &str) -> String {
    if !slug.trim().is_empty() {
        return slug.trim().to_ascii_lowercase();
    }
    let joined: Vec<String> = words(title).collect();
    if joined.is_empty() {
        "unknown".to_string()
    } else {
        joined.join("-")
    }
}

fn parse_window(token: &str) -> Option<Duration> {
    let (digits, unit) = token.split_at(token.len().checked_sub(1)?);
    let n: i64 = digits.parse().ok()?;
    match unit {
        "m" => Some(Duration::minutes(n)),
        "h" => Some(Duration::hours(n)),
        _ => None,
    }
}

/// Window of a recurring up/down market, parsed from slugs such as
/// `btc-updown-15m-1731000000` (window length, then window start epoch).
pub fn market_window(slug: &str) -> Option<(DateTime<Utc>, Duration)> {
    let tokens: Vec<String> = words(slug).collect();
    let length = tokens.iter().find_map(|t| parse_window(t))?;
    let start = tokens
        .iter()
        .rev()
        .find_map(|t| t.parse::<i64>().ok().filter(|n| *n > 1_000_000_000))?;
    let start = Utc.timestamp_opt(start, 0).single()?;
    Some((start, length))
}

/// Proximity to market close in [0, 1], or `None` when the close time
/// cannot be derived from the slug.
pub fn time_urgency(slug: &str, at: DateTime<Utc>) -> Option<f64> {
    let (start, length) = market_window(slug)?;
    let total = length.num_seconds();
    if total <= 0 {
        return None;
    }
    let elapsed = (at - start).num_seconds();
    Some((elapsed as f64 / total as f64).clamp(0.0, 1.0))
}
