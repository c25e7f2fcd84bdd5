//! Copy-trading configuration.

use std::time::Duration;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::Asset;

/// Converting the target's notional into ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Copy ratio for Bitcoin markets
    pub btc_ratio: Decimal,

    /// Copy ratio for Ethereum markets
    pub eth_ratio: Decimal,

    /// Copy ratio for Solana markets
    pub sol_ratio: Decimal,

    /// Copy ratio for everything else
    pub default_ratio: Decimal,

    /// Minimum trade size in USDC
    pub min_trade_amount: Decimal,

    /// Maximum trade size in USDC
    pub max_trade_amount: Decimal,

    /// Apply conviction/time multipliers on top of the asset ratio
    pub conviction_sizing: bool,

    /// Multiplier applied at full time urgency
    pub max_time_multiplier: Decimal,

    /// Extra factor for unconfirmed initial entries
    pub initial_entry_factor: Decimal,

    /// Extra factor for major scale-ins
    pub major_scale_factor: Decimal,

    /// Copy 100% of the target's notional (paper realism)
    pub full_mirror: bool,

    /// Weight BUYs by the target's allocation to that side (allocation x 2)
    pub apply_target_weight: bool,
}

impl SizingConfig {
    /// Copy ratio for a market's underlying.
    pub fn ratio_for(&self, asset: Asset) -> Decimal {
        match asset {
            Asset::Btc => self.btc_ratio,
            Asset::Eth => self.eth_ratio,
            Asset::Sol => self.sol_ratio,
            Asset::Unknown => self.default_ratio,
        }
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            btc_ratio: dec!(0.02),          // 2% of BTC trades
            eth_ratio: dec!(0.03),          // 3% of ETH trades
            sol_ratio: dec!(0.04),          // 4% of SOL trades
            default_ratio: dec!(0.03),
            min_trade_amount: dec!(1.0),    // Min $1
            max_trade_amount: dec!(25.0),   // Max $25
            conviction_sizing: true,
            max_time_multiplier: dec!(2.0), // Up to 2x in the final minutes
            initial_entry_factor: dec!(0.6),
            major_scale_factor: dec!(1.3),
            full_mirror: false,
            apply_target_weight: false,
        }
    }
}

/// Pre-trade filters on the target's fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Skip BUYs priced below this (near-certain losers)
    pub min_price: Decimal,

    /// Skip BUYs priced above this (near-certain winners)
    pub max_price: Decimal,

    /// Only copy if the target's notional is at least this
    pub min_target_notional: Decimal,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_price: dec!(0.15),
            max_price: dec!(0.85),
            min_target_notional: Decimal::ZERO,
        }
    }
}

/// Hedge tracking and dominant-side policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Hedge ratio the target must reach before hedges are copied
    pub target_hedge_ratio: Decimal,

    /// Allocation at or above which a side is dominant
    pub min_dominance: Decimal,

    /// Below this many total shares every side counts as dominant
    pub min_shares_for_dominance: Decimal,

    /// Single-trade multiple of the first entry that counts as a major scale
    pub major_scale_threshold: Decimal,

    /// How long a fetched target position stays fresh
    pub position_ttl: Duration,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            target_hedge_ratio: dec!(0.25),
            min_dominance: dec!(0.55),
            min_shares_for_dominance: dec!(10),
            major_scale_threshold: dec!(3.0),
            position_ttl: Duration::from_secs(30),
        }
    }
}

/// Slippage budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageConfig {
    /// Max slippage in price units (0.03 = 3 cents)
    pub max_absolute: Decimal,

    /// Max slippage as a fraction of the target price
    pub max_percent: Decimal,

    /// Use the absolute cap instead of the percentage cap
    pub use_absolute: bool,

    /// Book prices at/above this (or at/below 1 - this) are treated as resolved
    pub resolution_threshold: Decimal,

    /// Buffer around the target's price for live limit orders
    pub limit_buffer: Decimal,

    /// Number of evaluations kept for statistics
    pub history_len: usize,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            max_absolute: dec!(0.03),
            max_percent: dec!(0.04),
            use_absolute: true,
            resolution_threshold: dec!(0.90),
            limit_buffer: dec!(0.03),
            history_len: 100,
        }
    }
}

/// Order placement and account guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// How long a resting GTC order may sit before it is cancelled
    pub stale_order_timeout: Duration,

    /// Submission freeze after an edge block
    pub block_cooldown: Duration,

    /// How long a fetched balance stays fresh
    pub balance_ttl: Duration,

    /// Warn when collateral falls below this
    pub low_balance_warning: Decimal,

    /// Venue minimum order size in shares
    pub min_shares: Decimal,

    /// Venue minimum order notional
    pub min_order_notional: Decimal,

    /// Require this multiple of the order size in free balance
    pub hedge_reserve_multiplier: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stale_order_timeout: Duration::from_secs(2),
            block_cooldown: Duration::from_secs(15 * 60), // 15 minutes
            balance_ttl: Duration::from_secs(5),
            low_balance_warning: dec!(50),
            min_shares: dec!(5),
            min_order_notional: dec!(1.01),
            hedge_reserve_multiplier: dec!(2),
        }
    }
}

/// Paper-trading simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Starting USDC balance
    pub initial_balance: Decimal,

    /// Add delay, random partial fills and rejections
    pub simulate_market: bool,

    pub min_delay: Duration,
    pub max_delay: Duration,

    /// Probability an order is rejected outright
    pub reject_probability: f64,

    /// Probability of a partial fill on small orders
    pub partial_probability: f64,

    /// Probability of a partial fill at or above `large_order_notional`
    pub large_partial_probability: f64,

    pub large_order_notional: Decimal,

    /// Fill fraction range for partial fills
    pub min_fill_fraction: f64,
    pub max_fill_fraction: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(1000),
            simulate_market: false,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            reject_probability: 0.02,      // 2% rejections
            partial_probability: 0.05,     // 5% partial fills
            large_partial_probability: 0.10,
            large_order_notional: dec!(25),
            min_fill_fraction: 0.6,
            max_fill_fraction: 0.9,
        }
    }
}

/// Poll loop cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub poll_interval: Duration,

    /// Wall time between status events
    pub status_interval: Duration,

    /// Grace period for a graceful stop before the loop is aborted
    pub stop_timeout: Duration,

    /// Activity rows fetched per poll
    pub fetch_limit: u32,

    /// Pause after a failed poll iteration
    pub error_pause: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            fetch_limit: 25,
            error_pause: Duration::from_secs(1),
        }
    }
}

/// Exchange credentials for live trading.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub private_key: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.private_key.is_empty()
            && !self.api_key.is_empty()
            && !self.api_secret.is_empty()
            && !self.api_passphrase.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key", &"****")
            .field("api_key", &mask(&self.api_key))
            .field("complete", &self.is_complete())
            .finish()
    }
}

fn mask(value: &str) -> String {
    if value.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", value.chars().take(4).collect::<String>())
    }
}

/// Everything a mirroring session needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Wallet address of the monitored trader
    pub target_wallet: String,

    /// Paper trading when true
    pub dry_run: bool,

    pub credentials: Credentials,
    pub sizing: SizingConfig,
    pub filters: FilterConfig,
    pub hedge: HedgeConfig,
    pub slippage: SlippageConfig,
    pub execution: ExecutionConfig,
    pub paper: PaperConfig,
    pub session: SessionConfig,
}

/// Check for `0x` followed by 40 hex characters.
pub fn is_valid_address(address: &str) -> bool {
    let address = address.trim();
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

impl MirrorConfig {
    /// Validate what a session needs before it may start.
    pub fn validate(&self) -> Result<()> {
        if self.target_wallet.trim().is_empty() {
            bail!("Target wallet is not configured");
        }
        if !is_valid_address(&self.target_wallet) {
            bail!(
                "Target wallet must be a 42-char hex address like 0x... (got {})",
                self.target_wallet
            );
        }
        if !self.dry_run && !self.credentials.is_complete() {
            bail!("Live trading requires private key and API credentials");
        }
        if self.sizing.min_trade_amount > self.sizing.max_trade_amount {
            bail!(
                "min_trade_amount {} exceeds max_trade_amount {}",
                self.sizing.min_trade_amount,
                self.sizing.max_trade_amount
            );
        }
        if self.filters.min_price >= self.filters.max_price {
            bail!("Price filter range is empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0x1234567890abcdef1234567890abcdef12345678";

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(WALLET));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("1234567890abcdef1234567890abcdef1234567890"));
        assert!(!is_valid_address("0xZZ34567890abcdef1234567890abcdef12345678"));
    }

    #[test]
    fn test_validate_requires_target() {
        let config = MirrorConfig {
            dry_run: true,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Target wallet"));
    }

    #[test]
    fn test_validate_live_requires_credentials() {
        let mut config = MirrorConfig {
            target_wallet: WALLET.to_string(),
            dry_run: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.dry_run = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ratio_for_asset() {
        let sizing = SizingConfig::default();
        assert_eq!(sizing.ratio_for(Asset::Btc), dec!(0.02));
        assert_eq!(sizing.ratio_for(Asset::Sol), dec!(0.04));
        assert_eq!(sizing.ratio_for(Asset::Unknown), dec!(0.03));
    }

    #[test]
    fn test_credentials_debug_is_masked() {
        let creds = Credentials {
            private_key: "deadbeef".to_string(),
            api_key: "abcdefgh".to_string(),
            api_secret: "s".to_string(),
            api_passphrase: "p".to_string(),
        };
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("deadbeef"));
        assert!(shown.contains("abcd****"));
    }
}
