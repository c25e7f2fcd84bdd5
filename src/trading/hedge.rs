//! Hedge-copy policy and dominant-side veto.
//!
//! The target often buys both outcomes of a market. Hedges are only copied
//! once the target is clearly hedging, and BUYs on the target's minority side
//! are vetoed. Both checks prefer the target's live positions from the data
//! API (cached) and fall back to the incrementally tracked ledger state.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::TargetPositionSource;
use crate::cache::TtlCache;
use crate::models::MarketPosition;

use super::config::HedgeConfig;

/// Floor for the hedge ratio in the copy-size formula.
const MIN_RATIO_FLOOR: Decimal = dec!(0.01);

/// Result of [`HedgeBalancer::should_copy_hedge`].
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeDecision {
    pub copy: bool,
    pub size: Decimal,
    pub hedge_ratio: Decimal,
    pub reason: String,
}

/// Result of [`HedgeBalancer::is_target_dominant_side`].
#[derive(Debug, Clone, PartialEq)]
pub struct DominanceCheck {
    pub is_dominant: bool,

    /// Target's share allocation to the traded outcome, when known
    pub allocation: Option<Decimal>,
    pub reason: String,
}

/// Where a position snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOrigin {
    Live,
    Cached,
    Stale,
    Ledger,
}

pub struct HedgeBalancer {
    config: HedgeConfig,
    target_wallet: String,
    source: Option<Arc<dyn TargetPositionSource>>,
    cache: Mutex<TtlCache<String, MarketPosition>>,
}

impl HedgeBalancer {
    pub fn new(
        config: HedgeConfig,
        target_wallet: String,
        source: Option<Arc<dyn TargetPositionSource>>,
    ) -> Self {
        let cache = TtlCache::new(config.position_ttl);
        Self {
            config,
            target_wallet,
            source,
            cache: Mutex::new(cache),
        }
    }

    /// Balancer that only uses ledger state.
    pub fn offline(config: HedgeConfig) -> Self {
        Self::new(config, String::new(), None)
    }

    /// Decide whether to copy a hedge and how much.
    ///
    /// `position` is the target's holding after the hedge trade;
    /// `primary_side` is the outcome of the target's first entry.
    pub fn should_copy_hedge(
        &self,
        trade_notional: Decimal,
        position: &MarketPosition,
        primary_side: usize,
    ) -> HedgeDecision {
        let total = position.total_shares();
        let hedge_ratio = if total.is_zero() {
            Decimal::ZERO
        } else {
            position.shares(1 - primary_side.min(1)) / total
        };
        let target = self.config.target_hedge_ratio;

        if hedge_ratio < target {
            return HedgeDecision {
                copy: false,
                size: Decimal::ZERO,
                hedge_ratio,
                reason: format!(
                    "hedge ratio below target ({}% < {}%)",
                    pct(hedge_ratio),
                    pct(target)
                ),
            };
        }

        let size = (trade_notional * (target / hedge_ratio.max(MIN_RATIO_FLOOR))).min(trade_notional);
        HedgeDecision {
            copy: true,
            size,
            hedge_ratio,
            reason: format!(
                "hedge ratio {}% >= target {}%, copying {}",
                pct(hedge_ratio),
                pct(target),
                size.round_dp(2)
            ),
        }
    }

    /// Target's position in `market_id`: fresh cache, then live fetch, then
    /// stale cache, then `fallback`.
    pub async fn target_position(
        &self,
        market_id: &str,
        fallback: Option<&MarketPosition>,
    ) -> Option<(MarketPosition, PositionOrigin)> {
        let key = market_id.to_string();
        if let Some(cached) = self.cache.lock().await.get(&key) {
            return Some((cached, PositionOrigin::Cached));
        }

        let ledger = || fallback.cloned().map(|p| (p, PositionOrigin::Ledger));

        let Some(source) = &self.source else {
            return ledger();
        };

        match source.fetch_market_position(&self.target_wallet, market_id).await {
            Ok(Some(position)) => {
                debug!(
                    market = %market_id,
                    outcome0 = %position.outcome0_shares,
                    outcome1 = %position.outcome1_shares,
                    "Target position (live)"
                );
                self.cache.lock().await.insert(key, position.clone());
                Some((position, PositionOrigin::Live))
            }
            // The data API can lag the activity feed; trust the ledger meanwhile
            Ok(None) => ledger(),
            Err(e) => {
                if let Some((stale, age)) = self.cache.lock().await.get_stale(&key) {
                    warn!(market = %market_id, error = %e, age_secs = age.as_secs(), "Position fetch failed, using stale cache");
                    return Some((stale, PositionOrigin::Stale));
                }
                warn!(market = %market_id, error = %e, "Position fetch failed, using tracked state");
                ledger()
            }
        }
    }

    /// Veto BUYs on the side where the target holds the minority.
    pub async fn is_target_dominant_side(
        &self,
        market_id: &str,
        outcome_index: usize,
        fallback: Option<&MarketPosition>,
    ) -> DominanceCheck {
        match self.target_position(market_id, fallback).await {
            Some((position, origin)) => {
                let check = self.dominance_of(&position, outcome_index);
                debug!(market = %market_id, origin = ?origin, dominant = check.is_dominant, "{}", check.reason);
                check
            }
            None => DominanceCheck {
                is_dominant: true,
                allocation: None,
                reason: "no target position data, allowing trade".to_string(),
            },
        }
    }

    /// Dominance rule on a known position. Pure.
    pub fn dominance_of(&self, position: &MarketPosition, outcome_index: usize) -> DominanceCheck {
        let total = position.total_shares();
        if total < self.config.min_shares_for_dominance {
            return DominanceCheck {
                is_dominant: true,
                allocation: None,
                reason: format!("early position ({} shares), allowing trade", total.round_dp(1)),
            };
        }

        let allocation = position.allocation(outcome_index);
        let min = self.config.min_dominance;

        let (is_dominant, reason) = if allocation >= min {
            (true, format!("dominant side ({}%)", pct(allocation)))
        } else if allocation <= Decimal::ONE - min {
            (
                false,
                format!(
                    "minority side ({}%), target favors the other outcome ({}%)",
                    pct(allocation),
                    pct(Decimal::ONE - allocation)
                ),
            )
        } else {
            (true, format!("balanced position ({}%), allowing trade", pct(allocation)))
        };

        DominanceCheck {
            is_dominant,
            allocation: Some(allocation),
            reason,
        }
    }

    /// Sizing weight `allocation x 2`: 1.0 when balanced or unknown.
    pub async fn target_sizing_weight(
        &self,
        market_id: &str,
        outcome_index: usize,
        fallback: Option<&MarketPosition>,
    ) -> Decimal {
        let Some((position, _)) = self.target_position(market_id, fallback).await else {
            return Decimal::ONE;
        };
        if position.is_empty() {
            return Decimal::ONE;
        }
        let weight = position.allocation(outcome_index) * dec!(2);
        info!(market = %market_id, outcome = outcome_index, weight = %weight.round_dp(2), "Target sizing weight");
        weight
    }

    /// Forget a market's cached position (e.g. after resolution).
    pub async fn invalidate(&self, market_id: &str) {
        self.cache.lock().await.invalidate(&market_id.to_string());
    }

    /// Drop cached positions fetched more than `max_age` ago.
    pub async fn prune_cache(&self, max_age: std::time::Duration) -> usize {
        self.cache.lock().await.prune_older_than(max_age)
    }

    pub async fn cached_markets(&self) -> usize {
        self.cache.lock().await.len()
    }
}

fn pct(ratio: Decimal) -> Decimal {
    (ratio * dec!(100)).round_dp(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn position(o0: Decimal, o1: Decimal) -> MarketPosition {
        let mut p = MarketPosition::default();
        p.apply_buy(0, o0, o0 * dec!(0.5));
        p.apply_buy(1, o1, o1 * dec!(0.5));
        p
    }

    struct MockPositions {
        position: MarketPosition,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TargetPositionSource for MockPositions {
        async fn fetch_market_position(
            &self,
            _account: &str,
            _market_id: &str,
        ) -> Result<Option<MarketPosition>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ApiError::Transient("timeout".to_string()));
            }
            Ok(Some(self.position.clone()))
        }
    }

    fn balancer_with(source: Arc<MockPositions>, ttl: Duration) -> HedgeBalancer {
        let config = HedgeConfig {
            position_ttl: ttl,
            ..HedgeConfig::default()
        };
        HedgeBalancer::new(config, "0xtarget".to_string(), Some(source))
    }

    #[test]
    fn test_hedge_below_target_is_skipped() {
        let balancer = HedgeBalancer::offline(HedgeConfig::default());
        let decision = balancer.should_copy_hedge(dec!(9), &position(dec!(85), dec!(15)), 0);

        assert!(!decision.copy);
        assert_eq!(decision.size, Decimal::ZERO);
        assert_eq!(decision.hedge_ratio, dec!(0.15));
        assert!(decision.reason.contains("ratio below target"));
    }

    #[test]
    fn test_hedge_gate_ignores_trade_size() {
        let balancer = HedgeBalancer::offline(HedgeConfig::default());
        for notional in [dec!(0.5), dec!(100), dec!(100000)] {
            let decision = balancer.should_copy_hedge(notional, &position(dec!(80), dec!(20)), 0);
            assert!(!decision.copy);
        }
    }

    #[test]
    fn test_hedge_copy_size() {
        let balancer = HedgeBalancer::offline(HedgeConfig::default());

        // 50% hedged: copy half
        let half = balancer.should_copy_hedge(dec!(20), &position(dec!(50), dec!(50)), 0);
        assert!(half.copy);
        assert_eq!(half.size, dec!(10));

        // Exactly at target: full size, never more
        let at = balancer.should_copy_hedge(dec!(20), &position(dec!(75), dec!(25)), 0);
        assert!(at.copy);
        assert_eq!(at.size, dec!(20));
    }

    #[test]
    fn test_dominance_rules() {
        let balancer = HedgeBalancer::offline(HedgeConfig::default());

        let early = balancer.dominance_of(&position(dec!(1), dec!(8)), 0);
        assert!(early.is_dominant);
        assert!(early.reason.contains("early"));

        let lopsided = position(dec!(30), dec!(70));
        assert!(!balancer.dominance_of(&lopsided, 0).is_dominant);
        assert!(balancer.dominance_of(&lopsided, 1).is_dominant);

        let balanced = balancer.dominance_of(&position(dec!(48), dec!(52)), 0);
        assert!(balanced.is_dominant);
        assert!(balanced.reason.contains("balanced"));
    }

    #[test]
    fn test_dominance_boundaries() {
        let balancer = HedgeBalancer::offline(HedgeConfig::default());
        // 45% is exactly 1 - 0.55: minority
        assert!(!balancer.dominance_of(&position(dec!(45), dec!(55)), 0).is_dominant);
        assert!(balancer.dominance_of(&position(dec!(45), dec!(55)), 1).is_dominant);
    }

    #[tokio::test]
    async fn test_live_position_is_cached() {
        let source = Arc::new(MockPositions {
            position: position(dec!(20), dec!(80)),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let balancer = balancer_with(source.clone(), Duration::from_secs(30));
        let ledger = position(dec!(90), dec!(10));

        let check = balancer.is_target_dominant_side("0xm", 0, Some(&ledger)).await;
        assert!(!check.is_dominant);
        let _ = balancer.is_target_dominant_side("0xm", 1, Some(&ledger)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_uses_stale_then_ledger() {
        let source = Arc::new(MockPositions {
            position: position(dec!(20), dec!(80)),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let balancer = balancer_with(source.clone(), Duration::from_millis(1));
        let ledger = position(dec!(90), dec!(10));

        balancer.target_position("0xm", Some(&ledger)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.fail.store(true, Ordering::SeqCst);

        let (stale, origin) = balancer.target_position("0xm", Some(&ledger)).await.unwrap();
        assert_eq!(origin, PositionOrigin::Stale);
        assert_eq!(stale.outcome1_shares, dec!(80));

        let (fallback, origin) = balancer.target_position("0xnew", Some(&ledger)).await.unwrap();
        assert_eq!(origin, PositionOrigin::Ledger);
        assert_eq!(fallback.outcome0_shares, dec!(90));
    }

    #[tokio::test]
    async fn test_prune_cache_drops_old_positions() {
        let source = Arc::new(MockPositions {
            position: position(dec!(20), dec!(80)),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let balancer = balancer_with(source.clone(), Duration::from_millis(1));

        balancer.target_position("0xold", None).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        balancer.target_position("0xnew", None).await;
        assert_eq!(balancer.cached_markets().await, 2);

        assert_eq!(balancer.prune_cache(Duration::from_millis(20)).await, 1);
        assert_eq!(balancer.cached_markets().await, 1);

        // The pruned market has no stale fallback left
        source.fail.store(true, Ordering::SeqCst);
        assert!(balancer.target_position("0xold", None).await.is_none());
    }

    #[tokio::test]
    async fn test_sizing_weight() {
        let balancer = HedgeBalancer::offline(HedgeConfig::default());
        let ledger = position(dec!(70), dec!(30));

        assert_eq!(balancer.target_sizing_weight("0xm", 0, Some(&ledger)).await, dec!(1.4));
        assert_eq!(balancer.target_sizing_weight("0xm", 1, None).await, Decimal::ONE);
    }
}
