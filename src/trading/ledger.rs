//! Position ledger for the monitored trader and the copier.
//!
//! Target state is inferred from observed fills and drives classification.
//! Copier state has two views (per-token positions with cost basis, and a
//! per-market two-outcome split for hedge balancing); both are updated in one
//! `&mut self` call so they can never disagree.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::{ActivityEvent, CopierPosition, MarketPosition, Side};

/// What the ledger knows about the monitored trader in one market.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetMarketState {
    pub market_id: String,
    pub market_title: String,
    pub market_slug: String,
    pub position: MarketPosition,

    /// Outcome of the first BUY in this market
    pub primary_side: usize,

    /// Notional of the first BUY
    pub first_entry_notional: Decimal,

    /// Cumulative BUY notional on the primary side
    pub primary_notional: Decimal,

    /// BUYs on the primary side
    pub entry_count: u32,

    pub first_entry_at: DateTime<Utc>,
    pub last_trade_at: DateTime<Utc>,
}

impl TargetMarketState {
    fn open(ev: &ActivityEvent) -> Self {
        Self {
            market_id: ev.market_id.clone(),
            market_title: ev.market_title.clone(),
            market_slug: ev.market_slug.clone(),
            position: MarketPosition::default(),
            primary_side: ev.outcome_index,
            first_entry_notional: ev.notional,
            primary_notional: Decimal::ZERO,
            entry_count: 0,
            first_entry_at: ev.occurred_at,
            last_trade_at: ev.occurred_at,
        }
    }

    pub fn hedge_side(&self) -> usize {
        1 - self.primary_side.min(1)
    }

    pub fn hedge_shares(&self) -> Decimal {
        self.position.shares(self.hedge_side())
    }

    /// Hedge shares over total shares (0 when flat).
    pub fn hedge_ratio(&self) -> Decimal {
        let total = self.position.total_shares();
        if total.is_zero() {
            return Decimal::ZERO;
        }
        self.hedge_shares() / total
    }

    /// Primary-side notional relative to the first entry (1.0 at open).
    pub fn scaling_factor(&self) -> Decimal {
        if self.first_entry_notional <= Decimal::ZERO {
            return Decimal::ONE;
        }
        (self.primary_notional / self.first_entry_notional).max(Decimal::ONE)
    }
}

/// A fill the copier received, as applied to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct CopierFill {
    pub market_id: String,
    pub token_id: String,
    pub outcome_index: usize,
    pub market_title: String,
    pub side: Side,
    pub shares: Decimal,
    pub price: Decimal,
}

/// Outcome of settling one market.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionResult {
    pub market_id: String,
    pub payout: Decimal,
    pub cost_basis: Decimal,
    pub pnl: Decimal,
    pub positions_closed: usize,
}

/// Share and cost state for both actors.
#[derive(Debug, Default)]
pub struct PositionLedger {
    targets: HashMap<String, TargetMarketState>,
    copier_positions: HashMap<(String, String), CopierPosition>,
    copier_markets: HashMap<String, MarketPosition>,
    realized_pnl: Decimal,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Monitored trader ====================

    pub fn target(&self, market_id: &str) -> Option<&TargetMarketState> {
        self.targets.get(market_id)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Apply an observed trade and return the market state afterwards.
    ///
    /// Returns `None` for a SELL in a market with no tracked position, and
    /// when a SELL flattens the position (the market entry is removed).
    pub fn record_target_trade(&mut self, ev: &ActivityEvent) -> Option<TargetMarketState> {
        match ev.side {
            Side::Buy => {
                let state = self
                    .targets
                    .entry(ev.market_id.clone())
                    .or_insert_with(|| TargetMarketState::open(ev));

                state.position.apply_buy(ev.outcome_index, ev.shares, ev.notional);
                if ev.outcome_index == state.primary_side {
                    state.primary_notional += ev.notional;
                    state.entry_count += 1;
                }
                state.last_trade_at = ev.occurred_at;
                Some(state.clone())
            }
            Side::Sell => {
                let state = self.targets.get_mut(&ev.market_id)?;
                state.position.apply_sell(ev.outcome_index, ev.shares);
                state.last_trade_at = ev.occurred_at;

                if state.position.is_empty() {
                    debug!(market = %ev.market_id, "Target flat, dropping market state");
                    self.targets.remove(&ev.market_id);
                    return None;
                }
                Some(state.clone())
            }
        }
    }

    /// Drop target markets with no trade since `cutoff`.
    pub fn prune_targets(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.targets.len();
        self.targets.retain(|_, s| s.last_trade_at >= cutoff);
        before - self.targets.len()
    }

    // ==================== Copier ====================

    pub fn copier_position(&self, market_id: &str, token_id: &str) -> Option<&CopierPosition> {
        self.copier_positions
            .get(&(market_id.to_string(), token_id.to_string()))
    }

    pub fn copier_positions(&self) -> impl Iterator<Item = &CopierPosition> {
        self.copier_positions.values()
    }

    /// Copier's two-outcome split in one market.
    pub fn copier_market(&self, market_id: &str) -> Option<&MarketPosition> {
        self.copier_markets.get(market_id)
    }

    /// Apply a fill to both copier views. Returns realized P&L (zero for buys).
    pub fn apply_copier_fill(&mut self, fill: &CopierFill) -> Decimal {
        if fill.shares <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let key = (fill.market_id.clone(), fill.token_id.clone());

        match fill.side {
            Side::Buy => {
                self.copier_positions
                    .entry(key)
                    .and_modify(|p| p.add(fill.shares, fill.price))
                    .or_insert_with(|| {
                        CopierPosition::new(
                            fill.market_id.clone(),
                            fill.token_id.clone(),
                            fill.outcome_index,
                            fill.market_title.clone(),
                            fill.shares,
                            fill.price,
                        )
                    });
                self.copier_markets
                    .entry(fill.market_id.clone())
                    .or_default()
                    .apply_buy(fill.outcome_index, fill.shares, fill.shares * fill.price);
                Decimal::ZERO
            }
            Side::Sell => {
                let Some(position) = self.copier_positions.get_mut(&key) else {
                    warn!(market = %fill.market_id, token = %fill.token_id, "Sell fill without a copier position");
                    return Decimal::ZERO;
                };
                let realized = position.reduce(fill.shares, fill.price);
                if position.is_closed() {
                    self.copier_positions.remove(&key);
                }

                if let Some(market) = self.copier_markets.get_mut(&fill.market_id) {
                    market.apply_sell(fill.outcome_index, fill.shares);
                    if market.is_empty() {
                        self.copier_markets.remove(&fill.market_id);
                    }
                }
                self.realized_pnl += realized;
                realized
            }
        }
    }

    /// Settle every copier position in `market_id` at the given per-outcome
    /// payouts, realize P&L and forget the market.
    pub fn apply_resolution(&mut self, market_id: &str, payouts: [Decimal; 2]) -> ResolutionResult {
        let keys: Vec<(String, String)> = self
            .copier_positions
            .keys()
            .filter(|(m, _)| m == market_id)
            .cloned()
            .collect();

        let mut result = ResolutionResult {
            market_id: market_id.to_string(),
            payout: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            pnl: Decimal::ZERO,
            positions_closed: 0,
        };

        for key in keys {
            if let Some(position) = self.copier_positions.remove(&key) {
                let per_share = payouts.get(position.outcome_index).copied().unwrap_or(Decimal::ZERO);
                let (payout, pnl) = position.settle(per_share);
                result.payout += payout;
                result.cost_basis += position.cost_basis;
                result.pnl += pnl;
                result.positions_closed += 1;
            }
        }

        self.copier_markets.remove(market_id);
        self.targets.remove(market_id);
        self.realized_pnl += result.pnl;

        if result.positions_closed > 0 {
            info!(
                market = %market_id,
                payout = %result.payout,
                pnl = %result.pnl,
                positions = result.positions_closed,
                "Market resolved"
            );
        }
        result
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    /// Cost basis of all open copier positions.
    pub fn open_cost_basis(&self) -> Decimal {
        self.copier_positions.values().map(|p| p.cost_basis).sum()
    }
}
