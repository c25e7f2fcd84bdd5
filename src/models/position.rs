//! Position models: per-market outcome holdings and the copier's own positions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Shares below this are treated as zero.
const DUST_SHARES: Decimal = dec!(0.000001);

/// Share and cost holdings across both outcomes of one binary market.
///
/// Shares never go negative: sells larger than the holding clamp to zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketPosition {
    pub outcome0_shares: Decimal,
    pub outcome1_shares: Decimal,
    pub outcome0_cost: Decimal,
    pub outcome1_cost: Decimal,
}

impl MarketPosition {
    pub fn total_shares(&self) -> Decimal {
        self.outcome0_shares + self.outcome1_shares
    }

    pub fn shares(&self, outcome_index: usize) -> Decimal {
        if outcome_index == 0 {
            self.outcome0_shares
        } else {
            self.outcome1_shares
        }
    }

    pub fn cost(&self, outcome_index: usize) -> Decimal {
        if outcome_index == 0 {
            self.outcome0_cost
        } else {
            self.outcome1_cost
        }
    }

    /// Fraction of shares held on outcome 0 (0.5 when flat).
    pub fn balance_ratio(&self) -> Decimal {
        self.allocation(0)
    }

    /// Fraction of total shares held on `outcome_index` (0.5 when flat).
    pub fn allocation(&self, outcome_index: usize) -> Decimal {
        let total = self.total_shares();
        if total.is_zero() {
            return dec!(0.5);
        }
        self.shares(outcome_index) / total
    }

    /// Record a buy of `shares` costing `cost` USDC.
    pub fn apply_buy(&mut self, outcome_index: usize, shares: Decimal, cost: Decimal) {
        let (s, c) = self.slots_mut(outcome_index);
        *s += shares.max(Decimal::ZERO);
        *c += cost.max(Decimal::ZERO);
    }

    /// Record a sell of `shares`; cost basis shrinks pro rata.
    pub fn apply_sell(&mut self, outcome_index: usize, shares: Decimal) {
        let (s, c) = self.slots_mut(outcome_index);
        if s.is_zero() {
            return;
        }
        let sold = shares.max(Decimal::ZERO).min(*s);
        let remaining = *s - sold;
        *c = if remaining < DUST_SHARES {
            Decimal::ZERO
        } else {
            *c * remaining / *s
        };
        *s = if remaining < DUST_SHARES { Decimal::ZERO } else { remaining };
    }

    pub fn is_empty(&self) -> bool {
        self.total_shares() < DUST_SHARES
    }

    fn slots_mut(&mut self, outcome_index: usize) -> (&mut Decimal, &mut Decimal) {
        if outcome_index == 0 {
            (&mut self.outcome0_shares, &mut self.outcome0_cost)
        } else {
            (&mut self.outcome1_shares, &mut self.outcome1_cost)
        }
    }
}

/// One outcome token held by the copier, with cost basis for P&L.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierPosition {
    /// Market condition ID
    pub market_id: String,

    /// Outcome token ID
    pub token_id: String,

    pub outcome_index: usize,

    /// Market title for display
    #[serde(default)]
    pub market_title: String,

    /// Number of outcome tokens held
    pub shares: Decimal,

    /// Total USDC paid for the remaining shares
    pub cost_basis: Decimal,

    /// Average entry price per token
    pub avg_price: Decimal,

    pub opened_at: DateTime<Utc>,
}

impl CopierPosition {
    /// Open a position from a first fill.
    pub fn new(
        market_id: String,
        token_id: String,
        outcome_index: usize,
        market_title: String,
        shares: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            market_id,
            token_id,
            outcome_index,
            market_title,
            shares,
            cost_basis: shares * price,
            avg_price: price,
            opened_at: Utc::now(),
        }
    }

    /// Add to position (averaging in).
    pub fn add(&mut self, shares: Decimal, price: Decimal) {
        self.cost_basis += shares * price;
        self.shares += shares;

        if !self.shares.is_zero() {
            self.avg_price = self.cost_basis / self.shares;
        }
    }

    /// Reduce position at `price`, returning realized P&L.
    pub fn reduce(&mut self, shares: Decimal, price: Decimal) -> Decimal {
        let sold = shares.min(self.shares).max(Decimal::ZERO);
        let realized = sold * (price - self.avg_price);

        self.shares -= sold;
        self.cost_basis = self.shares * self.avg_price;

        realized
    }

    /// Settle at `payout_per_share`, returning `(payout, realized_pnl)`.
    pub fn settle(&self, payout_per_share: Decimal) -> (Decimal, Decimal) {
        let payout = self.shares * payout_per_share;
        (payout, payout - self.cost_basis)
    }

    /// Check if this position is closed (size is zero or negligible).
    pub fn is_closed(&self) -> bool {
        self.shares < DUST_SHARES
    }

    /// Value at `price`.
    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.shares * price
    }
}
