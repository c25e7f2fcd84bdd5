//! Paper trading: simulated fills against the live book, with an optional
//! market simulation (latency, partial fills, rejections).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info};

use crate::models::Side;

use super::config::PaperConfig;
use super::ledger::{PositionLedger, ResolutionResult};

/// Most recent paper fills kept in memory.
pub const PAPER_HISTORY_LEN: usize = 500;

/// What the simulator decided before the fill is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketRoll {
    pub delay: Duration,
    pub rejected: bool,

    /// Fraction of the order that fills (1 for a full fill)
    pub fill_fraction: Decimal,
}

impl MarketRoll {
    /// Immediate full fill.
    pub fn perfect() -> Self {
        Self {
            delay: Duration::ZERO,
            rejected: false,
            fill_fraction: Decimal::ONE,
        }
    }
}

/// A simulated execution.
#[derive(Debug, Clone, Serialize)]
pub struct PaperTrade {
    pub at: DateTime<Utc>,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub shares: Decimal,
    pub price: Decimal,
    pub notional: Decimal,
    pub partial: bool,
}

/// Paper trading state. Positions live in the [`PositionLedger`]; this
/// holds the cash side and execution counters.
#[derive(Debug)]
pub struct PaperTrader {
    config: PaperConfig,
    cash: Decimal,
    realized_pnl: Decimal,
    history: VecDeque<PaperTrade>,
    fills: u64,
    partial_fills: u64,
    rejections: u64,
    resolutions: u64,
    started_at: DateTime<Utc>,
}

impl PaperTrader {
    pub fn new(config: PaperConfig) -> Self {
        Self {
            cash: config.initial_balance,
            config,
            realized_pnl: Decimal::ZERO,
            history: VecDeque::with_capacity(PAPER_HISTORY_LEN),
            fills: 0,
            partial_fills: 0,
            rejections: 0,
            resolutions: 0,
            started_at: Utc::now(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Recent fills, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &PaperTrade> {
        self.history.iter()
    }

    /// Roll latency, rejection and partial fill for an order of `notional`.
    pub fn roll_market(&self, notional: Decimal) -> MarketRoll {
        if !self.config.simulate_market {
            return MarketRoll::perfect();
        }
        let mut rng = rand::thread_rng();

        let min = self.config.min_delay.as_millis() as u64;
        let max = (self.config.max_delay.as_millis() as u64).max(min);
        let delay = Duration::from_millis(rng.gen_range(min..=max));

        if rng.gen_bool(self.config.reject_probability.clamp(0.0, 1.0)) {
            return MarketRoll {
                delay,
                rejected: true,
                fill_fraction: Decimal::ZERO,
            };
        }

        let partial_chance = if notional >= self.config.large_order_notional {
            self.config.large_partial_probability
        } else {
            self.config.partial_probability
        };
        let fill_fraction = if rng.gen_bool(partial_chance.clamp(0.0, 1.0)) {
            let lo = self.config.min_fill_fraction.clamp(0.0, 1.0);
            let hi = self.config.max_fill_fraction.clamp(lo, 1.0);
            Decimal::from_f64(rng.gen_range(lo..=hi))
                .unwrap_or(Decimal::ONE)
                .round_dp(4)
        } else {
            Decimal::ONE
        };

        MarketRoll {
            delay,
            rejected: false,
            fill_fraction,
        }
    }

    /// Apply a simulated fill of `fraction` of `shares` at `price`.
    pub fn apply_fill(
        &mut self,
        market_id: &str,
        token_id: &str,
        side: Side,
        shares: Decimal,
        price: Decimal,
        fraction: Decimal,
    ) -> Result<PaperTrade, String> {
        let filled = (shares * fraction).round_dp(2);
        if filled <= Decimal::ZERO {
            return Err("nothing filled".to_string());
        }
        let notional = filled * price;

        match side {
            Side::Buy => {
                if notional > self.cash {
                    return Err(format!(
                        "insufficient paper balance: need ${}, have ${}",
                        notional.round_dp(2),
                        self.cash.round_dp(2)
                    ));
                }
                self.cash -= notional;
            }
            Side::Sell => self.cash += notional,
        }

        let partial = fraction < Decimal::ONE;
        self.fills += 1;
        if partial {
            self.partial_fills += 1;
        }

        let trade = PaperTrade {
            at: Utc::now(),
            market_id: market_id.to_string(),
            token_id: token_id.to_string(),
            side,
            shares: filled,
            price,
            notional,
            partial,
        };
        debug!(side = %side, shares = %filled, price = %price, cash = %self.cash.round_dp(2), "Paper fill");
        self.history.push_back(trade.clone());
        while self.history.len() > PAPER_HISTORY_LEN {
            self.history.pop_front();
        }
        Ok(trade)
    }

    pub fn record_rejection(&mut self) {
        self.rejections += 1;
    }

    /// Credit a settled market's payout.
    pub fn credit_resolution(&mut self, result: &ResolutionResult) {
        self.cash += result.payout;
        self.realized_pnl += result.pnl;
        self.resolutions += 1;
        info!(
            market = %result.market_id,
            payout = %result.payout.round_dp(2),
            pnl = %result.pnl.round_dp(2),
            cash = %self.cash.round_dp(2),
            "Paper position redeemed"
        );
    }

    /// Cash plus open positions, marked at `prices` (token id -> price) or
    /// at entry when no price is given.
    pub fn portfolio_value(&self, ledger: &PositionLedger, prices: &HashMap<String, Decimal>) -> Decimal {
        let positions: Decimal = ledger
            .copier_positions()
            .map(|p| {
                let price = prices.get(&p.token_id).copied().unwrap_or(p.avg_price);
                p.market_value(price)
            })
            .sum();
        self.cash + positions
    }

    pub fn stats(&self, ledger: &PositionLedger, prices: &HashMap<String, Decimal>) -> PaperStats {
        let value = self.portfolio_value(ledger, prices);
        let initial = self.config.initial_balance;
        PaperStats {
            initial_balance: initial,
            cash: self.cash,
            portfolio_value: value,
            realized_pnl: self.realized_pnl,
            total_pnl: value - initial,
            return_pct: if initial.is_zero() {
                Decimal::ZERO
            } else {
                (value - initial) / initial
            },
            open_positions: ledger.copier_positions().count(),
            fills: self.fills,
            partial_fills: self.partial_fills,
            rejections: self.rejections,
            resolutions: self.resolutions,
            running_since: self.started_at,
        }
    }
}

/// Paper trading statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PaperStats {
    pub initial_balance: Decimal,
    pub cash: Decimal,
    pub portfolio_value: Decimal,
    pub realized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub return_pct: Decimal,
    pub open_positions: usize,
    pub fills: u64,
    pub partial_fills: u64,
    pub rejections: u64,
    pub resolutions: u64,
    pub running_since: DateTime<Utc>,
}

impl std::fmt::Display for PaperStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^50}", " PAPER TRADING ")?;
        writeln!(f, "Running since: {}", self.running_since.format("%Y-%m-%d %H:%M"))?;
        writeln!(f)?;
        writeln!(f, "Initial Balance:  ${:.2}", self.initial_balance)?;
        writeln!(f, "Cash:             ${:.2}", self.cash)?;
        writeln!(f, "Portfolio Value:  ${:.2}", self.portfolio_value)?;
        writeln!(f)?;
        writeln!(f, "Realized P&L:     ${:.2}", self.realized_pnl)?;
        writeln!(f, "Total P&L:        ${:.2} ({:.2}%)",
            self.total_pnl, self.return_pct * dec!(100))?;
        writeln!(f)?;
        writeln!(f, "Open Positions:   {}", self.open_positions)?;
        writeln!(f, "Fills:            {} ({} partial)", self.fills, self.partial_fills)?;
        writeln!(f, "Rejections:       {}", self.rejections)?;
        writeln!(f, "Resolutions:      {}", self.resolutions)?;
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::ledger::CopierFill;

    fn trader() -> PaperTrader {
        PaperTrader::new(PaperConfig {
            initial_balance: dec!(100),
            ..PaperConfig::default()
        })
    }

    #[test]
    fn test_buy_debits_cash() {
        let mut paper = trader();
        let trade = paper
            .apply_fill("0xm", "tok", Side::Buy, dec!(20), dec!(0.45), Decimal::ONE)
            .unwrap();

        assert_eq!(trade.notional, dec!(9));
        assert!(!trade.partial);
        assert_eq!(paper.cash(), dec!(91));
    }

    #[test]
    fn test_partial_fill_and_insufficient_cash() {
        let mut paper = trader();
        let trade = paper
            .apply_fill("0xm", "tok", Side::Buy, dec!(10), dec!(0.50), dec!(0.75))
            .unwrap();
        assert_eq!(trade.shares, dec!(7.5));
        assert!(trade.partial);

        let err = paper
            .apply_fill("0xm", "tok", Side::Buy, dec!(1000), dec!(0.50), Decimal::ONE)
            .unwrap_err();
        assert!(err.contains("insufficient"));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut paper = PaperTrader::new(PaperConfig {
            initial_balance: dec!(1000000),
            ..PaperConfig::default()
        });
        for i in 0..(PAPER_HISTORY_LEN + 20) {
            paper
                .apply_fill(&format!("0x{}", i), "tok", Side::Buy, dec!(5), dec!(0.50), Decimal::ONE)
                .unwrap();
        }

        assert_eq!(paper.history().count(), PAPER_HISTORY_LEN);
        assert_eq!(paper.history().next().unwrap().market_id, "0x20");
    }

    #[test]
    fn test_roll_without_simulation_is_perfect() {
        let paper = trader();
        assert_eq!(paper.roll_market(dec!(50)), MarketRoll::perfect());
    }

    #[test]
    fn test_roll_bounds() {
        let paper = PaperTrader::new(PaperConfig {
            simulate_market: true,
            reject_probability: 0.0,
            partial_probability: 1.0,
            ..PaperConfig::default()
        });
        for _ in 0..50 {
            let roll = paper.roll_market(dec!(5));
            assert!(!roll.rejected);
            assert!(roll.fill_fraction >= dec!(0.6) && roll.fill_fraction <= dec!(0.9));
            assert!(roll.delay >= Duration::from_millis(100) && roll.delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_resolution_credit_and_portfolio_value() {
        let mut paper = trader();
        let mut ledger = PositionLedger::new();

        paper
            .apply_fill("0xm", "tok", Side::Buy, dec!(10), dec!(0.30), Decimal::ONE)
            .unwrap();
        ledger.apply_copier_fill(&CopierFill {
            market_id: "0xm".to_string(),
            token_id: "tok".to_string(),
            outcome_index: 0,
            market_title: String::new(),
            side: Side::Buy,
            shares: dec!(10),
            price: dec!(0.30),
        });

        let mut prices = HashMap::new();
        assert_eq!(paper.portfolio_value(&ledger, &prices), dec!(100));
        prices.insert("tok".to_string(), dec!(0.50));
        assert_eq!(paper.portfolio_value(&ledger, &prices), dec!(102));

        let result = ledger.apply_resolution("0xm", [Decimal::ONE, Decimal::ZERO]);
        paper.credit_resolution(&result);

        let stats = paper.stats(&ledger, &HashMap::new());
        assert_eq!(stats.cash, dec!(107));
        assert_eq!(stats.realized_pnl, dec!(7));
        assert_eq!(stats.open_positions, 0);
        assert!(stats.to_string().contains("PAPER TRADING"));
    }
}
