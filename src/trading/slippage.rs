//! Slippage guard: target fill price vs. current top of book.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use statrs::statistics::Statistics;
use tracing::{info, warn};

use crate::models::Side;

use super::config::SlippageConfig;

/// Why a trade was vetoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlippageVeto {
    /// Book is at or beyond the resolution threshold
    NearResolution,
    /// Slippage exceeds the configured cap
    OverBudget,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SlippageCheck {
    pub proceed: bool,
    pub execution_price: Decimal,

    /// |book - target| in price units
    pub absolute: Decimal,

    /// `absolute` as a fraction of the target price
    pub relative: Decimal,
    pub veto: Option<SlippageVeto>,
    pub reason: String,
}

/// One remembered evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageRecord {
    pub at: DateTime<Utc>,
    pub side: Side,
    pub target_price: Decimal,
    pub book_price: Decimal,
    pub absolute: Decimal,
    pub relative: Decimal,
    pub proceeded: bool,
}

/// Aggregates over the remembered evaluations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlippageStats {
    pub samples: usize,
    pub passed: u64,
    pub skipped: u64,
    /// Mean absolute slippage of passed trades (price units)
    pub mean_absolute: f64,
    pub max_absolute: f64,
    pub std_dev_absolute: f64,
}

impl std::fmt::Display for SlippageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "slippage: {} passed / {} skipped, mean {:.2}c, max {:.2}c, sd {:.2}c",
            self.passed,
            self.skipped,
            self.mean_absolute * 100.0,
            self.max_absolute * 100.0,
            self.std_dev_absolute * 100.0
        )
    }
}

#[derive(Debug)]
pub struct SlippageGuard {
    config: SlippageConfig,
    history: VecDeque<SlippageRecord>,
    passed: u64,
    skipped: u64,
}

impl SlippageGuard {
    pub fn new(config: SlippageConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_len),
            config,
            passed: 0,
            skipped: 0,
        }
    }

    /// Whether `book_price` says the market is effectively settled.
    pub fn is_near_resolution(&self, book_price: Decimal) -> bool {
        let threshold = self.config.resolution_threshold;
        book_price >= threshold || book_price <= Decimal::ONE - threshold
    }

    /// Check `book_price` against the target's fill.
    ///
    /// Near-resolution is checked first, then the slippage cap. On pass the
    /// execution price is the book price (ask for BUY, bid for SELL).
    pub fn evaluate(
        &mut self,
        target_price: Decimal,
        book_price: Decimal,
        side: Side,
        market: &str,
    ) -> SlippageCheck {
        let absolute = (book_price - target_price).abs();
        let relative = if target_price > Decimal::ZERO {
            absolute / target_price
        } else {
            Decimal::ZERO
        };
        // Positive when the book is worse for us than the target's fill
        let adverse = match side {
            Side::Buy => book_price - target_price,
            Side::Sell => target_price - book_price,
        };

        info!(
            market = %market,
            side = %side,
            target = %target_price,
            book = %book_price,
            slippage_cents = %(adverse * dec!(100)).round_dp(1),
            slippage_pct = %(adverse / target_price.max(dec!(0.0001)) * dec!(100)).round_dp(1),
            "Slippage analysis"
        );

        let (veto, reason) = if self.is_near_resolution(book_price) {
            (
                Some(SlippageVeto::NearResolution),
                format!("market near resolution (book {})", book_price),
            )
        } else if self.config.use_absolute && absolute > self.config.max_absolute {
            (
                Some(SlippageVeto::OverBudget),
                format!(
                    "slippage {}c exceeds max {}c",
                    (absolute * dec!(100)).round_dp(1),
                    (self.config.max_absolute * dec!(100)).round_dp(1)
                ),
            )
        } else if !self.config.use_absolute && relative > self.config.max_percent {
            (
                Some(SlippageVeto::OverBudget),
                format!(
                    "slippage {}% exceeds max {}%",
                    (relative * dec!(100)).round_dp(1),
                    (self.config.max_percent * dec!(100)).round_dp(1)
                ),
            )
        } else {
            (
                None,
                format!(
                    "slippage acceptable: {}c ({}%)",
                    (absolute * dec!(100)).round_dp(1),
                    (relative * dec!(100)).round_dp(1)
                ),
            )
        };

        let proceed = veto.is_none();
        if proceed {
            self.passed += 1;
        } else {
            self.skipped += 1;
            warn!(market = %market, "Skip: {}", reason);
        }
        self.remember(SlippageRecord {
            at: Utc::now(),
            side,
            target_price,
            book_price,
            absolute,
            relative,
            proceeded: proceed,
        });

        SlippageCheck {
            proceed,
            execution_price: book_price,
            absolute,
            relative,
            veto,
            reason,
        }
    }

    fn remember(&mut self, record: SlippageRecord) {
        self.history.push_back(record);
        while self.history.len() > self.config.history_len.max(1) {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &SlippageRecord> {
        self.history.iter()
    }

    /// Statistics over passed trades in the window.
    pub fn stats(&self) -> SlippageStats {
        let absolute: Vec<f64> = self
            .history
            .iter()
            .filter(|r| r.proceeded)
            .filter_map(|r| r.absolute.to_f64())
            .collect();

        let mut stats = SlippageStats {
            samples: self.history.len(),
            passed: self.passed,
            skipped: self.skipped,
            ..Default::default()
        };
        if absolute.is_empty() {
            return stats;
        }

        stats.mean_absolute = absolute.clone().mean();
        stats.max_absolute = Statistics::max(absolute.iter());
        if absolute.len() > 1 {
            stats.std_dev_absolute = absolute.std_dev();
        }
        stats
    }
}
