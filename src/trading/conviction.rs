//! Conviction scoring from trade size, position scaling and time urgency.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::time_urgency;

/// Rolling window of target trade sizes used for percentiles.
pub const DEFAULT_HISTORY_WINDOW: usize = 500;

/// Samples required before the percentile is meaningful.
const MIN_SAMPLES: usize = 5;

/// Urgency assumed when the market close cannot be derived.
pub const DEFAULT_TIME_URGENCY: f64 = 0.3;

const SIZE_WEIGHT: f64 = 30.0;
const SCALING_WEIGHT: f64 = 30.0;
const TIME_WEIGHT: f64 = 25.0;
const MAJOR_SCALE_BONUS: f64 = 15.0;
const SCALING_CAP: f64 = 5.0;

/// Inputs of one conviction estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConvictionScore {
    /// 0-1, share of recent trades strictly smaller than this one
    pub size_percentile: f64,

    /// >= 1, primary-side notional over first entry
    pub scaling_factor: f64,

    /// 0-1, proximity to market close
    pub time_urgency: f64,

    pub is_major_scale: bool,
}

impl ConvictionScore {
    /// Neutral score for trades with no context.
    pub fn neutral() -> Self {
        Self {
            size_percentile: 0.5,
            scaling_factor: 1.0,
            time_urgency: DEFAULT_TIME_URGENCY,
            is_major_scale: false,
        }
    }

    /// Combined score, 0-100.
    pub fn total(&self) -> u8 {
        let scaling = (self.scaling_factor / SCALING_CAP).clamp(0.0, 1.0);
        let mut score = self.size_percentile.clamp(0.0, 1.0) * SIZE_WEIGHT
            + scaling * SCALING_WEIGHT
            + self.time_urgency.clamp(0.0, 1.0) * TIME_WEIGHT;
        if self.is_major_scale {
            score += MAJOR_SCALE_BONUS;
        }
        score.clamp(0.0, 100.0) as u8
    }
}

/// Scores trades against the target's recent size distribution.
#[derive(Debug, Clone)]
pub struct ConvictionScorer {
    history: VecDeque<Decimal>,
    window: usize,
}

impl Default for ConvictionScorer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}

impl ConvictionScorer {
    pub fn new(window: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(window.min(DEFAULT_HISTORY_WINDOW)),
            window: window.max(1),
        }
    }

    /// Fraction of remembered sizes strictly below `notional`.
    pub fn size_percentile(&self, notional: Decimal) -> f64 {
        if self.history.len() < MIN_SAMPLES {
            return 0.5;
        }
        let below = self.history.iter().filter(|&&s| s < notional).count();
        below as f64 / self.history.len() as f64
    }

    /// Add a target trade size to the window.
    pub fn record(&mut self, notional: Decimal) {
        self.history.push_back(notional);
        while self.history.len() > self.window {
            self.history.pop_front();
        }
    }

    /// Score a trade, then remember its size.
    ///
    /// The percentile is taken against history *before* this trade.
    pub fn score(
        &mut self,
        notional: Decimal,
        scaling_factor: Decimal,
        market_slug: &str,
        at: DateTime<Utc>,
        is_major_scale: bool,
    ) -> ConvictionScore {
        let score = ConvictionScore {
            size_percentile: self.size_percentile(notional),
            scaling_factor: scaling_factor.to_f64().unwrap_or(1.0).max(1.0),
            time_urgency: time_urgency(market_slug, at).unwrap_or(DEFAULT_TIME_URGENCY),
            is_major_scale,
        };
        self.record(notional);
        score
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_neutral_until_enough_samples() {
        let mut scorer = ConvictionScorer::default();
        for size in [dec!(1), dec!(2), dec!(3), dec!(4)] {
            scorer.record(size);
        }
        assert_eq!(scorer.size_percentile(dec!(100)), 0.5);

        scorer.record(dec!(5));
        assert_eq!(scorer.size_percentile(dec!(100)), 1.0);
        assert_eq!(scorer.size_percentile(dec!(1)), 0.0);
        // Strictly below: the tie at 3 does not count
        assert_eq!(scorer.size_percentile(dec!(3)), 0.4);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut scorer = ConvictionScorer::new(10);
        for i in 0..25 {
            scorer.record(Decimal::from(i));
        }
        assert_eq!(scorer.history_len(), 10);
        // Remaining window is 15..=24
        assert_eq!(scorer.size_percentile(dec!(15)), 0.0);
    }

    #[test]
    fn test_total_weights() {
        let neutral = ConvictionScore::neutral();
        // 0.5*30 + 0.2*30 + 0.3*25 = 15 + 6 + 7.5
        assert_eq!(neutral.total(), 28);

        let maxed = ConvictionScore {
            size_percentile: 1.0,
            scaling_factor: 12.0,
            time_urgency: 1.0,
            is_major_scale: true,
        };
        assert_eq!(maxed.total(), 100);

        let scaled = ConvictionScore {
            size_percentile: 0.0,
            scaling_factor: 5.0,
            time_urgency: 0.0,
            is_major_scale: true,
        };
        assert_eq!(scaled.total(), 45);
    }

    #[test]
    fn test_score_uses_history_before_trade() {
        let mut scorer = ConvictionScorer::default();
        for _ in 0..5 {
            scorer.record(dec!(10));
        }
        let score = scorer.score(dec!(50), Decimal::ONE, "", Utc::now(), false);

        assert_eq!(score.size_percentile, 1.0);
        assert_eq!(score.time_urgency, DEFAULT_TIME_URGENCY);
        assert_eq!(scorer.history_len(), 6);
    }
}
