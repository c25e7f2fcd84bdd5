//! Converts the target's notional into the copier's order notional.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::models::Asset;

use super::classifier::Classification;
use super::config::SizingConfig;
use super::conviction::ConvictionScore;

/// Breakdown of one sizing decision, kept for logs and the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeBreakdown {
    pub base: Decimal,
    pub conviction_multiplier: Decimal,
    pub time_multiplier: Decimal,
    pub unclamped: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone)]
pub struct SizeCalculator {
    config: SizingConfig,
}

impl SizeCalculator {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Order notional for a target trade of `trade_notional`.
    pub fn calculate(
        &self,
        trade_notional: Decimal,
        asset: Asset,
        conviction: &ConvictionScore,
        classification: Classification,
    ) -> Decimal {
        self.breakdown(trade_notional, asset, conviction, classification)
            .size
    }

    pub fn breakdown(
        &self,
        trade_notional: Decimal,
        asset: Asset,
        conviction: &ConvictionScore,
        classification: Classification,
    ) -> SizeBreakdown {
        // Full mirror copies the target's notional as-is
        if self.config.full_mirror {
            return SizeBreakdown {
                base: trade_notional,
                conviction_multiplier: Decimal::ONE,
                time_multiplier: Decimal::ONE,
                unclamped: trade_notional,
                size: trade_notional,
            };
        }

        let base = trade_notional * self.config.ratio_for(asset);

        let (conviction_multiplier, time_multiplier) = if self.config.conviction_sizing {
            let score = Decimal::from(conviction.total());
            let mut conviction_mult = dec!(0.5) + score / dec!(100) * dec!(1.5);
            match classification {
                Classification::InitialEntry => conviction_mult *= self.config.initial_entry_factor,
                Classification::MajorScale => conviction_mult *= self.config.major_scale_factor,
                Classification::ScaleIn | Classification::Hedge | Classification::Exit => {}
            }

            let urgency = Decimal::from_f64(conviction.time_urgency.clamp(0.0, 1.0))
                .unwrap_or(Decimal::ZERO);
            let time_mult = Decimal::ONE + urgency * (self.config.max_time_multiplier - Decimal::ONE);
            (conviction_mult, time_mult)
        } else {
            (Decimal::ONE, Decimal::ONE)
        };

        let unclamped = base * conviction_multiplier * time_multiplier;
        let size = self.clamp(unclamped);

        debug!(
            asset = %asset,
            classification = %classification,
            base = %base.round_dp(4),
            conviction_mult = %conviction_multiplier.round_dp(3),
            time_mult = %time_multiplier.round_dp(3),
            size = %size.round_dp(2),
            "Sized copy trade"
        );

        SizeBreakdown {
            base,
            conviction_multiplier,
            time_multiplier,
            unclamped,
            size,
        }
    }

    /// Clamp to `[min_trade_amount, max_trade_amount]`.
    pub fn clamp(&self, size: Decimal) -> Decimal {
        size.max(self.config.min_trade_amount)
            .min(self.config.max_trade_amount)
    }
}
