//! Entry rules applied to the target's fill before any sizing.

use crate::models::{ActivityEvent, Side};

use super::config::FilterConfig;
use super::copy_engine::SkipReason;

/// Result of entry validation.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryValidation {
    pub allowed: bool,
    pub reason: String,
    pub skip: Option<SkipReason>,
}

impl EntryValidation {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "Entry conditions met".to_string(),
            skip: None,
        }
    }

    pub fn deny(skip: SkipReason, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            skip: Some(skip),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntryFilter {
    config: FilterConfig,
}

impl EntryFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Validate whether the target's trade is worth copying at all.
    pub fn validate(&self, ev: &ActivityEvent) -> EntryValidation {
        if ev.notional < self.config.min_target_notional {
            return EntryValidation::deny(
                SkipReason::BelowMinNotional,
                format!(
                    "Target notional too small: {} < {}",
                    ev.notional.round_dp(2),
                    self.config.min_target_notional
                ),
            );
        }

        if ev.side == Side::Buy {
            if ev.price < self.config.min_price {
                return EntryValidation::deny(
                    SkipReason::PriceOutOfRange,
                    format!("Price too low: {} < {}", ev.price, self.config.min_price),
                );
            }
            if ev.price > self.config.max_price {
                return EntryValidation::deny(
                    SkipReason::PriceOutOfRange,
                    format!("Price too high: {} > {}", ev.price, self.config.max_price),
                );
            }
        }

        EntryValidation::allow()
    }
}
