//! Trade classification against the monitored trader's market state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ActivityEvent, Side};

use super::ledger::{PositionLedger, TargetMarketState};

/// What an observed trade means for the target's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// First BUY in a market
    InitialEntry,
    /// BUY adding to the primary side
    ScaleIn,
    /// ScaleIn at least `major_scale_threshold` times the first entry
    MajorScale,
    /// BUY on the side opposite the primary
    Hedge,
    /// Any SELL
    Exit,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::InitialEntry => "initial_entry",
            Classification::ScaleIn => "scale_in",
            Classification::MajorScale => "major_scale",
            Classification::Hedge => "hedge",
            Classification::Exit => "exit",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified trade with the target's market state after it was applied.
#[derive(Debug, Clone)]
pub struct ClassifiedTrade {
    pub classification: Classification,

    /// `None` after a SELL that flattened the market or hit no position
    pub state: Option<TargetMarketState>,
}

impl ClassifiedTrade {
    pub fn is_major_scale(&self) -> bool {
        self.classification == Classification::MajorScale
    }

    /// Scaling factor for conviction scoring (1.0 without state).
    pub fn scaling_factor(&self) -> Decimal {
        self.state
            .as_ref()
            .map(|s| s.scaling_factor())
            .unwrap_or(Decimal::ONE)
    }
}

/// Labels trades and records them in the ledger.
#[derive(Debug, Clone)]
pub struct TradeClassifier {
    major_scale_threshold: Decimal,
}

impl TradeClassifier {
    pub fn new(major_scale_threshold: Decimal) -> Self {
        Self {
            major_scale_threshold,
        }
    }

    /// Label `ev` against the state before it. Pure.
    pub fn classify(&self, prior: Option<&TargetMarketState>, ev: &ActivityEvent) -> Classification {
        match (ev.side, prior) {
            (Side::Sell, _) => Classification::Exit,
            (Side::Buy, None) => Classification::InitialEntry,
            (Side::Buy, Some(state)) if ev.outcome_index != state.primary_side => {
                Classification::Hedge
            }
            (Side::Buy, Some(state)) => {
                if state.first_entry_notional > Decimal::ZERO
                    && ev.notional / state.first_entry_notional >= self.major_scale_threshold
                {
                    Classification::MajorScale
                } else {
                    Classification::ScaleIn
                }
            }
        }
    }

    /// Classify `ev` and apply it to the ledger.
    pub fn classify_and_record(&self, ledger: &mut PositionLedger, ev: &ActivityEvent) -> ClassifiedTrade {
        let classification = self.classify(ledger.target(&ev.market_id), ev);
        let state = ledger.record_target_trade(ev);

        if classification == Classification::Exit && state.is_none() {
            debug!(market = %ev.market_id, "Exit with no remaining target position");
        }

        ClassifiedTrade {
            classification,
            state,
        }
    }
}

impl Default for TradeClassifier {
    fn default() -> Self {
        Self::new(Decimal::from(3))
    }
}
