//! Trading logic: classification, conviction, hedge policy, sizing,
//! slippage, execution and the copy-trading engine.

mod classifier;
mod config;
mod conviction;
mod cooldown;
mod copy_engine;
mod dedup;
mod executor;
mod filters;
mod hedge;
mod ledger;
mod paper;
mod sizing;
mod slippage;

pub use classifier::{Classification, ClassifiedTrade, TradeClassifier};
pub use config::{
    is_valid_address, Credentials, ExecutionConfig, FilterConfig, HedgeConfig, MirrorConfig,
    PaperConfig, SessionConfig, SizingConfig, SlippageConfig,
};
pub use conviction::{ConvictionScore, ConvictionScorer};
pub use cooldown::BlockCooldown;
pub use copy_engine::{CopyDecision, CopyEngine, SkipReason, TradeOutcome};
pub use dedup::Deduplicator;
pub use executor::{limit_price, order_shares, ExecutionReport, ExecutionStatus, Executor, OrderPlan};
pub use filters::{EntryFilter, EntryValidation};
pub use hedge::{DominanceCheck, HedgeBalancer, HedgeDecision, PositionOrigin};
pub use ledger::{CopierFill, PositionLedger, ResolutionResult, TargetMarketState};
pub use paper::{MarketRoll, PaperStats, PaperTrade, PaperTrader};
pub use sizing::{SizeBreakdown, SizeCalculator};
pub use slippage::{SlippageCheck, SlippageGuard, SlippageStats, SlippageVeto};

#[cfg(test)]
pub(crate) use copy_engine::tests as engine_tests;
#[cfg(test)]
pub(crate) use executor::tests as executor_tests;
