//! Copy-trading engine: turns the target's fills into copy orders.
//!
//! Per trade: dedup, classify against the ledger, score conviction, apply
//! entry rules, the dominant-side veto and the hedge policy, size, check the
//! block cooldown, quote, check slippage, execute. Every accepted trade ends
//! in exactly one outcome event (copied, skipped or failed).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::api::TargetPositionSource;
use crate::db::{CopyTradeRecord, Database};
use crate::events::{BotEvent, EventBus};
use crate::models::{classify_market, Activity, ActivityEvent, MarketPosition, Side};

use super::classifier::{Classification, ClassifiedTrade, TradeClassifier};
use super::config::MirrorConfig;
use super::conviction::{ConvictionScore, ConvictionScorer};
use super::dedup::Deduplicator;
use super::executor::{ExecutionReport, ExecutionStatus, Executor, OrderPlan};
use super::filters::EntryFilter;
use super::hedge::HedgeBalancer;
use super::ledger::{PositionLedger, ResolutionResult};
use super::paper::PaperStats;
use super::sizing::SizeCalculator;
use super::slippage::{SlippageGuard, SlippageStats, SlippageVeto};

/// Why a trade was not copied. Business rules, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// SELLs are never mirrored
    ExitNotCopied,
    PriceOutOfRange,
    BelowMinNotional,
    /// BUY on the side the target holds the minority of
    MinoritySide,
    HedgeRatioBelowTarget,
    NearResolution,
    SlippageTooHigh,
    NoLiquidity,
    BlockCooldown,
    InsufficientBalance,
    /// Not enough balance left to balance the position later
    HedgeReserve,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ExitNotCopied => "exit_not_copied",
            SkipReason::PriceOutOfRange => "price_out_of_range",
            SkipReason::BelowMinNotional => "below_min_notional",
            SkipReason::MinoritySide => "minority_side",
            SkipReason::HedgeRatioBelowTarget => "hedge_ratio_below_target",
            SkipReason::NearResolution => "near_resolution",
            SkipReason::SlippageTooHigh => "slippage_too_high",
            SkipReason::NoLiquidity => "no_liquidity",
            SkipReason::BlockCooldown => "block_cooldown",
            SkipReason::InsufficientBalance => "insufficient_balance",
            SkipReason::HedgeReserve => "hedge_reserve",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decision made for one accepted trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CopyDecision {
    pub skip: bool,
    pub skip_reason: Option<SkipReason>,
    pub reason: String,
    pub size_notional: Decimal,
    pub classification: Classification,
    pub conviction_score: u8,
}

impl CopyDecision {
    fn copy(size: Decimal, classification: Classification, conviction: u8, reason: String) -> Self {
        Self {
            skip: false,
            skip_reason: None,
            reason,
            size_notional: size,
            classification,
            conviction_score: conviction,
        }
    }

    fn skipped(skip: SkipReason, reason: impl Into<String>, classification: Classification, conviction: u8) -> Self {
        Self {
            skip: true,
            skip_reason: Some(skip),
            reason: reason.into(),
            size_notional: Decimal::ZERO,
            classification,
            conviction_score: conviction,
        }
    }
}

/// What happened to one activity.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    /// Already processed; no side effects
    Duplicate,
    Copied(ExecutionReport),
    Skipped(SkipReason),
    Failed(ExecutionStatus),
}

/// Sizing, quote and slippage stages; `Err` ends the trade.
type Stage<T> = Result<T, Box<CopyDecision>>;

pub struct CopyEngine {
    config: MirrorConfig,
    ledger: Arc<RwLock<PositionLedger>>,
    executor: Executor,
    events: EventBus,
    journal: Option<Arc<Database>>,

    dedup: Mutex<Deduplicator>,
    conviction: Mutex<ConvictionScorer>,
    slippage: Mutex<SlippageGuard>,
    classifier: TradeClassifier,
    hedge: HedgeBalancer,
    filter: EntryFilter,
    sizer: SizeCalculator,
}

impl CopyEngine {
    pub fn new(
        config: MirrorConfig,
        ledger: Arc<RwLock<PositionLedger>>,
        executor: Executor,
        events: EventBus,
    ) -> Self {
        Self {
            dedup: Mutex::new(Deduplicator::default()),
            conviction: Mutex::new(ConvictionScorer::default()),
            slippage: Mutex::new(SlippageGuard::new(config.slippage.clone())),
            classifier: TradeClassifier::new(config.hedge.major_scale_threshold),
            hedge: HedgeBalancer::offline(config.hedge.clone()),
            filter: EntryFilter::new(config.filters.clone()),
            sizer: SizeCalculator::new(config.sizing.clone()),
            config,
            ledger,
            executor,
            events,
            journal: None,
        }
    }

    /// Consult the target's live positions for hedge and dominance checks.
    pub fn with_positions(mut self, source: Arc<dyn TargetPositionSource>) -> Self {
        self.hedge = HedgeBalancer::new(
            self.config.hedge.clone(),
            self.config.target_wallet.clone(),
            Some(source),
        );
        self
    }

    pub fn with_journal(mut self, journal: Arc<Database>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn ledger(&self) -> &Arc<RwLock<PositionLedger>> {
        &self.ledger
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn is_paper(&self) -> bool {
        self.executor.is_paper()
    }

    /// Mark activities as seen without acting on them. Returns how many
    /// were new.
    pub async fn baseline(&self, activities: &[Activity]) -> usize {
        let mut dedup = self.dedup.lock().await;
        let mut marked = 0;
        for activity in activities {
            let identity = activity.identity();
            if !dedup.is_duplicate(Some(&identity)) {
                dedup.mark_processed(Some(&identity));
                marked += 1;
            }
        }
        marked
    }

    /// Process one decoded activity. Trades go through the copy pipeline,
    /// a target redemption settles our position in that market, anything
    /// else is a no-op.
    pub async fn process_activity(&self, activity: &Activity) -> Option<TradeOutcome> {
        match activity {
            Activity::Trade(ev) => Some(self.process_event(ev).await),
            Activity::Redeem {
                market_id,
                usdc_amount,
                ..
            } => {
                if self.claim(&activity.identity(), activity.id()).await {
                    self.settle_redeemed(market_id, *usdc_amount).await;
                }
                None
            }
            other => {
                debug!(kind = other.kind(), id = ?other.id(), "Ignoring non-trade activity");
                None
            }
        }
    }

    /// Dedup gate. Rows without a transaction hash are keyed on their
    /// composite identity. Returns false for a re-delivery.
    async fn claim(&self, identity: &str, id: Option<&str>) -> bool {
        let mut dedup = self.dedup.lock().await;
        if dedup.is_duplicate(Some(identity)) {
            debug!(id = %identity, "Duplicate activity");
            return false;
        }
        if id.is_none() {
            warn!(identity = %identity, "Activity without transaction hash, keyed on composite identity");
        }
        dedup.mark_processed(Some(identity));
        true
    }

    /// Settle our position in a market the target just redeemed.
    async fn settle_redeemed(&self, market_id: &str, redeemed: Decimal) -> Option<ResolutionResult> {
        let (target, copier) = {
            let ledger = self.ledger.read().await;
            (
                ledger.target(market_id).map(|s| s.position.clone()),
                ledger.copier_market(market_id).cloned(),
            )
        };
        let Some(copier) = copier.filter(|p| !p.is_empty()) else {
            debug!(market = %market_id, "Target redeemed a market we do not hold");
            return None;
        };

        let Some(winner) = redeem_winner(target.as_ref(), &copier, redeemed) else {
            warn!(
                market = %market_id,
                redeemed = %redeemed,
                "Cannot infer the winning outcome from the redemption, position left open"
            );
            return None;
        };

        let mut payouts = [Decimal::ZERO; 2];
        payouts[winner] = Decimal::ONE;
        info!(market = %market_id, redeemed = %redeemed.round_dp(2), winner, "Target redeemed, settling position");
        Some(self.apply_resolution(market_id, payouts).await)
    }

    /// Run one trade through the pipeline.
    pub async fn process_event(&self, ev: &ActivityEvent) -> TradeOutcome {
        if !self.claim(&ev.identity(), ev.id.as_deref()).await {
            return TradeOutcome::Duplicate;
        }

        let classified = {
            let mut ledger = self.ledger.write().await;
            self.classifier.classify_and_record(&mut ledger, ev)
        };
        let classification = classified.classification;

        info!(
            market = %ev.short_title(40),
            side = %ev.side,
            outcome = %ev.outcome_label,
            price = %ev.price,
            notional = %ev.notional.round_dp(2),
            classification = %classification,
            "Target trade detected"
        );
        self.events.emit(BotEvent::TradeDetected {
            at: Utc::now(),
            event_id: ev.identity(),
            market_id: ev.market_id.clone(),
            market_title: ev.market_title.clone(),
            side: ev.side,
            outcome: ev.outcome_label.clone(),
            price: ev.price,
            notional: ev.notional,
            classification,
        });

        let conviction = self.conviction.lock().await.score(
            ev.notional,
            classified.scaling_factor(),
            &ev.market_slug,
            ev.occurred_at,
            classified.is_major_scale(),
        );

        let plan = match self.decide(ev, &classified, &conviction).await {
            Ok(plan) => plan,
            Err(decision) => return self.conclude(ev, &decision, None).await,
        };

        let report = self.executor.execute(&plan, &self.ledger).await;
        let decision = CopyDecision::copy(
            plan.size,
            classification,
            conviction.total(),
            report.reason.clone(),
        );
        self.conclude(ev, &decision, Some(&report)).await
    }

    /// Everything between classification and execution.
    async fn decide(
        &self,
        ev: &ActivityEvent,
        classified: &ClassifiedTrade,
        conviction: &ConvictionScore,
    ) -> Stage<OrderPlan> {
        let classification = classified.classification;
        let score = conviction.total();
        let skip = |reason: SkipReason, detail: String| {
            Box::new(CopyDecision::skipped(reason, detail, classification, score))
        };

        if classification == Classification::Exit {
            return Err(skip(SkipReason::ExitNotCopied, "exit trades are not copied".to_string()));
        }

        let validation = self.filter.validate(ev);
        if !validation.allowed {
            let reason = validation.skip.unwrap_or(SkipReason::PriceOutOfRange);
            return Err(skip(reason, validation.reason));
        }

        let tracked = classified.state.as_ref().map(|s| &s.position);
        if ev.side == Side::Buy {
            let dominance = self
                .hedge
                .is_target_dominant_side(&ev.market_id, ev.outcome_index, tracked)
                .await;
            if !dominance.is_dominant {
                return Err(skip(SkipReason::MinoritySide, dominance.reason));
            }
        }

        let mut notional = ev.notional;
        if classification == Classification::Hedge {
            let primary_side = classified
                .state
                .as_ref()
                .map(|s| s.primary_side)
                .unwrap_or(1 - ev.outcome_index.min(1));
            let position = match self.hedge.target_position(&ev.market_id, tracked).await {
                Some((position, _)) => position,
                None => tracked.cloned().unwrap_or_default(),
            };
            let decision = self.hedge.should_copy_hedge(ev.notional, &position, primary_side);
            if !decision.copy {
                return Err(skip(SkipReason::HedgeRatioBelowTarget, decision.reason));
            }
            info!(market = %ev.market_id, "{}", decision.reason);
            notional = decision.size;
        }

        let size = self.size(ev, notional, classification, conviction, tracked).await;

        if !self.executor.is_paper() {
            if let Some(remaining) = self.executor.cooldown().remaining().await {
                return Err(skip(
                    SkipReason::BlockCooldown,
                    format!("block cooldown active, {}s remaining", remaining.as_secs()),
                ));
            }
        }

        let book_price = self.quote(ev).await.map_err(|reason| skip(SkipReason::NoLiquidity, reason))?;

        let check = self
            .slippage
            .lock()
            .await
            .evaluate(ev.price, book_price, ev.side, &ev.market_id);
        if !check.proceed {
            let reason = match check.veto {
                Some(SlippageVeto::NearResolution) => SkipReason::NearResolution,
                _ => SkipReason::SlippageTooHigh,
            };
            return Err(skip(reason, check.reason));
        }

        Ok(OrderPlan {
            market_id: ev.market_id.clone(),
            market_title: ev.market_title.clone(),
            token_id: ev.token_id.clone(),
            outcome_index: ev.outcome_index,
            side: ev.side,
            classification,
            target_price: ev.price,
            book_price: check.execution_price,
            size,
        })
    }

    async fn size(
        &self,
        ev: &ActivityEvent,
        notional: Decimal,
        classification: Classification,
        conviction: &ConvictionScore,
        tracked: Option<&MarketPosition>,
    ) -> Decimal {
        let asset = classify_market(&format!("{} {}", ev.market_slug, ev.market_title));
        let mut size = self.sizer.calculate(notional, asset, conviction, classification);

        let sizing = self.sizer.config();
        if sizing.apply_target_weight && ev.side == Side::Buy {
            let weight = self
                .hedge
                .target_sizing_weight(&ev.market_id, ev.outcome_index, tracked)
                .await;
            if weight != Decimal::ONE {
                let weighted = size * weight;
                let weighted = if sizing.full_mirror {
                    weighted
                } else {
                    weighted.min(sizing.max_trade_amount)
                };
                info!(weight = %weight.round_dp(2), before = %size.round_dp(2), after = %weighted.round_dp(2), "Target sizing weight applied");
                size = weighted;
            }
        }
        size
    }

    /// Top of book on the trade's side. Paper mode falls back to the
    /// target's price when the book is unavailable.
    async fn quote(&self, ev: &ActivityEvent) -> Result<Decimal, String> {
        match self.executor.best_price(&ev.token_id, ev.side).await {
            Ok(Some(price)) => Ok(price),
            Ok(None) if self.is_paper() => {
                debug!(token = %ev.token_id, "Empty book, paper fill at target price");
                Ok(ev.price)
            }
            Ok(None) => Err("no liquidity on our side of the book".to_string()),
            Err(e) if self.is_paper() => {
                warn!(token = %ev.token_id, error = %e, "Book unavailable, paper fill at target price");
                Ok(ev.price)
            }
            Err(e) => Err(format!("order book unavailable: {}", e)),
        }
    }

    /// Emit the single outcome event, journal it and map to a [`TradeOutcome`].
    async fn conclude(
        &self,
        ev: &ActivityEvent,
        decision: &CopyDecision,
        report: Option<&ExecutionReport>,
    ) -> TradeOutcome {
        let now = Utc::now();
        let outcome = match (decision.skip_reason, report) {
            (Some(reason), _) => {
                info!(market = %ev.short_title(40), reason = %reason, "Skip: {}", decision.reason);
                self.events.emit(BotEvent::TradeSkipped {
                    at: now,
                    event_id: ev.identity(),
                    market_id: ev.market_id.clone(),
                    classification: decision.classification,
                    reason,
                    detail: decision.reason.clone(),
                });
                TradeOutcome::Skipped(reason)
            }
            (None, Some(report)) if report.status.has_fill() => {
                info!(
                    market = %ev.short_title(40),
                    side = %ev.side,
                    size = %decision.size_notional.round_dp(2),
                    shares = %report.filled_shares,
                    price = %report.fill_price,
                    status = %report.status,
                    "Trade copied"
                );
                self.events.emit(BotEvent::TradeCopied {
                    at: now,
                    event_id: ev.identity(),
                    market_id: ev.market_id.clone(),
                    market_title: ev.market_title.clone(),
                    side: ev.side,
                    classification: decision.classification,
                    conviction: decision.conviction_score,
                    size: decision.size_notional,
                    shares: report.filled_shares,
                    price: report.fill_price,
                    status: report.status,
                    order_id: report.order_id.clone(),
                    paper: self.is_paper(),
                });
                if let Ok(balance) = self.executor.balance().await {
                    self.events.emit(BotEvent::balance(balance, self.is_paper()));
                }
                TradeOutcome::Copied(report.clone())
            }
            (None, Some(report)) if report.status == ExecutionStatus::Skipped => {
                let reason = report.skip.unwrap_or(SkipReason::InsufficientBalance);
                info!(market = %ev.short_title(40), reason = %reason, "Skip: {}", report.reason);
                self.events.emit(BotEvent::TradeSkipped {
                    at: now,
                    event_id: ev.identity(),
                    market_id: ev.market_id.clone(),
                    classification: decision.classification,
                    reason,
                    detail: report.reason.clone(),
                });
                TradeOutcome::Skipped(reason)
            }
            (None, report) => {
                let status = report.map(|r| r.status).unwrap_or(ExecutionStatus::Failed);
                let reason = report.map(|r| r.reason.clone()).unwrap_or_default();
                warn!(market = %ev.short_title(40), status = %status, "Trade not copied: {}", reason);
                self.events.emit(BotEvent::TradeFailed {
                    at: now,
                    event_id: ev.identity(),
                    market_id: ev.market_id.clone(),
                    classification: decision.classification,
                    status,
                    reason,
                });
                TradeOutcome::Failed(status)
            }
        };

        self.journal(ev, decision, report, &outcome).await;
        outcome
    }

    async fn journal(
        &self,
        ev: &ActivityEvent,
        decision: &CopyDecision,
        report: Option<&ExecutionReport>,
        outcome: &TradeOutcome,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let status = outcome_status(outcome);
        let reason = match (decision.skip_reason, report) {
            (Some(skip), _) => format!("{}: {}", skip, decision.reason),
            (None, Some(r)) => match r.skip {
                Some(skip) => format!("{}: {}", skip, r.reason),
                None => r.reason.clone(),
            },
            (None, None) => decision.reason.clone(),
        };

        let record = CopyTradeRecord {
            source_event_id: ev.identity(),
            market_id: ev.market_id.clone(),
            market_title: ev.market_title.clone(),
            side: ev.side.as_str().to_string(),
            outcome_index: ev.outcome_index as i64,
            classification: decision.classification.as_str().to_string(),
            conviction: i64::from(decision.conviction_score),
            target_price: ev.price,
            target_notional: ev.notional,
            size: decision.size_notional,
            fill_price: report.filter(|r| r.status.has_fill()).map(|r| r.fill_price),
            filled_shares: report.map(|r| r.filled_shares).unwrap_or_default(),
            status: status.to_string(),
            reason,
            order_id: report.and_then(|r| r.order_id.clone()),
            paper: self.is_paper(),
            detected_at: ev.occurred_at,
        };
        if let Err(e) = journal.record_copy_trade(&record).await {
            warn!(error = %e, "Journal write failed");
        }
    }

    /// Close out a settled market: realize P&L, credit paper cash, forget
    /// cached target state.
    pub async fn apply_resolution(&self, market_id: &str, payout_per_share: [Decimal; 2]) -> ResolutionResult {
        let result = self
            .ledger
            .write()
            .await
            .apply_resolution(market_id, payout_per_share);
        self.executor.credit_resolution(&result).await;
        self.hedge.invalidate(market_id).await;

        if let Ok(balance) = self.executor.balance().await {
            self.events.emit(BotEvent::balance(balance, self.is_paper()));
        }
        result
    }

    /// Drop target markets idle since `cutoff`, along with cached target
    /// positions fetched before it.
    pub async fn prune_targets(&self, cutoff: DateTime<Utc>) -> usize {
        let max_age = (Utc::now() - cutoff).to_std().unwrap_or_default();
        let evicted = self.hedge.prune_cache(max_age).await;
        if evicted > 0 {
            debug!(evicted, "Pruned cached target positions");
        }
        self.ledger.write().await.prune_targets(cutoff)
    }

    pub async fn slippage_stats(&self) -> SlippageStats {
        self.slippage.lock().await.stats()
    }

    pub async fn paper_stats(&self) -> Option<PaperStats> {
        let ledger = self.ledger.read().await;
        self.executor.paper_stats(&ledger).await
    }
}

/// Winning outcome implied by a target redemption of `redeemed` USDC.
///
/// A redemption pays $1 per winning share, so the outcome whose tracked share
/// count is closest to the amount won. Without tracked target shares, a copier
/// holding a single side won it exactly when the target was paid anything.
fn redeem_winner(
    target: Option<&MarketPosition>,
    copier: &MarketPosition,
    redeemed: Decimal,
) -> Option<usize> {
    if let Some(target) = target.filter(|t| !t.is_empty()) {
        let distance0 = (target.shares(0) - redeemed).abs();
        let distance1 = (target.shares(1) - redeemed).abs();
        return match distance0.cmp(&distance1) {
            std::cmp::Ordering::Less => Some(0),
            std::cmp::Ordering::Greater => Some(1),
            std::cmp::Ordering::Equal => None,
        };
    }

    let held: Vec<usize> = (0..2).filter(|&i| copier.shares(i) > Decimal::ZERO).collect();
    match held.as_slice() {
        [side] if redeemed > Decimal::ZERO => Some(*side),
        [side] => Some(1 - *side),
        _ => None,
    }
}

fn outcome_status(outcome: &TradeOutcome) -> &'static str {
    match outcome {
        TradeOutcome::Duplicate => "duplicate",
        TradeOutcome::Copied(r) => r.status.as_str(),
        TradeOutcome::Skipped(_) => ExecutionStatus::Skipped.as_str(),
        TradeOutcome::Failed(status) => status.as_str(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::{ApiError, OrderState};
    use crate::trading::config::{ExecutionConfig, PaperConfig, SizingConfig};
    use crate::trading::executor::tests::{ack, MockExchange};
    use crate::trading::ledger::CopierFill;
    use crate::trading::paper::PaperTrader;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::broadcast;

    pub(crate) const WALLET: &str = "0x1234567890abcdef1234567890abcdef12345678";

    pub(crate) fn config() -> MirrorConfig {
        MirrorConfig {
            target_wallet: WALLET.to_string(),
            dry_run: true,
            sizing: SizingConfig {
                default_ratio: dec!(0.10),
                ..SizingConfig::default()
            },
            ..MirrorConfig::default()
        }
    }

    pub(crate) fn trade(id: Option<&str>, market: &str, outcome: usize, side: Side, shares: Decimal, price: Decimal) -> ActivityEvent {
        ActivityEvent {
            id: id.map(str::to_string),
            occurred_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            market_id: market.to_string(),
            market_title: "Will it rain tomorrow?".to_string(),
            market_slug: String::new(),
            token_id: format!("{}-{}", market, outcome),
            outcome_index: outcome,
            outcome_label: if outcome == 0 { "Yes" } else { "No" }.to_string(),
            side,
            price,
            notional: shares * price,
            shares,
        }
    }

    pub(crate) fn paper_engine(exchange: MockExchange) -> (Arc<MockExchange>, CopyEngine) {
        let exchange = Arc::new(exchange);
        let config = config();
        let executor = Executor::paper(
            exchange.clone(),
            config.execution.clone(),
            config.slippage.limit_buffer,
            PaperTrader::new(PaperConfig::default()),
        );
        let ledger = Arc::new(RwLock::new(PositionLedger::new()));
        (exchange, CopyEngine::new(config, ledger, executor, EventBus::default()))
    }

    fn live_engine(exchange: MockExchange) -> (Arc<MockExchange>, CopyEngine) {
        let exchange = Arc::new(exchange);
        let config = config();
        let executor = Executor::live(
            exchange.clone(),
            ExecutionConfig {
                stale_order_timeout: Duration::from_millis(5),
                ..config.execution.clone()
            },
            config.slippage.limit_buffer,
        );
        let ledger = Arc::new(RwLock::new(PositionLedger::new()));
        (exchange, CopyEngine::new(config, ledger, executor, EventBus::default()))
    }

    fn drain(rx: &mut broadcast::Receiver<BotEvent>) -> Vec<BotEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn outcome_events(events: &[BotEvent]) -> usize {
        events.iter().filter(|e| e.is_trade_outcome()).count()
    }

    #[tokio::test]
    async fn test_initial_entry_is_sized_and_copied() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        let mut rx = engine.events.subscribe();

        let ev = trade(Some("0xa"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40));
        let outcome = engine.process_event(&ev).await;

        let TradeOutcome::Copied(report) = outcome else {
            panic!("expected copy");
        };
        assert_eq!(report.fill_price, dec!(0.41));
        assert_eq!(report.filled_shares, dec!(7.00));

        let events = drain(&mut rx);
        assert_eq!(events[0].kind(), "trade_detected");
        assert_eq!(outcome_events(&events), 1);
        let copied = events
            .iter()
            .find_map(|e| match e {
                BotEvent::TradeCopied { size, conviction, classification, .. } => {
                    Some((*size, *conviction, *classification))
                }
                _ => None,
            })
            .unwrap();
        // $40 x 0.10 x (0.5 + 0.28 x 1.5) x 0.6 x 1.3
        assert_eq!(copied.0.round_dp(4), dec!(2.8704));
        assert_eq!(copied.1, 28);
        assert_eq!(copied.2, Classification::InitialEntry);

        let ledger = engine.ledger().read().await;
        assert_eq!(ledger.copier_position("0xm", "0xm-0").unwrap().shares, dec!(7.00));
    }

    #[tokio::test]
    async fn test_hedge_below_target_ratio_is_skipped() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.51)));
        let mut rx = engine.events.subscribe();

        let first = trade(Some("0x1"), "0xb", 0, Side::Buy, dec!(5.1), dec!(0.50));
        assert!(matches!(engine.process_event(&first).await, TradeOutcome::Copied(_)));

        // 0.9 / 6.0 = 15% hedge, early position so dominance allows it
        let hedge = trade(Some("0x2"), "0xb", 1, Side::Buy, dec!(0.9), dec!(0.50));
        let outcome = engine.process_event(&hedge).await;
        assert_eq!(outcome, TradeOutcome::Skipped(SkipReason::HedgeRatioBelowTarget));

        let (detail, classification) = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                BotEvent::TradeSkipped { detail, classification, .. } => Some((detail, classification)),
                _ => None,
            })
            .unwrap();
        assert!(detail.contains("below target"));
        assert_eq!(classification, Classification::Hedge);
    }

    #[tokio::test]
    async fn test_minority_side_is_vetoed() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));

        engine
            .process_event(&trade(Some("0x1"), "0xc", 0, Side::Buy, dec!(85), dec!(0.40)))
            .await;
        let outcome = engine
            .process_event(&trade(Some("0x2"), "0xc", 1, Side::Buy, dec!(15), dec!(0.40)))
            .await;
        assert_eq!(outcome, TradeOutcome::Skipped(SkipReason::MinoritySide));
    }

    #[tokio::test]
    async fn test_duplicate_is_processed_once() {
        let (exchange, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        let mut rx = engine.events.subscribe();
        let ev = trade(Some("0xdup"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40));

        assert!(matches!(engine.process_event(&ev).await, TradeOutcome::Copied(_)));
        assert_eq!(engine.process_event(&ev).await, TradeOutcome::Duplicate);

        assert_eq!(outcome_events(&drain(&mut rx)), 1);
        assert_eq!(exchange.calls(), 1);
        let ledger = engine.ledger().read().await;
        assert_eq!(ledger.copier_position("0xm", "0xm-0").unwrap().shares, dec!(7.00));
        assert_eq!(ledger.target("0xm").unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_missing_id_is_deduplicated_on_identity() {
        let (exchange, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        let ev = trade(None, "0xm", 0, Side::Buy, dec!(100), dec!(0.40));

        assert!(matches!(engine.process_event(&ev).await, TradeOutcome::Copied(_)));
        let calls = exchange.calls();
        assert_eq!(engine.process_event(&ev).await, TradeOutcome::Duplicate);
        assert_eq!(exchange.calls(), calls);
        assert_eq!(engine.ledger().read().await.target("0xm").unwrap().entry_count, 1);

        // Same second, other outcome: a different trade
        let other = trade(None, "0xm", 1, Side::Buy, dec!(100), dec!(0.40));
        assert_ne!(engine.process_event(&other).await, TradeOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_baseline_marks_activity_without_id() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        let ev = trade(None, "0xm", 0, Side::Buy, dec!(100), dec!(0.40));

        assert_eq!(engine.baseline(&[Activity::Trade(ev.clone())]).await, 1);
        assert_eq!(engine.process_event(&ev).await, TradeOutcome::Duplicate);
        assert!(engine.ledger().read().await.target("0xm").is_none());
    }

    #[tokio::test]
    async fn test_target_redeem_settles_paper_position() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        let ev = trade(Some("0xa"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40));
        assert!(matches!(engine.process_event(&ev).await, TradeOutcome::Copied(_)));
        assert_eq!(engine.executor().balance().await.unwrap(), dec!(997.13));

        // Target held 100 shares of outcome 0 and redeemed $100
        let redeem = Activity::Redeem {
            id: Some("0xredeem".to_string()),
            occurred_at: Utc.timestamp_opt(1_700_000_900, 0).unwrap(),
            market_id: "0xm".to_string(),
            usdc_amount: dec!(100),
        };
        assert_eq!(engine.process_activity(&redeem).await, None);

        let ledger = engine.ledger().read().await;
        assert!(ledger.copier_position("0xm", "0xm-0").is_none());
        assert_eq!(ledger.realized_pnl(), dec!(4.13));
        drop(ledger);
        assert_eq!(engine.executor().balance().await.unwrap(), dec!(1004.13));

        // Re-delivery settles nothing twice
        engine.process_activity(&redeem).await;
        assert_eq!(engine.executor().balance().await.unwrap(), dec!(1004.13));
    }

    #[test]
    fn test_redeem_winner() {
        let mut target = MarketPosition::default();
        target.apply_buy(0, dec!(85), dec!(34));
        target.apply_buy(1, dec!(15), dec!(6));
        let mut copier = MarketPosition::default();
        copier.apply_buy(1, dec!(5), dec!(2));

        assert_eq!(redeem_winner(Some(&target), &copier, dec!(85)), Some(0));
        assert_eq!(redeem_winner(Some(&target), &copier, dec!(15)), Some(1));
        assert_eq!(redeem_winner(Some(&target), &copier, dec!(50)), None);

        // No tracked target shares: decide from the single side we hold
        assert_eq!(redeem_winner(None, &copier, dec!(12)), Some(1));
        assert_eq!(redeem_winner(None, &copier, Decimal::ZERO), Some(0));
        copier.apply_buy(0, dec!(5), dec!(2));
        assert_eq!(redeem_winner(None, &copier, dec!(12)), None);
    }

    #[tokio::test]
    async fn test_block_triggers_cooldown_without_further_calls() {
        let exchange = MockExchange::new(dec!(0.41)).respond(Err(ApiError::Blocked("403 Forbidden".to_string())));
        let (exchange, engine) = live_engine(exchange);
        let mut rx = engine.events.subscribe();

        let first = trade(Some("0x1"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40));
        assert_eq!(engine.process_event(&first).await, TradeOutcome::Failed(ExecutionStatus::Blocked));

        let calls = exchange.calls();
        let second = trade(Some("0x2"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40));
        assert_eq!(engine.process_event(&second).await, TradeOutcome::Skipped(SkipReason::BlockCooldown));
        assert_eq!(exchange.calls(), calls);

        let events = drain(&mut rx);
        assert_eq!(outcome_events(&events), 2);
        assert!(events.iter().any(|e| matches!(e, BotEvent::TradeFailed { status: ExecutionStatus::Blocked, .. })));
    }

    #[tokio::test]
    async fn test_live_fill_after_gtc() {
        let exchange = MockExchange::new(dec!(0.41))
            .respond(Ok(ack(OrderState::Unmatched)))
            .respond(Ok(ack(OrderState::Matched)));
        let (_, engine) = live_engine(exchange);

        let ev = trade(Some("0x1"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40));
        let TradeOutcome::Copied(report) = engine.process_event(&ev).await else {
            panic!("expected copy");
        };
        assert_eq!(report.order_id.as_deref(), Some("0xorder"));
    }

    #[tokio::test]
    async fn test_exit_and_filters_skip() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));

        engine
            .process_event(&trade(Some("0x1"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40)))
            .await;
        let exit = trade(Some("0x2"), "0xm", 0, Side::Sell, dec!(50), dec!(0.45));
        assert_eq!(engine.process_event(&exit).await, TradeOutcome::Skipped(SkipReason::ExitNotCopied));

        let cheap = trade(Some("0x3"), "0xn", 0, Side::Buy, dec!(100), dec!(0.10));
        assert_eq!(engine.process_event(&cheap).await, TradeOutcome::Skipped(SkipReason::PriceOutOfRange));
    }

    #[tokio::test]
    async fn test_slippage_veto() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.50)));
        let ev = trade(Some("0x1"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40));
        assert_eq!(engine.process_event(&ev).await, TradeOutcome::Skipped(SkipReason::SlippageTooHigh));

        let (_, engine) = paper_engine(MockExchange::new(dec!(0.92)));
        let ev = trade(Some("0x1"), "0xm", 0, Side::Buy, dec!(100), dec!(0.84));
        assert_eq!(engine.process_event(&ev).await, TradeOutcome::Skipped(SkipReason::NearResolution));
        assert_eq!(engine.slippage_stats().await.skipped, 1);
    }

    #[tokio::test]
    async fn test_baseline_and_non_trade_activity() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        let ev = trade(Some("0xold"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40));
        let redeem = Activity::Redeem {
            id: Some("0xredeem".to_string()),
            occurred_at: Utc::now(),
            market_id: "0xm".to_string(),
            usdc_amount: dec!(10),
        };

        assert_eq!(engine.baseline(&[Activity::Trade(ev.clone()), redeem.clone()]).await, 2);
        assert_eq!(engine.process_event(&ev).await, TradeOutcome::Duplicate);
        assert_eq!(engine.process_activity(&redeem).await, None);
        assert_eq!(engine.ledger().read().await.target_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_resolution_credits_paper_cash() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        engine.ledger().write().await.apply_copier_fill(&CopierFill {
            market_id: "0xe".to_string(),
            token_id: "0xe-0".to_string(),
            outcome_index: 0,
            market_title: String::new(),
            side: Side::Buy,
            shares: dec!(10),
            price: dec!(0.30),
        });

        let result = engine.apply_resolution("0xe", [Decimal::ONE, Decimal::ZERO]).await;
        assert_eq!(result.payout, dec!(10));
        assert_eq!(result.pnl, dec!(7));
        assert!(engine.ledger().read().await.copier_position("0xe", "0xe-0").is_none());
        assert_eq!(engine.executor().balance().await.unwrap(), dec!(1010));
    }

    #[tokio::test]
    async fn test_decisions_are_journaled() {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        let journal = Arc::new(Database::in_memory().await.unwrap());
        let engine = engine.with_journal(journal.clone());

        engine
            .process_event(&trade(Some("0x1"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40)))
            .await;
        engine
            .process_event(&trade(Some("0x2"), "0xm", 0, Side::Sell, dec!(50), dec!(0.45)))
            .await;

        let rows = journal.recent_copy_trades(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.status == "filled" && r.classification == "initial_entry"));
        assert!(rows.iter().any(|r| r.status == "skipped" && r.reason.starts_with("exit_not_copied")));
    }
}
