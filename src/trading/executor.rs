//! Order execution: paper-simulated fills or live FOK/GTC orders.
//!
//! Live orders are priced at the book, bounded by the target's price plus a
//! buffer. A fill-or-kill order goes first; if it does not match, a resting
//! GTC order is placed, left for the stale timeout, checked for partial fills
//! and cancelled. Whatever filled is applied to the [`PositionLedger`] once.

use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, ExchangeClient, OrderAck, OrderRequest, OrderState, OrderType};
use crate::cache::TtlCache;
use crate::models::Side;

use super::classifier::Classification;
use super::config::ExecutionConfig;
use super::cooldown::BlockCooldown;
use super::copy_engine::SkipReason;
use super::ledger::{CopierFill, PositionLedger, ResolutionResult};
use super::paper::{PaperStats, PaperTrader};

/// Lowest and highest tradable limit prices.
const MIN_LIMIT_PRICE: Decimal = dec!(0.01);
const MAX_LIMIT_PRICE: Decimal = dec!(0.99);

/// Terminal state of one order attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Filled,
    PartiallyFilled,
    Cancelled,
    Blocked,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Filled => "filled",
            ExecutionStatus::PartiallyFilled => "partially_filled",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Blocked => "blocked",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    /// Some shares changed hands.
    pub fn has_fill(&self) -> bool {
        matches!(self, ExecutionStatus::Filled | ExecutionStatus::PartiallyFilled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sized, slippage-checked copy order.
#[derive(Debug, Clone)]
pub struct OrderPlan {
    pub market_id: String,
    pub market_title: String,
    pub token_id: String,
    pub outcome_index: usize,
    pub side: Side,
    pub classification: Classification,

    /// Target's fill price
    pub target_price: Decimal,

    /// Current top of book on our side
    pub book_price: Decimal,

    /// Order notional in USDC
    pub size: Decimal,
}

/// Outcome of [`Executor::execute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub requested_shares: Decimal,
    pub filled_shares: Decimal,
    pub fill_price: Decimal,
    pub notional: Decimal,
    pub order_id: Option<String>,
    pub reason: String,
    pub skip: Option<SkipReason>,
}

impl ExecutionReport {
    fn skipped(skip: SkipReason, reason: impl Into<String>) -> Self {
        Self::empty(ExecutionStatus::Skipped, reason).with_skip(skip)
    }

    fn empty(status: ExecutionStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            requested_shares: Decimal::ZERO,
            filled_shares: Decimal::ZERO,
            fill_price: Decimal::ZERO,
            notional: Decimal::ZERO,
            order_id: None,
            reason: reason.into(),
            skip: None,
        }
    }

    fn with_skip(mut self, skip: SkipReason) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Limit price for a live order: the book price, but never worse than the
/// target's price moved by `buffer`.
pub fn limit_price(side: Side, book: Decimal, target: Decimal, buffer: Decimal) -> Decimal {
    let price = match side {
        Side::Buy => book.min(round_price(target * (Decimal::ONE + buffer))),
        Side::Sell => book.max(round_price(target * (Decimal::ONE - buffer))),
    };
    price.max(MIN_LIMIT_PRICE).min(MAX_LIMIT_PRICE)
}

/// Share count for `notional` at `price`, honoring venue minimums.
///
/// Rounded down to 2 dp, raised to `min_shares`, then raised again until the
/// order notional reaches `min_notional`.
pub fn order_shares(notional: Decimal, price: Decimal, min_shares: Decimal, min_notional: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let mut shares = (notional / price).round_dp_with_strategy(2, RoundingStrategy::ToZero);
    if shares < min_shares {
        debug!(shares = %shares, min = %min_shares, "Share count below venue minimum, adjusting");
        shares = min_shares;
    }
    if shares * price < min_notional {
        let needed = (min_notional / price).round_dp_with_strategy(2, RoundingStrategy::AwayFromZero);
        shares = shares.max(needed);
    }
    shares
}

fn round_price(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub struct Executor {
    client: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    limit_buffer: Decimal,
    paper: Option<Mutex<PaperTrader>>,
    cooldown: BlockCooldown,
    balance: Mutex<TtlCache<(), Decimal>>,
}

impl Executor {
    /// Executor that places real orders through `client`.
    pub fn live(client: Arc<dyn ExchangeClient>, config: ExecutionConfig, limit_buffer: Decimal) -> Self {
        let balance = TtlCache::new(config.balance_ttl)
            .with_invalidation_hook(|_| debug!("Balance cache invalidated"));
        Self {
            client,
            cooldown: BlockCooldown::new(config.block_cooldown),
            config,
            limit_buffer,
            paper: None,
            balance: Mutex::new(balance),
        }
    }

    /// Executor that simulates fills; `client` is only used for quotes.
    pub fn paper(
        client: Arc<dyn ExchangeClient>,
        config: ExecutionConfig,
        limit_buffer: Decimal,
        trader: PaperTrader,
    ) -> Self {
        let mut executor = Self::live(client, config, limit_buffer);
        executor.paper = Some(Mutex::new(trader));
        executor
    }

    pub fn is_paper(&self) -> bool {
        self.paper.is_some()
    }

    pub fn cooldown(&self) -> &BlockCooldown {
        &self.cooldown
    }

    /// Best price on our side of the book: ask for BUY, bid for SELL.
    ///
    /// Token metadata is pre-warmed concurrently so a following submission
    /// does not pay for it.
    pub async fn best_price(&self, token_id: &str, side: Side) -> Result<Option<Decimal>, ApiError> {
        let (book, warm) = futures::join!(self.client.order_book(token_id), self.client.prewarm(token_id));
        if let Err(e) = warm {
            debug!(token = %token_id, error = %e, "Pre-warm failed");
        }
        let book = book?;
        Ok(match side {
            Side::Buy => book.best_ask(),
            Side::Sell => book.best_bid(),
        })
    }

    /// Free collateral. Paper cash in paper mode, otherwise the cached
    /// exchange balance.
    pub async fn balance(&self) -> Result<Decimal, ApiError> {
        if let Some(paper) = &self.paper {
            return Ok(paper.lock().await.cash());
        }

        if let Some(balance) = self.balance.lock().await.get(&()) {
            return Ok(balance);
        }
        let balance = self.client.collateral_balance().await?;
        self.balance.lock().await.insert((), balance);
        if balance < self.config.low_balance_warning {
            warn!(balance = %balance.round_dp(2), threshold = %self.config.low_balance_warning, "Low USDC balance");
        }
        Ok(balance)
    }

    pub async fn invalidate_balance(&self) {
        self.balance.lock().await.invalidate(&());
    }

    /// Credit a resolution payout to paper cash. No-op when live; the
    /// venue redeems on-chain.
    pub async fn credit_resolution(&self, result: &ResolutionResult) {
        if let Some(paper) = &self.paper {
            paper.lock().await.credit_resolution(result);
        }
        self.invalidate_balance().await;
    }

    pub async fn paper_stats(&self, ledger: &PositionLedger) -> Option<PaperStats> {
        let paper = self.paper.as_ref()?;
        Some(paper.lock().await.stats(ledger, &Default::default()))
    }

    /// Execute `plan` and apply any fill to `ledger`.
    pub async fn execute(&self, plan: &OrderPlan, ledger: &RwLock<PositionLedger>) -> ExecutionReport {
        let report = if self.is_paper() {
            self.execute_paper(plan).await
        } else {
            self.execute_live(plan).await
        };

        if report.status.has_fill() {
            let fill = CopierFill {
                market_id: plan.market_id.clone(),
                token_id: plan.token_id.clone(),
                outcome_index: plan.outcome_index,
                market_title: plan.market_title.clone(),
                side: plan.side,
                shares: report.filled_shares,
                price: report.fill_price,
            };
            ledger.write().await.apply_copier_fill(&fill);
            self.invalidate_balance().await;
        }
        report
    }

    async fn execute_paper(&self, plan: &OrderPlan) -> ExecutionReport {
        let Some(paper) = &self.paper else {
            return ExecutionReport::empty(ExecutionStatus::Failed, "paper trader not configured");
        };

        // Paper fills at the book, not the target's price
        let price = plan.book_price;
        let shares = order_shares(plan.size, price, self.config.min_shares, self.config.min_order_notional);
        if shares.is_zero() {
            return ExecutionReport::empty(ExecutionStatus::Failed, "invalid book price");
        }

        let roll = paper.lock().await.roll_market(shares * price);
        if !roll.delay.is_zero() {
            tokio::time::sleep(roll.delay).await;
        }

        let mut paper = paper.lock().await;
        if roll.rejected {
            paper.record_rejection();
            warn!(market = %plan.market_id, "Simulated order rejection");
            return ExecutionReport {
                requested_shares: shares,
                ..ExecutionReport::empty(ExecutionStatus::Failed, "simulated rejection")
            };
        }

        match paper.apply_fill(&plan.market_id, &plan.token_id, plan.side, shares, price, roll.fill_fraction) {
            Ok(trade) => {
                let status = if trade.partial {
                    ExecutionStatus::PartiallyFilled
                } else {
                    ExecutionStatus::Filled
                };
                info!(
                    market = %plan.market_id,
                    side = %plan.side,
                    shares = %trade.shares,
                    price = %trade.price,
                    cash = %paper.cash().round_dp(2),
                    "[PAPER] Order filled"
                );
                ExecutionReport {
                    status,
                    requested_shares: shares,
                    filled_shares: trade.shares,
                    fill_price: trade.price,
                    notional: trade.notional,
                    order_id: None,
                    reason: format!("paper {}", status),
                    skip: None,
                }
            }
            Err(reason) => ExecutionReport {
                requested_shares: shares,
                ..ExecutionReport::skipped(SkipReason::InsufficientBalance, reason)
            },
        }
    }

    async fn execute_live(&self, plan: &OrderPlan) -> ExecutionReport {
        if let Some(remaining) = self.cooldown.remaining().await {
            return ExecutionReport::skipped(
                SkipReason::BlockCooldown,
                format!("block cooldown active, {}s remaining", remaining.as_secs()),
            );
        }

        let price = limit_price(plan.side, plan.book_price, plan.target_price, self.limit_buffer);
        let shares = order_shares(plan.size, price, self.config.min_shares, self.config.min_order_notional);
        if shares.is_zero() {
            return ExecutionReport::empty(ExecutionStatus::Failed, "invalid limit price");
        }
        let notional = (shares * price).round_dp(2);

        info!(
            market = %plan.market_id,
            side = %plan.side,
            shares = %shares,
            price = %price,
            notional = %notional,
            target = %plan.target_price,
            book = %plan.book_price,
            "Order details"
        );

        if plan.side == Side::Buy {
            match self.balance().await {
                Ok(balance) if balance < notional => {
                    return ExecutionReport::skipped(
                        SkipReason::InsufficientBalance,
                        format!("need ${}, have ${}", notional, balance.round_dp(2)),
                    );
                }
                Ok(balance) => {
                    let reserve = notional * self.config.hedge_reserve_multiplier;
                    if balance < reserve {
                        warn!(required = %reserve, balance = %balance.round_dp(2), "Hedge reserve not met");
                        return ExecutionReport::skipped(
                            SkipReason::HedgeReserve,
                            format!("need ${} for a balanced position, have ${}", reserve, balance.round_dp(2)),
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Balance unavailable, submitting anyway"),
            }
        }

        let mut request = OrderRequest {
            token_id: plan.token_id.clone(),
            side: plan.side,
            price,
            shares,
            order_type: OrderType::Fok,
        };

        match self.client.place_order(&request).await {
            Ok(ack) if ack.state == OrderState::Matched => {
                return filled(&ack, shares, price);
            }
            Ok(ack) => {
                info!(order = %ack.order_id, state = ?ack.state, "FOK not matched, trying GTC");
            }
            Err(e) if e.is_blocked() => return self.blocked(e).await,
            Err(e) => {
                warn!(error = %e, "FOK order failed, trying GTC");
            }
        }

        request.order_type = OrderType::Gtc;
        let ack = match self.client.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) if e.is_blocked() => return self.blocked(e).await,
            Err(e) => {
                error!(market = %plan.market_id, error = %e, "Order submission failed");
                return ExecutionReport {
                    requested_shares: shares,
                    ..ExecutionReport::empty(ExecutionStatus::Failed, e.to_string())
                };
            }
        };

        match ack.state {
            OrderState::Matched => filled(&ack, shares, price),
            OrderState::Live | OrderState::Delayed => self.await_resting(ack, shares, price).await,
            state => ExecutionReport {
                requested_shares: shares,
                order_id: Some(ack.order_id),
                ..ExecutionReport::empty(ExecutionStatus::Failed, format!("order not accepted ({:?})", state))
            },
        }
    }

    /// Wait out the stale timeout, record any partial fill, then cancel.
    async fn await_resting(&self, ack: OrderAck, shares: Decimal, price: Decimal) -> ExecutionReport {
        info!(
            order = %ack.order_id,
            timeout_ms = self.config.stale_order_timeout.as_millis() as u64,
            "GTC order live, waiting for fill"
        );
        tokio::time::sleep(self.config.stale_order_timeout).await;

        let matched = match self.client.order_status(&ack.order_id).await {
            Ok(fill) if fill.state == OrderState::Matched => return filled(&ack, shares, price),
            Ok(fill) => fill.size_matched.min(shares),
            Err(e) => {
                debug!(order = %ack.order_id, error = %e, "Order status unavailable");
                Decimal::ZERO
            }
        };

        match self.client.cancel_order(&ack.order_id).await {
            Ok(true) if matched > Decimal::ZERO => {
                warn!(order = %ack.order_id, filled = %matched, requested = %shares, "Partial fill before cancel");
                ExecutionReport {
                    status: ExecutionStatus::PartiallyFilled,
                    requested_shares: shares,
                    filled_shares: matched,
                    fill_price: price,
                    notional: matched * price,
                    order_id: Some(ack.order_id),
                    reason: "partial fill, remainder cancelled".to_string(),
                    skip: None,
                }
            }
            Ok(true) => {
                info!(order = %ack.order_id, "Cancelled stale order");
                ExecutionReport {
                    requested_shares: shares,
                    order_id: Some(ack.order_id),
                    ..ExecutionReport::empty(ExecutionStatus::Cancelled, "stale order cancelled")
                }
            }
            Ok(false) | Err(_) => {
                // The order most likely filled while we waited
                info!(order = %ack.order_id, "Cancel failed, assuming filled");
                filled(&ack, shares, price)
            }
        }
    }

    async fn blocked(&self, e: ApiError) -> ExecutionReport {
        self.cooldown.trigger(&e.to_string()).await;
        ExecutionReport::empty(ExecutionStatus::Blocked, e.to_string())
    }
}

fn filled(ack: &OrderAck, shares: Decimal, price: Decimal) -> ExecutionReport {
    info!(order = %ack.order_id, shares = %shares, price = %price, "Order filled");
    ExecutionReport {
        status: ExecutionStatus::Filled,
        requested_shares: shares,
        filled_shares: shares,
        fill_price: price,
        notional: shares * price,
        order_id: Some(ack.order_id.clone()),
        reason: "filled".to_string(),
        skip: None,
    }
}
