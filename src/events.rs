//! Events emitted by the pipeline and the session for UIs and logs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::Side;
use crate::session::{SessionState, SessionStats};
use crate::trading::{Classification, ExecutionStatus, SkipReason};

/// Default number of events buffered per subscriber.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    BotStateChanged {
        at: DateTime<Utc>,
        state: SessionState,
        error: Option<String>,
    },
    TradeDetected {
        at: DateTime<Utc>,
        event_id: String,
        market_id: String,
        market_title: String,
        side: Side,
        outcome: String,
        price: Decimal,
        notional: Decimal,
        classification: Classification,
    },
    TradeCopied {
        at: DateTime<Utc>,
        event_id: String,
        market_id: String,
        market_title: String,
        side: Side,
        classification: Classification,
        conviction: u8,
        size: Decimal,
        shares: Decimal,
        price: Decimal,
        status: ExecutionStatus,
        order_id: Option<String>,
        paper: bool,
    },
    TradeSkipped {
        at: DateTime<Utc>,
        event_id: String,
        market_id: String,
        classification: Classification,
        reason: SkipReason,
        detail: String,
    },
    TradeFailed {
        at: DateTime<Utc>,
        event_id: String,
        market_id: String,
        classification: Classification,
        status: ExecutionStatus,
        reason: String,
    },
    StatusUpdate {
        at: DateTime<Utc>,
        stats: SessionStats,
    },
    BalanceUpdate {
        at: DateTime<Utc>,
        balance: Decimal,
        paper: bool,
    },
}

impl BotEvent {
    pub fn state_changed(state: SessionState, error: Option<String>) -> Self {
        BotEvent::BotStateChanged {
            at: Utc::now(),
            state,
            error,
        }
    }

    pub fn status(stats: SessionStats) -> Self {
        BotEvent::StatusUpdate { at: Utc::now(), stats }
    }

    pub fn balance(balance: Decimal, paper: bool) -> Self {
        BotEvent::BalanceUpdate {
            at: Utc::now(),
            balance,
            paper,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BotEvent::BotStateChanged { .. } => "bot_state_changed",
            BotEvent::TradeDetected { .. } => "trade_detected",
            BotEvent::TradeCopied { .. } => "trade_copied",
            BotEvent::TradeSkipped { .. } => "trade_skipped",
            BotEvent::TradeFailed { .. } => "trade_failed",
            BotEvent::StatusUpdate { .. } => "status_update",
            BotEvent::BalanceUpdate { .. } => "balance_update",
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            BotEvent::BotStateChanged { at, .. }
            | BotEvent::TradeDetected { at, .. }
            | BotEvent::TradeCopied { at, .. }
            | BotEvent::TradeSkipped { at, .. }
            | BotEvent::TradeFailed { at, .. }
            | BotEvent::StatusUpdate { at, .. }
            | BotEvent::BalanceUpdate { at, .. } => *at,
        }
    }

    /// Copied, skipped or failed: the single terminal event of a trade.
    pub fn is_trade_outcome(&self) -> bool {
        matches!(
            self,
            BotEvent::TradeCopied { .. } | BotEvent::TradeSkipped { .. } | BotEvent::TradeFailed { .. }
        )
    }
}

/// Fan-out of [`BotEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BotEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is fine.
    pub fn emit(&self, event: BotEvent) {
        trace!(kind = event.kind(), "Event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(BotEvent::state_changed(SessionState::Running, None));
        bus.emit(BotEvent::balance(Decimal::ONE_HUNDRED, true));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "bot_state_changed");
        assert!(!first.is_trade_outcome());
        assert_eq!(rx.recv().await.unwrap().kind(), "balance_update");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(BotEvent::state_changed(SessionState::Stopped, Some("boom".to_string())));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialized_shape() {
        let event = BotEvent::state_changed(SessionState::Stopping, None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "bot_state_changed");
        assert_eq!(json["state"], "stopping");
        assert!(json["at"].is_string());
    }
}
