//! Session lifecycle: start/stop state machine around the poll loop.
//!
//! Handles:
//! - Validating the configuration before a session may run
//! - Baselining existing activity so history is never copied
//! - Polling the monitored account and replaying new activity oldest-first
//! - Periodic status events and idle-market pruning
//! - Graceful stop with a timeout, and an immediate kill path
//! - Closing the session when the poll loop crashes

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::ActivitySource;
use crate::db::Database;
use crate::events::{BotEvent, EventBus};
use crate::trading::{CopyEngine, MirrorConfig, SkipReason, TradeOutcome};

/// Target markets without trades for this long are dropped from the ledger.
const TARGET_IDLE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// New target trades seen (duplicates excluded)
    pub detected: u64,
    pub copied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub polls: u64,
    pub poll_errors: u64,
    pub skip_reasons: BTreeMap<SkipReason, u64>,
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionStats {
    pub fn record(&mut self, outcome: &TradeOutcome) {
        match outcome {
            TradeOutcome::Duplicate => self.duplicates += 1,
            TradeOutcome::Copied(_) => {
                self.detected += 1;
                self.copied += 1;
            }
            TradeOutcome::Skipped(reason) => {
                self.detected += 1;
                self.skipped += 1;
                *self.skip_reasons.entry(*reason).or_insert(0) += 1;
            }
            TradeOutcome::Failed(_) => {
                self.detected += 1;
                self.failed += 1;
            }
        }
    }
}

impl std::fmt::Display for SessionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^50}", " SESSION SUMMARY ")?;
        if let Some(started) = self.started_at {
            writeln!(f, "Started:          {}", started.format("%Y-%m-%d %H:%M:%S"))?;
        }
        writeln!(f, "Polls:            {} ({} failed)", self.polls, self.poll_errors)?;
        writeln!(f, "Trades Detected:  {}", self.detected)?;
        writeln!(f, "Copied:           {}", self.copied)?;
        writeln!(f, "Skipped:          {}", self.skipped)?;
        writeln!(f, "Failed:           {}", self.failed)?;
        writeln!(f, "Duplicates:       {}", self.duplicates)?;
        if !self.skip_reasons.is_empty() {
            writeln!(f, "\nSkip reasons:")?;
            for (reason, count) in &self.skip_reasons {
                writeln!(f, "  {:<26} {}", reason.as_str(), count)?;
            }
        }
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}

/// A running poll loop.
struct RunHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<LoopExit>,
    session_id: Option<i64>,
}

/// How the poll task ended.
struct LoopExit {
    /// Handed back so a restart can reuse it
    poke: Option<mpsc::Receiver<()>>,

    /// The loop crashed and the task already closed the session
    crashed: bool,
}

/// The pieces of the controller needed to close a session, shared with the
/// poll task so a crash can close it without the controller.
#[derive(Clone)]
struct Closer {
    state: Arc<RwLock<SessionState>>,
    stats: Arc<Mutex<SessionStats>>,
    events: EventBus,
    journal: Option<Arc<Database>>,
}

impl Closer {
    async fn set_state(&self, state: SessionState, error: Option<String>) {
        let previous = std::mem::replace(&mut *self.state.write().await, state);
        match &error {
            Some(e) => error!(from = %previous, to = %state, error = %e, "Session state changed"),
            None => info!(from = %previous, to = %state, "Session state changed"),
        }
        self.events.emit(BotEvent::state_changed(state, error));
    }

    /// Final status event, journal row and Stopped transition.
    async fn finish(&self, session_id: Option<i64>, error: Option<String>) -> SessionStats {
        let stats = self.stats.lock().await.clone();
        self.events.emit(BotEvent::status(stats.clone()));

        if let (Some(journal), Some(id)) = (&self.journal, session_id) {
            if let Err(e) = journal.finish_session(id, &stats, error.as_deref()).await {
                warn!(error = %e, "Could not journal session end");
            }
        }

        info!(
            detected = stats.detected,
            copied = stats.copied,
            skipped = stats.skipped,
            failed = stats.failed,
            "Session finished"
        );
        self.set_state(SessionState::Stopped, error).await;
        stats
    }
}

/// Run the poll loop, closing the session with an error if it panics.
async fn supervise(poll_loop: PollLoop, closer: Closer, session_id: Option<i64>) -> LoopExit {
    match AssertUnwindSafe(poll_loop.run()).catch_unwind().await {
        Ok(poke) => LoopExit { poke, crashed: false },
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(error = %reason, "Poll loop crashed");
            closer
                .finish(session_id, Some(format!("poll loop crashed: {}", reason)))
                .await;
            LoopExit {
                poke: None,
                crashed: true,
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Owns the session state machine and the poll loop task.
pub struct SessionController {
    engine: Arc<CopyEngine>,
    source: Arc<dyn ActivitySource>,
    config: MirrorConfig,
    events: EventBus,
    journal: Option<Arc<Database>>,

    state: Arc<RwLock<SessionState>>,
    stats: Arc<Mutex<SessionStats>>,
    /// Held for the duration of a transition
    transition: Mutex<()>,
    poke: Mutex<Option<mpsc::Receiver<()>>>,
    run: Mutex<Option<RunHandle>>,
}

impl SessionController {
    pub fn new(
        engine: Arc<CopyEngine>,
        source: Arc<dyn ActivitySource>,
        config: MirrorConfig,
        events: EventBus,
    ) -> Self {
        Self {
            engine,
            source,
            config,
            events,
            journal: None,
            state: Arc::new(RwLock::new(SessionState::Stopped)),
            stats: Arc::new(Mutex::new(SessionStats::default())),
            transition: Mutex::new(()),
            poke: Mutex::new(None),
            run: Mutex::new(None),
        }
    }

    /// Record session runs in the journal.
    pub fn with_journal(mut self, journal: Arc<Database>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Wake the poll loop early whenever a message arrives on `poke`.
    pub fn with_poke(mut self, poke: mpsc::Receiver<()>) -> Self {
        self.poke = Mutex::new(Some(poke));
        self
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn stats(&self) -> SessionStats {
        self.stats.lock().await.clone()
    }

    pub fn engine(&self) -> &Arc<CopyEngine> {
        &self.engine
    }

    fn closer(&self) -> Closer {
        Closer {
            state: self.state.clone(),
            stats: self.stats.clone(),
            events: self.events.clone(),
            journal: self.journal.clone(),
        }
    }

    async fn set_state(&self, state: SessionState, error: Option<String>) {
        self.closer().set_state(state, error).await;
    }

    /// Stopped -> Starting -> Running. Invalid configuration reverts to
    /// Stopped and returns the error.
    pub async fn start(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let current = self.state().await;
        if current != SessionState::Stopped {
            bail!("Cannot start a session that is {}", current);
        }
        self.set_state(SessionState::Starting, None).await;

        if let Err(e) = self.config.validate() {
            self.set_state(SessionState::Stopped, Some(e.to_string())).await;
            return Err(e.context("Session failed to start"));
        }

        *self.stats.lock().await = SessionStats {
            started_at: Some(Utc::now()),
            ..SessionStats::default()
        };

        let session_id = match &self.journal {
            Some(journal) => match journal
                .start_session(&self.config.target_wallet, self.engine.is_paper())
                .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "Could not journal session start");
                    None
                }
            },
            None => None,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let poll_loop = PollLoop {
            engine: self.engine.clone(),
            source: self.source.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            stop: stop_rx,
            poke: self.poke.lock().await.take(),
        };
        // Running before the spawn, so a crash on the first poll ends in Stopped
        self.set_state(SessionState::Running, None).await;
        let task = tokio::spawn(supervise(poll_loop, self.closer(), session_id));
        *self.run.lock().await = Some(RunHandle {
            stop: stop_tx,
            task,
            session_id,
        });

        info!(
            target = %self.config.target_wallet,
            paper = self.engine.is_paper(),
            poll_ms = self.config.session.poll_interval.as_millis() as u64,
            "Mirroring session started"
        );
        Ok(())
    }

    /// Running -> Stopping -> Stopped. The loop finishes its current
    /// iteration; past `stop_timeout` it is aborted.
    pub async fn stop(&self) -> Result<SessionStats> {
        let _transition = self.transition.lock().await;
        let Some(handle) = self.run.lock().await.take() else {
            bail!("No session is running");
        };
        if self.state().await == SessionState::Stopped {
            bail!("No session is running (poll loop already ended)");
        }
        self.set_state(SessionState::Stopping, None).await;

        let _ = handle.stop.send(true);
        let mut task = handle.task;
        let error = match tokio::time::timeout(self.config.session.stop_timeout, &mut task).await {
            Ok(Ok(exit)) if exit.crashed => return Ok(self.stats().await),
            Ok(Ok(exit)) => {
                *self.poke.lock().await = exit.poke;
                None
            }
            Ok(Err(e)) => {
                error!(error = %e, "Poll loop terminated abnormally");
                Some(format!("poll loop failed: {}", e))
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.session.stop_timeout.as_secs_f64(),
                    "Graceful stop timed out, aborting poll loop"
                );
                task.abort();
                None
            }
        };

        Ok(self.finish(handle.session_id, error).await)
    }

    /// Abort the poll loop immediately, from any state.
    pub async fn kill(&self) -> SessionStats {
        let handle = self.run.lock().await.take();
        let session_id = match handle {
            Some(handle) => {
                warn!("Killing poll loop");
                let _ = handle.stop.send(true);
                handle.task.abort();
                handle.session_id
            }
            None => None,
        };
        if self.state().await == SessionState::Stopped {
            return self.stats().await;
        }
        self.finish(session_id, None).await
    }

    async fn finish(&self, session_id: Option<i64>, error: Option<String>) -> SessionStats {
        self.closer().finish(session_id, error).await
    }
}

/// State moved into the spawned poll task.
struct PollLoop {
    engine: Arc<CopyEngine>,
    source: Arc<dyn ActivitySource>,
    config: MirrorConfig,
    events: EventBus,
    stats: Arc<Mutex<SessionStats>>,
    stop: watch::Receiver<bool>,
    poke: Option<mpsc::Receiver<()>>,
}

impl PollLoop {
    /// Runs until stopped. Returns the poke channel so a restart can reuse it.
    async fn run(mut self) -> Option<mpsc::Receiver<()>> {
        let session = self.config.session.clone();
        let mut baselined = false;
        let mut last_status = Instant::now();

        while !*self.stop.borrow() {
            let pause = match self.poll_once(&mut baselined).await {
                Ok(processed) => {
                    if processed > 0 {
                        debug!(processed, "Poll processed new activity");
                    }
                    session.poll_interval
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Poll failed");
                    self.stats.lock().await.poll_errors += 1;
                    session.error_pause
                }
            };

            if last_status.elapsed() >= session.status_interval {
                self.status().await;
                last_status = Instant::now();
            }

            let mut poke_closed = false;
            let mut controller_gone = false;
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = self.stop.changed() => controller_gone = changed.is_err(),
                poked = next_poke(&mut self.poke) => {
                    match poked {
                        Some(()) => debug!("Poll loop poked"),
                        None => poke_closed = true,
                    }
                }
            }
            if controller_gone {
                warn!("Session controller dropped, poll loop exiting");
                break;
            }
            if poke_closed {
                debug!("Poke channel closed, polling only");
                self.poke = None;
            }
        }

        debug!("Poll loop exiting");
        self.poke
    }

    /// One fetch-and-process cycle. Returns the number of activities
    /// handed to the engine.
    async fn poll_once(&self, baselined: &mut bool) -> Result<usize> {
        let mut activities = self
            .source
            .fetch_recent_activity(&self.config.target_wallet, self.config.session.fetch_limit)
            .await
            .context("Failed to fetch activity")?;
        self.stats.lock().await.polls += 1;

        if !*baselined {
            let marked = self.engine.baseline(&activities).await;
            info!(marked, "Baseline set, existing activity will not be copied");
            *baselined = true;
            return Ok(0);
        }

        // The API lists newest first and timestamps are whole seconds:
        // reverse, then stable-sort so same-second rows keep API order reversed
        activities.reverse();
        activities.sort_by_key(|a| a.occurred_at());

        let mut processed = 0;
        for activity in &activities {
            if let Some(outcome) = self.engine.process_activity(activity).await {
                self.stats.lock().await.record(&outcome);
                if outcome != TradeOutcome::Duplicate {
                    processed += 1;
                }
            }
        }
        Ok(processed)
    }

    async fn status(&self) {
        let stats = self.stats.lock().await.clone();
        let cutoff = Utc::now() - chrono::Duration::hours(TARGET_IDLE_HOURS);
        let pruned = self.engine.prune_targets(cutoff).await;
        let slippage = self.engine.slippage_stats().await;

        info!(
            polls = stats.polls,
            detected = stats.detected,
            copied = stats.copied,
            skipped = stats.skipped,
            failed = stats.failed,
            pruned,
            "Status: {}",
            slippage
        );
        self.events.emit(BotEvent::status(stats));
    }
}

async fn next_poke(poke: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match poke {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::models::{Activity, Side};
    use crate::trading::engine_tests::{config, paper_engine, trade};
    use crate::trading::executor_tests::MockExchange;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers fetches from a script, then repeats the last answer.
    struct MockSource {
        script: std::sync::Mutex<VecDeque<Result<Vec<Activity>, ApiError>>>,
        last: std::sync::Mutex<Vec<Activity>>,
        fetches: AtomicUsize,
        hang: Option<Duration>,
        /// Panic on this fetch (1-based)
        panic_on: Option<usize>,
    }

    impl MockSource {
        fn new(script: Vec<Result<Vec<Activity>, ApiError>>) -> Self {
            Self {
                script: std::sync::Mutex::new(script.into()),
                last: std::sync::Mutex::new(Vec::new()),
                fetches: AtomicUsize::new(0),
                hang: None,
                panic_on: None,
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActivitySource for MockSource {
        async fn fetch_recent_activity(&self, _account: &str, _limit: u32) -> Result<Vec<Activity>, ApiError> {
            let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on == Some(fetch) {
                panic!("activity decoder invariant broken");
            }
            if let Some(hang) = self.hang {
                tokio::time::sleep(hang).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(rows)) => {
                    *self.last.lock().unwrap() = rows.clone();
                    Ok(rows)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    fn fast_config() -> MirrorConfig {
        let mut config = config();
        config.session.poll_interval = Duration::from_millis(10);
        config.session.error_pause = Duration::from_millis(10);
        config.session.stop_timeout = Duration::from_millis(500);
        config
    }

    fn at(secs: i64, mut activity: crate::models::ActivityEvent) -> Activity {
        activity.occurred_at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        Activity::Trade(activity)
    }

    fn controller(source: Arc<MockSource>, config: MirrorConfig) -> SessionController {
        let (_, engine) = paper_engine(MockExchange::new(dec!(0.41)));
        let events = EventBus::default();
        SessionController::new(Arc::new(engine), source, config, events)
    }

    #[tokio::test]
    async fn test_invalid_config_reverts_to_stopped() {
        let mut config = fast_config();
        config.target_wallet = "0x1234".to_string();
        let session = controller(Arc::new(MockSource::new(vec![])), config);
        let mut rx = session.events.subscribe();

        let err = session.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("42-char hex address"));
        assert_eq!(session.state().await, SessionState::Stopped);

        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                BotEvent::BotStateChanged { state, error, .. } => Some((state, error.is_some())),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![(SessionState::Starting, false), (SessionState::Stopped, true)]
        );
    }

    #[tokio::test]
    async fn test_baseline_skips_history_then_copies_new_trades() {
        let old = at(0, trade(Some("0xold"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40)));
        let new = at(10, trade(Some("0xnew"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40)));
        let source = Arc::new(MockSource::new(vec![
            Ok(vec![old.clone()]),
            Ok(vec![new, old]),
        ]));
        let session = controller(source.clone(), fast_config());

        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Running);
        assert!(session.start().await.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = session.stop().await.unwrap();

        assert_eq!(session.state().await, SessionState::Stopped);
        assert!(source.fetches() >= 3);
        assert_eq!(stats.detected, 1);
        assert_eq!(stats.copied, 1);
        assert!(stats.duplicates >= 2);

        let ledger = session.engine().ledger().read().await;
        assert_eq!(ledger.target("0xm").unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_new_activity_is_replayed_oldest_first() {
        let first = at(5, trade(Some("0x1"), "0xm", 1, Side::Buy, dec!(100), dec!(0.40)));
        let second = at(9, trade(Some("0x2"), "0xm", 0, Side::Buy, dec!(10), dec!(0.40)));
        let source = Arc::new(MockSource::new(vec![Ok(vec![]), Ok(vec![second, first])]));
        let session = controller(source, fast_config());

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = session.stop().await.unwrap();

        // Outcome 1 came first, so it is the primary side
        let ledger = session.engine().ledger().read().await;
        assert_eq!(ledger.target("0xm").unwrap().primary_side, 1);
        assert_eq!(stats.detected, 2);
    }

    #[tokio::test]
    async fn test_same_second_trades_keep_source_order() {
        // Newest first, as the API lists them; both in the same second
        let newer = at(5, trade(Some("0xnewer"), "0xm", 0, Side::Buy, dec!(10), dec!(0.40)));
        let older = at(5, trade(Some("0xolder"), "0xm", 1, Side::Buy, dec!(100), dec!(0.40)));
        let source = Arc::new(MockSource::new(vec![Ok(vec![]), Ok(vec![newer, older])]));
        let session = controller(source, fast_config());

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.stop().await.unwrap();

        let ledger = session.engine().ledger().read().await;
        assert_eq!(ledger.target("0xm").unwrap().primary_side, 1);
    }

    #[tokio::test]
    async fn test_redelivered_trade_without_id_is_copied_once() {
        let ev = at(5, trade(None, "0xm", 0, Side::Buy, dec!(100), dec!(0.40)));
        let source = Arc::new(MockSource::new(vec![Ok(vec![]), Ok(vec![ev])]));
        let session = controller(source.clone(), fast_config());

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = session.stop().await.unwrap();

        assert!(source.fetches() >= 3);
        assert_eq!(stats.detected, 1);
        assert_eq!(stats.copied, 1);
        assert!(stats.duplicates >= 1);
    }

    #[tokio::test]
    async fn test_loop_crash_stops_session_with_error() {
        let mut source = MockSource::new(vec![Ok(vec![])]);
        source.panic_on = Some(2);
        let journal = Arc::new(Database::in_memory().await.unwrap());
        let session = controller(Arc::new(source), fast_config()).with_journal(journal.clone());
        let mut rx = session.events.subscribe();

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state().await, SessionState::Stopped);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.iter().any(|e| matches!(e, BotEvent::StatusUpdate { .. })));
        let last_state = events
            .iter()
            .rev()
            .find_map(|e| match e {
                BotEvent::BotStateChanged { state, error, .. } => Some((*state, error.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_state.0, SessionState::Stopped);
        assert!(last_state.1.unwrap().contains("activity decoder invariant broken"));

        let sessions = journal.recent_sessions(5).await.unwrap();
        assert!(sessions[0].stopped_at.is_some());
        assert!(sessions[0].error_message.as_deref().unwrap().contains("poll loop crashed"));

        // Nothing left to stop, and a fresh session can start
        assert!(session.stop().await.is_err());
        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Running);
        session.kill().await;
    }

    #[tokio::test]
    async fn test_target_redeem_closes_paper_position() {
        let entry = at(5, trade(Some("0xentry"), "0xm", 0, Side::Buy, dec!(100), dec!(0.40)));
        let redeem = Activity::Redeem {
            id: Some("0xredeem".to_string()),
            occurred_at: Utc.timestamp_opt(1_700_000_900, 0).unwrap(),
            market_id: "0xm".to_string(),
            usdc_amount: dec!(100),
        };
        let source = Arc::new(MockSource::new(vec![
            Ok(vec![]),
            Ok(vec![entry.clone()]),
            Ok(vec![redeem, entry]),
        ]));
        let session = controller(source, fast_config());

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = session.stop().await.unwrap();
        assert_eq!(stats.copied, 1);

        let engine = session.engine();
        let ledger = engine.ledger().read().await;
        assert_eq!(ledger.copier_positions().count(), 0);
        assert_eq!(ledger.realized_pnl(), dec!(4.13));
        drop(ledger);
        assert_eq!(engine.executor().balance().await.unwrap(), dec!(1004.13));
    }

    #[tokio::test]
    async fn test_fetch_errors_do_not_stop_the_loop() {
        let source = Arc::new(MockSource::new(vec![
            Err(ApiError::Transient("timeout".to_string())),
            Ok(vec![]),
        ]));
        let session = controller(source.clone(), fast_config());

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state().await, SessionState::Running);
        let stats = session.stop().await.unwrap();

        assert_eq!(stats.poll_errors, 1);
        assert!(stats.polls >= 2);
    }

    #[tokio::test]
    async fn test_poke_wakes_the_loop() {
        let mut config = fast_config();
        config.session.poll_interval = Duration::from_secs(30);
        let source = Arc::new(MockSource::new(vec![]));
        let (tx, rx) = mpsc::channel(4);
        let session = controller(source.clone(), config).with_poke(rx);

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.fetches(), 1);

        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.fetches(), 2);

        // Stop interrupts the long sleep
        let stopped = tokio::time::timeout(Duration::from_millis(400), session.stop()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn test_stop_timeout_aborts_hung_loop() {
        let mut config = fast_config();
        config.session.stop_timeout = Duration::from_millis(30);
        let mut source = MockSource::new(vec![]);
        source.hang = Some(Duration::from_secs(30));
        let session = controller(Arc::new(source), config);

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopped = tokio::time::timeout(Duration::from_millis(500), session.stop()).await;
        assert!(stopped.is_ok());
        assert_eq!(session.state().await, SessionState::Stopped);
        assert!(session.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_kill_and_restart() {
        let session = controller(Arc::new(MockSource::new(vec![])), fast_config());

        session.start().await.unwrap();
        session.kill().await;
        assert_eq!(session.state().await, SessionState::Stopped);

        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Running);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_is_journaled() {
        let journal = Arc::new(Database::in_memory().await.unwrap());
        let source = Arc::new(MockSource::new(vec![]));
        let session = controller(source, fast_config()).with_journal(journal.clone());

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        session.stop().await.unwrap();

        let sessions = journal.recent_sessions(5).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].stopped_at.is_some());
        assert!(sessions[0].paper);
    }

    #[test]
    fn test_stats_record_and_summary() {
        let mut stats = SessionStats::default();
        stats.record(&TradeOutcome::Skipped(SkipReason::SlippageTooHigh));
        stats.record(&TradeOutcome::Skipped(SkipReason::SlippageTooHigh));
        stats.record(&TradeOutcome::Skipped(SkipReason::MinoritySide));
        stats.record(&TradeOutcome::Duplicate);

        assert_eq!(stats.detected, 3);
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.skip_reasons[&SkipReason::SlippageTooHigh], 2);

        let summary = stats.to_string();
        assert!(summary.contains("SESSION SUMMARY"));
        assert!(summary.contains("slippage_too_high"));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["skip_reasons"]["minority_side"], 1);
    }
}
