//! One snipe attempt against one market, as a state machine.
//!
//! `INIT → MONITORING → ARMED → FIRING → {SETTLED | ABORTED | FAILED}`. States only move
//! forward, and at most one order is built per session.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::probability::{self, ProbabilityEstimate};
use super::scheduler::{Clock, DriftStatus, TimingSettings, TriggerPlan, TriggerScheduler};
use crate::config::SniperConfig;
use crate::error::{FeedError, RejectReason};
use crate::market::{Market, Outcome, SidePick};
use crate::metrics;
use crate::orderbook::{BookFeed, FeedEvent, FeedHandle, FeedStatus, OrderBookSnapshot};
use crate::trading::{ExecutionError, ExecutionMode, ExecutionResult, OrderExecutor, OrderRequest};
use crate::utils::StopSignal;

/// Why a session ended without trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    /// The fire instant had already passed.
    Expired,
    /// Implied probability below the configured minimum.
    ProbabilityBelowThreshold,
    /// The book could not price the chosen side.
    Indeterminate,
    /// The deadline passed before the fire instant was reached, or the feed
    /// never became healthy enough to arm.
    MissedWindow,
    /// At the fire instant the feed was not live or its book was too old.
    StaleBook,
    /// External stop signal.
    Cancelled,
}

/// Why a session ended in error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// No first snapshot within the connect timeout.
    FeedConnect,
    /// Feed reconnect budget exhausted.
    FeedLost,
    /// Clock drift beyond the fault bound.
    DriftFault,
    /// The exchange refused the order.
    Rejected(RejectReason),
    /// Deadline too close for another submission attempt.
    MissedWindow,
    /// Every submission attempt failed transiently.
    RetriesExhausted,
    /// Signing or credential failure.
    Signature,
    /// The order failed local validation.
    InvalidOrder,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailReason::FeedConnect => f.write_str("feed_connect"),
            FailReason::FeedLost => f.write_str("feed_lost"),
            FailReason::DriftFault => f.write_str("drift_fault"),
            FailReason::Rejected(reason) => write!(f, "rejected: {}", reason),
            FailReason::MissedWindow => f.write_str("missed_window"),
            FailReason::RetriesExhausted => f.write_str("retries_exhausted"),
            FailReason::Signature => f.write_str("signature"),
            FailReason::InvalidOrder => f.write_str("invalid_order"),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet subscribed.
    Init,
    /// Subscribed and watching the book.
    Monitoring,
    /// Within the arm lead of the fire instant.
    Armed,
    /// Order built and in flight. Stop is not observed here.
    Firing,
    /// Filled or simulated.
    Settled,
    /// Ended without trading.
    Aborted(AbortReason),
    /// Ended in error.
    Failed(FailReason),
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Init => 0,
            SessionState::Monitoring => 1,
            SessionState::Armed => 2,
            SessionState::Firing => 3,
            SessionState::Settled | SessionState::Aborted(_) | SessionState::Failed(_) => 4,
        }
    }

    /// Whether no transition can leave this state.
    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Monitoring => "monitoring",
            SessionState::Armed => "armed",
            SessionState::Firing => "firing",
            SessionState::Settled => "settled",
            SessionState::Aborted(_) => "aborted",
            SessionState::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Aborted(reason) => write!(f, "ABORTED({})", reason),
            SessionState::Failed(reason) => write!(f, "FAILED({})", reason),
            other => f.write_str(&other.label().to_uppercase()),
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Previous state.
    pub from: SessionState,
    /// New state.
    pub to: SessionState,
    /// Corrected wall time of the change.
    pub at: OffsetDateTime,
}

/// Everything a session observed and decided.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Target market.
    pub market: Market,
    /// Timeline.
    pub plan: TriggerPlan,
    /// Freshest snapshot seen.
    pub latest: Option<OrderBookSnapshot>,
    /// Current state.
    pub state: SessionState,
    /// Every transition, in order.
    pub history: Vec<Transition>,
    /// Side chosen at the fire instant.
    pub outcome: Option<Outcome>,
    /// Estimate taken at the fire instant.
    pub probability: Option<ProbabilityEstimate>,
    /// The order, once built.
    pub request: Option<OrderRequest>,
    /// Execution result, once reached.
    pub result: Option<ExecutionResult>,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    /// Live book source.
    pub feed: Arc<dyn BookFeed>,
    /// Order builder and submitter.
    pub executor: Arc<OrderExecutor>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Scheduler tunables.
    pub timing: TimingSettings,
}

/// A single snipe attempt.
pub struct SniperSession {
    config: SniperConfig,
    ctx: SessionContext,
    record: SessionRecord,
    observer: Option<watch::Sender<SessionState>>,
    /// Monotonic receipt time of `record.latest`.
    fresh_at: Option<Instant>,
}

impl SniperSession {
    /// Prepare a session; nothing runs until [`SniperSession::run`].
    pub fn new(market: Market, config: SniperConfig, ctx: SessionContext) -> Self {
        let plan = TriggerPlan::new(&market, &config, ctx.timing.arm_lead);
        Self {
            config,
            ctx,
            record: SessionRecord {
                market,
                plan,
                latest: None,
                state: SessionState::Init,
                history: Vec::new(),
                outcome: None,
                probability: None,
                request: None,
                result: None,
            },
            observer: None,
            fresh_at: None,
        }
    }

    /// Publish every state change to `observer`.
    pub fn with_observer(mut self, observer: watch::Sender<SessionState>) -> Self {
        observer.send_replace(SessionState::Init);
        self.observer = Some(observer);
        self
    }

    /// The record so far.
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.record.state.clone();
        if from.is_terminal() || to.rank() <= from.rank() {
            warn!(from = %from, to = %to, "Ignoring backward session transition");
            return;
        }

        let at = self.ctx.clock.now();
        info!(market = %self.record.market.label(), from = %from, to = %to, "Session transition");
        self.record.history.push(Transition { from, to: to.clone(), at });
        self.record.state = to.clone();
        if let Some(observer) = &self.observer {
            observer.send_replace(to);
        }
    }

    fn finish(mut self, end: SessionState) -> SessionRecord {
        self.transition(end);
        metrics::inc_sessions(self.record.state.label());
        match &self.record.state {
            SessionState::Settled => info!(market = %self.record.market.label(), "Session settled"),
            SessionState::Failed(reason) => error!(market = %self.record.market.label(), reason = %reason, "Session failed"),
            state => warn!(market = %self.record.market.label(), state = %state, "Session ended"),
        }
        self.record
    }

    /// Record a snapshot and resync the clock against its server time.
    fn observe(&mut self, scheduler: &TriggerScheduler, snapshot: OrderBookSnapshot) -> Result<(), SessionState> {
        if let Some(server_time) = snapshot.server_time {
            match scheduler.resync(server_time, snapshot.received_at) {
                Ok(DriftStatus::Corrected { drift_ms }) => debug!(drift_ms, "Clock corrected from feed"),
                Ok(DriftStatus::WithinTolerance) => {}
                Err(e) => {
                    error!(error = %e, "Clock drift fault");
                    return Err(SessionState::Failed(FailReason::DriftFault));
                }
            }
        }
        self.record.latest = Some(snapshot);
        self.fresh_at = Some(self.ctx.clock.instant());
        Ok(())
    }

    /// Stay in MONITORING until the feed is live again. Giving up at `fire_at` is a missed window.
    async fn await_live(
        &mut self,
        scheduler: &TriggerScheduler,
        handle: &mut FeedHandle,
        stop: &mut StopSignal,
        fire_at: OffsetDateTime,
    ) -> Result<(), SessionState> {
        let status = handle.status();
        if status == FeedStatus::Live {
            return Ok(());
        }
        warn!(?status, "Feed not live at arm time, holding");

        let wait = scheduler.wait_until(fire_at);
        tokio::pin!(wait);

        loop {
            match handle.status() {
                FeedStatus::Live => {
                    info!("Feed live again");
                    return Ok(());
                }
                FeedStatus::Lost { .. } => return Err(SessionState::Failed(FailReason::FeedLost)),
                FeedStatus::Connecting | FeedStatus::Reconnecting { .. } => {}
            }

            tokio::select! {
                biased;
                _ = stop.wait() => {
                    info!("Stop requested, cancelling session");
                    return Err(SessionState::Aborted(AbortReason::Cancelled));
                }
                _ = &mut wait => {
                    warn!("Feed did not recover before the fire instant");
                    return Err(SessionState::Aborted(AbortReason::MissedWindow));
                }
                event = handle.next_event() => match event {
                    FeedEvent::Snapshot(snapshot) => self.observe(scheduler, snapshot)?,
                    FeedEvent::Status(status) => debug!(?status, "Feed status"),
                    FeedEvent::Lost(e) => {
                        error!(error = %e, "Feed lost");
                        return Err(SessionState::Failed(FailReason::FeedLost));
                    }
                },
            }
        }
    }

    /// The book to fire on: the freshest snapshot, provided the feed is live and it is recent.
    fn firing_snapshot(&mut self, scheduler: &TriggerScheduler, handle: &FeedHandle) -> Result<OrderBookSnapshot, SessionState> {
        if let Some(latest) = handle.latest() {
            let seen = self.record.latest.as_ref().map(|s| s.sequence);
            if seen != Some(latest.sequence) {
                self.observe(scheduler, latest)?;
            }
        }
        let Some(snapshot) = self.record.latest.clone() else {
            return Err(SessionState::Aborted(AbortReason::Indeterminate));
        };

        let status = handle.status();
        let age = self
            .fresh_at
            .map(|at| self.ctx.clock.instant().saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if status != FeedStatus::Live || age > self.ctx.timing.max_book_age {
            warn!(
                ?status,
                age_ms = age.as_millis() as u64,
                max_age_ms = self.ctx.timing.max_book_age.as_millis() as u64,
                sequence = snapshot.sequence,
                "Book is stale at the fire instant, not firing"
            );
            return Err(SessionState::Aborted(AbortReason::StaleBook));
        }
        Ok(snapshot)
    }

    /// Follow the feed until `target`, returning how late the wake-up was.
    async fn watch_until(
        &mut self,
        scheduler: &TriggerScheduler,
        handle: &mut FeedHandle,
        stop: &mut StopSignal,
        target: OffsetDateTime,
    ) -> Result<Duration, SessionState> {
        let wait = scheduler.wait_until(target);
        tokio::pin!(wait);

        loop {
            tokio::select! {
                biased;
                _ = stop.wait() => {
                    info!("Stop requested, cancelling session");
                    return Err(SessionState::Aborted(AbortReason::Cancelled));
                }
                result = &mut wait => {
                    return result.map_err(|e| {
                        warn!(error = %e, "Window passed while waiting");
                        SessionState::Aborted(AbortReason::MissedWindow)
                    });
                }
                event = handle.next_event() => match event {
                    FeedEvent::Snapshot(snapshot) => self.observe(scheduler, snapshot)?,
                    FeedEvent::Status(FeedStatus::Reconnecting { attempt }) => {
                        warn!(attempt, "Feed reconnecting");
                    }
                    FeedEvent::Status(status) => debug!(?status, "Feed status"),
                    FeedEvent::Lost(e) => {
                        error!(error = %e, "Feed lost");
                        return Err(SessionState::Failed(FailReason::FeedLost));
                    }
                },
            }
        }
    }

    /// Drive the session to a terminal state.
    #[instrument(skip_all, fields(market = %self.record.market.label()))]
    pub async fn run(mut self, mut stop: StopSignal) -> SessionRecord {
        let plan = self.record.plan;
        let scheduler = TriggerScheduler::new(self.ctx.clock.clone(), self.ctx.timing.clone(), plan.deadline);

        let now = scheduler.now();
        if plan.fire_at <= now {
            info!(fire_at = %plan.fire_at, now = %now, "Fire instant already passed");
            return self.finish(SessionState::Aborted(AbortReason::Expired));
        }

        if now < plan.monitor_from {
            info!(monitor_from = %plan.monitor_from, "Waiting for monitor window");
            let waited = tokio::select! {
                biased;
                _ = stop.wait() => Err(SessionState::Aborted(AbortReason::Cancelled)),
                r = scheduler.wait_until(plan.monitor_from) => {
                    r.map_err(|_| SessionState::Aborted(AbortReason::MissedWindow))
                }
            };
            if let Err(end) = waited {
                return self.finish(end);
            }
        }

        let feed = self.ctx.feed.clone();
        let subscribed = tokio::select! {
            biased;
            _ = stop.wait() => Err(SessionState::Aborted(AbortReason::Cancelled)),
            r = feed.subscribe(&self.record.market) => r.map_err(|e| {
                error!(error = %e, "Feed subscription failed");
                match e {
                    FeedError::ConnectTimeout { .. } => SessionState::Failed(FailReason::FeedConnect),
                    FeedError::Lost { .. } | FeedError::Closed => SessionState::Failed(FailReason::FeedLost),
                }
            }),
        };
        let mut handle = match subscribed {
            Ok(handle) => handle,
            Err(end) => return self.finish(end),
        };

        let now = scheduler.now();
        if now < plan.monitor_from || now >= plan.fire_at {
            return self.finish(SessionState::Aborted(AbortReason::Expired));
        }
        if let Some(first) = handle.latest() {
            if let Err(end) = self.observe(&scheduler, first) {
                return self.finish(end);
            }
        }

        self.transition(SessionState::Monitoring);
        if let Err(end) = self.watch_until(&scheduler, &mut handle, &mut stop, plan.arm_at).await {
            return self.finish(end);
        }

        if let Err(end) = self.await_live(&scheduler, &mut handle, &mut stop, plan.fire_at).await {
            return self.finish(end);
        }
        self.transition(SessionState::Armed);

        let lateness = match self.watch_until(&scheduler, &mut handle, &mut stop, plan.fire_at).await {
            Ok(lateness) => lateness,
            Err(end) => return self.finish(end),
        };
        metrics::record_fire_lateness(lateness.as_secs_f64() * 1000.0);
        debug!(lateness_ms = lateness.as_millis() as u64, "Fire instant reached");

        let snapshot = match self.firing_snapshot(&scheduler, &handle) {
            Ok(snapshot) => snapshot,
            Err(end) => return self.finish(end),
        };
        drop(handle);

        let outcome = match self.record.market.side {
            SidePick::Fixed(outcome) => Some(outcome),
            SidePick::Favorite => probability::favorite(&snapshot),
        };
        let Some(outcome) = outcome else {
            return self.finish(SessionState::Aborted(AbortReason::Indeterminate));
        };
        let estimate = probability::evaluate(&snapshot, outcome);
        self.record.outcome = Some(outcome);
        self.record.probability = Some(estimate);

        match estimate {
            ProbabilityEstimate::Indeterminate => {
                return self.finish(SessionState::Aborted(AbortReason::Indeterminate));
            }
            ProbabilityEstimate::Known(p) if !estimate.clears(self.config.min_win_probability) => {
                info!(
                    outcome = %outcome,
                    probability = %p,
                    threshold = %self.config.min_win_probability,
                    "Probability below threshold, not firing"
                );
                return self.finish(SessionState::Aborted(AbortReason::ProbabilityBelowThreshold));
            }
            ProbabilityEstimate::Known(p) => info!(outcome = %outcome, probability = %p, "Firing"),
        }

        self.transition(SessionState::Firing);
        let token_id = self.record.market.token_id(outcome).to_string();
        let request = match self
            .ctx
            .executor
            .build(&token_id, self.config.buy_price, self.config.buy_size)
        {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Order build failed");
                return self.finish(SessionState::Failed(FailReason::InvalidOrder));
            }
        };
        self.record.request = Some(request.clone());

        let mode = ExecutionMode::from_dry_run(self.config.dry_run);
        let result = self
            .ctx
            .executor
            .execute(&request, mode, plan.deadline, Some(&snapshot))
            .await;

        let end = if result.is_success() {
            SessionState::Settled
        } else {
            SessionState::Failed(match &result.error {
                Some(ExecutionError::Rejected(reason)) => FailReason::Rejected(reason.clone()),
                Some(ExecutionError::MissedWindow) => FailReason::MissedWindow,
                Some(ExecutionError::Signature(_)) => FailReason::Signature,
                Some(ExecutionError::RetriesExhausted(_)) | None => FailReason::RetriesExhausted,
            })
        };
        self.record.result = Some(result);
        self.finish(end)
    }
}

/// Run one session for `market` to a terminal state.
pub async fn run_session(market: Market, config: SniperConfig, ctx: SessionContext, stop: StopSignal) -> SessionRecord {
    SniperSession::new(market, config, ctx).run(stop).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::mock::{MockFeed, MockSubmitter};
    use crate::orderbook::TopOfBook;
    use crate::sniper::scheduler::WallClock;
    use crate::trading::{ExecutionStatus, RetryPolicy};
    use crate::utils::stop_channel;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    const START: OffsetDateTime = datetime!(2025-01-01 12:00 UTC);

    fn market(deadline: OffsetDateTime, side: SidePick) -> Market {
        Market {
            id: "cond-1".into(),
            up_token_id: "up".into(),
            down_token_id: "down".into(),
            side,
            deadline,
            question: Some("Bitcoin Up or Down".into()),
        }
    }

    fn book(up_mid: Decimal) -> (TopOfBook, TopOfBook) {
        let spread = dec!(0.005);
        let down_mid = Decimal::ONE - up_mid;
        (
            TopOfBook::new(Some(up_mid - spread), Some(up_mid + spread)),
            TopOfBook::new(Some(down_mid - spread), Some(down_mid + spread)),
        )
    }

    struct Harness {
        clock: Arc<WallClock>,
        feed: Arc<MockFeed>,
        submitter: Arc<MockSubmitter>,
        executor: Arc<OrderExecutor>,
    }

    impl Harness {
        fn new(feed: MockFeed) -> Self {
            let clock = Arc::new(WallClock::starting_at(START));
            let submitter = Arc::new(MockSubmitter::filling());
            let executor = Arc::new(OrderExecutor::new(submitter.clone(), clock.clone(), RetryPolicy::default()));
            Self { clock, feed: Arc::new(feed), submitter, executor }
        }

        fn ctx(&self) -> SessionContext {
            SessionContext {
                feed: self.feed.clone(),
                executor: self.executor.clone(),
                clock: self.clock.clone(),
                timing: TimingSettings::default(),
            }
        }
    }

    fn config(min_prob: Decimal, dry_run: bool) -> SniperConfig {
        SniperConfig::new(1, 5, dec!(0.99), dec!(10), min_prob, dry_run)
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_never_subscribes() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))));
        let record = run_session(
            market(START + Duration::from_millis(500), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), true),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Aborted(AbortReason::Expired));
        assert_eq!(h.feed.subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_settles_at_fire_instant() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))));
        let deadline = START + Duration::from_secs(15);
        let record = run_session(
            market(deadline, SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), true),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Settled);
        let result = record.result.unwrap();
        assert_eq!(result.status, ExecutionStatus::Simulated);
        assert_eq!(result.filled_price, Some(dec!(0.99)));
        assert_eq!(result.filled_size, Some(dec!(10)));
        assert_eq!(h.submitter.calls(), 0);

        let fired = record.history.iter().find(|t| t.to == SessionState::Firing).unwrap().at;
        assert!(fired >= deadline - Duration::from_secs(1));
        assert!(fired <= deadline - Duration::from_millis(950));
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_monotonic() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        let states: Vec<_> = record.history.iter().map(|t| t.to.clone()).collect();
        assert_eq!(
            states,
            vec![SessionState::Monitoring, SessionState::Armed, SessionState::Firing, SessionState::Settled]
        );
        assert_eq!(h.submitter.calls(), 1);
        assert_eq!(h.executor.builds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn low_probability_aborts_without_building() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.30))));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Aborted(AbortReason::ProbabilityBelowThreshold));
        assert_eq!(h.executor.builds(), 0);
        assert!(record.request.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn favorite_resolves_at_fire_time() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.10))));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Favorite),
            config(dec!(0.5), true),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Settled);
        assert_eq!(record.outcome, Some(Outcome::Down));
        assert_eq!(record.request.unwrap().token_id(), "down");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_book_is_indeterminate() {
        let h = Harness::new(MockFeed::steady((TopOfBook::default(), TopOfBook::default())));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), true),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Aborted(AbortReason::Indeterminate));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_feed_fails_to_connect() {
        let h = Harness::new(MockFeed::silent());
        let record = run_session(
            market(START + Duration::from_secs(60), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), true),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Failed(FailReason::FeedConnect));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_feed_fails_session() {
        let h = Harness::new(MockFeed::losing_after(book(dec!(0.995)), Duration::from_secs(3)));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), true),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Failed(FailReason::FeedLost));
        assert!(record.request.is_none());
    }

    fn states(record: &SessionRecord) -> Vec<SessionState> {
        record.history.iter().map(|t| t.to.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_feed_is_never_armed() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))).stall_after(Duration::from_secs(1)));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(
            states(&record),
            vec![SessionState::Monitoring, SessionState::Aborted(AbortReason::MissedWindow)]
        );
        assert_eq!(h.executor.builds(), 0);
        assert_eq!(h.submitter.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn feed_recovering_before_arm_settles_on_fresh_book() {
        let h = Harness::new(
            MockFeed::steady(book(dec!(0.995))).stall_between(Duration::from_secs(1), Duration::from_secs(10)),
        );
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Settled);
        assert_eq!(h.submitter.calls(), 1);
        // Ten snapshots before the stall, then a steady stream again after recovery.
        assert!(record.latest.unwrap().sequence > 20);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_arming_aborts_at_fire() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))).stall_after(Duration::from_millis(13_700)));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(
            states(&record),
            vec![
                SessionState::Monitoring,
                SessionState::Armed,
                SessionState::Aborted(AbortReason::StaleBook)
            ]
        );
        assert_eq!(h.submitter.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn old_book_on_live_feed_is_not_fired_on() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))).interval(Duration::from_secs(60)));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Aborted(AbortReason::StaleBook));
        assert_eq!(record.latest.unwrap().sequence, 1);
        assert_eq!(h.executor.builds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn book_within_age_bound_fires() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))).interval(Duration::from_secs(2)));
        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            h.ctx(),
            StopSignal::never(),
        )
        .await;

        assert_eq!(record.state, SessionState::Settled);
        assert_eq!(h.submitter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_before_firing() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))));
        let (stop_tx, stop) = stop_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stop_tx.send_replace(true);
        });

        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            h.ctx(),
            stop,
        )
        .await;

        assert_eq!(record.state, SessionState::Aborted(AbortReason::Cancelled));
        assert_eq!(h.submitter.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_order_fails_session() {
        let clock = Arc::new(WallClock::starting_at(START));
        let submitter = Arc::new(MockSubmitter::rejecting(RejectReason::InsufficientAllowance));
        let ctx = SessionContext {
            feed: Arc::new(MockFeed::steady(book(dec!(0.995)))),
            executor: Arc::new(OrderExecutor::new(submitter.clone(), clock.clone(), RetryPolicy::default())),
            clock,
            timing: TimingSettings::default(),
        };

        let record = run_session(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), false),
            ctx,
            StopSignal::never(),
        )
        .await;

        assert_eq!(
            record.state,
            SessionState::Failed(FailReason::Rejected(RejectReason::InsufficientAllowance))
        );
        assert_eq!(submitter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_terminal_state() {
        let h = Harness::new(MockFeed::steady(book(dec!(0.995))));
        let (tx, rx) = watch::channel(SessionState::Init);
        let session = SniperSession::new(
            market(START + Duration::from_secs(15), SidePick::Fixed(Outcome::Up)),
            config(dec!(0.5), true),
            h.ctx(),
        )
        .with_observer(tx);

        session.run(StopSignal::never()).await;
        assert_eq!(*rx.borrow(), SessionState::Settled);
    }

    #[test]
    fn state_display() {
        assert_eq!(SessionState::Monitoring.to_string(), "MONITORING");
        assert_eq!(
            SessionState::Aborted(AbortReason::ProbabilityBelowThreshold).to_string(),
            "ABORTED(probability_below_threshold)"
        );
        assert_eq!(
            SessionState::Failed(FailReason::Rejected(RejectReason::MarketClosed)).to_string(),
            "FAILED(rejected: market closed)"
        );
    }
}
