//! Integration tests for the Polymarket sniper.
//!
//! The scenario tests run entirely in-process on tokio's paused clock, with scripted
//! scanner, feed, and submitter implementations.
//!
//! Tests marked `#[ignore]` talk to the real Polymarket APIs.
//! Run with: cargo test --test integration -- --ignored

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::macros::datetime;
use time::OffsetDateTime;

use polymarket_sniper::config::{Config, SniperConfig};
use polymarket_sniper::market::{
    CandidateFilter, GammaScanner, Market, MarketScanner, MockFeed, MockScanner, MockSubmitter, Outcome,
    SidePick,
};
use polymarket_sniper::orderbook::{BookFeed, ClobFeed, FeedHandle, TopOfBook};
use polymarket_sniper::sniper::{
    run_session, AbortReason, Clock, FailReason, SessionContext, SessionState, SniperSupervisor,
    SupervisorSettings, TimingSettings, WallClock,
};
use polymarket_sniper::trading::{ExecutionStatus, OrderExecutor, RetryPolicy};
use polymarket_sniper::utils::{stop_channel, StopSignal};

const START: OffsetDateTime = datetime!(2025-06-01 15:00 UTC);

fn market(id: &str, deadline_secs: u64) -> Market {
    Market {
        id: id.into(),
        up_token_id: format!("{}-up", id),
        down_token_id: format!("{}-down", id),
        side: SidePick::Fixed(Outcome::Up),
        deadline: START + Duration::from_secs(deadline_secs),
        question: Some(format!("Bitcoin Up or Down - {}", id)),
    }
}

/// Books whose Up mid is `up_mid`.
fn book(up_mid: Decimal) -> (TopOfBook, TopOfBook) {
    let half = dec!(0.005);
    let down_mid = Decimal::ONE - up_mid;
    (
        TopOfBook::new(Some(up_mid - half), Some(up_mid + half)),
        TopOfBook::new(Some(down_mid - half), Some(down_mid + half)),
    )
}

fn sniper_config(dry_run: bool) -> SniperConfig {
    SniperConfig::new(1, 5, dec!(0.99), dec!(10), dec!(0.50), dry_run)
}

struct Rig {
    clock: Arc<dyn Clock>,
    executor: Arc<OrderExecutor>,
    submitter: Arc<MockSubmitter>,
}

impl Rig {
    fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(WallClock::starting_at(START));
        let submitter = Arc::new(MockSubmitter::filling());
        let executor = Arc::new(OrderExecutor::new(submitter.clone(), clock.clone(), RetryPolicy::default()));
        Self { clock, executor, submitter }
    }

    fn ctx(&self, feed: Arc<dyn BookFeed>) -> SessionContext {
        SessionContext {
            feed,
            executor: self.executor.clone(),
            clock: self.clock.clone(),
            timing: TimingSettings::default(),
        }
    }
}

/// First subscription loses its feed; later ones are steady.
struct FlakyOnce {
    first: MockFeed,
    rest: MockFeed,
    opened: AtomicU32,
}

impl BookFeed for FlakyOnce {
    fn open(&self, market: &Market) -> FeedHandle {
        if self.opened.fetch_add(1, Ordering::SeqCst) == 0 {
            self.first.open(market)
        } else {
            self.rest.open(market)
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

fn stop_after(secs: u64) -> StopSignal {
    let (tx, stop) = stop_channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        tx.send_replace(true);
    });
    stop
}

#[tokio::test(start_paused = true)]
async fn dry_run_settles_one_second_before_deadline() {
    let rig = Rig::new();
    let feed = Arc::new(MockFeed::steady(book(dec!(0.995))));
    let target = market("m6", 15);
    let deadline = target.deadline;

    let record = run_session(target, sniper_config(true), rig.ctx(feed), StopSignal::never()).await;

    assert_eq!(record.state, SessionState::Settled);
    let result = record.result.expect("execution result");
    assert_eq!(result.status, ExecutionStatus::Simulated);
    assert_eq!(result.filled_price, Some(dec!(0.99)));
    assert_eq!(result.filled_size, Some(dec!(10)));
    assert_eq!(rig.submitter.calls(), 0);

    let fired = record
        .history
        .iter()
        .find(|t| t.to == SessionState::Firing)
        .expect("firing transition")
        .at;
    let fire_at = deadline - Duration::from_secs(1);
    assert!(fired >= fire_at, "fired early at {}", fired);
    assert!(fired - fire_at <= Duration::from_millis(50), "fired late at {}", fired);
}

#[tokio::test(start_paused = true)]
async fn probability_drop_at_armed_aborts_without_building() {
    let rig = Rig::new();
    // Arm instant is deadline - 1.5s = 13.5s after open.
    let feed = Arc::new(
        MockFeed::steady(book(dec!(0.995))).then_at(Duration::from_millis(13_600), book(dec!(0.30))),
    );

    let record = run_session(market("m8", 15), sniper_config(false), rig.ctx(feed), StopSignal::never()).await;

    assert_eq!(record.state, SessionState::Aborted(AbortReason::ProbabilityBelowThreshold));
    assert_eq!(rig.executor.builds(), 0);
    assert_eq!(rig.submitter.calls(), 0);
    assert!(record.request.is_none());
    assert!(record.history.iter().any(|t| t.to == SessionState::Armed));
}

#[tokio::test(start_paused = true)]
async fn earlier_dip_does_not_block_firing() {
    let rig = Rig::new();
    let feed = Arc::new(
        MockFeed::steady(book(dec!(0.995)))
            .then_at(Duration::from_secs(5), book(dec!(0.30)))
            .then_at(Duration::from_secs(10), book(dec!(0.995))),
    );

    let record = run_session(market("dip", 15), sniper_config(false), rig.ctx(feed), StopSignal::never()).await;

    assert_eq!(record.state, SessionState::Settled);
    assert_eq!(record.probability.and_then(|p| p.value()), Some(dec!(0.995)));
    assert_eq!(rig.executor.builds(), 1);
    assert_eq!(rig.submitter.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn early_low_book_recovering_before_fire_settles() {
    let rig = Rig::new();
    let feed = Arc::new(MockFeed::steady(book(dec!(0.30))).then_at(Duration::from_secs(10), book(dec!(0.995))));

    let record = run_session(market("rise", 15), sniper_config(false), rig.ctx(feed), StopSignal::never()).await;

    assert_eq!(record.state, SessionState::Settled);
    assert_eq!(record.probability.and_then(|p| p.value()), Some(dec!(0.995)));
    assert_eq!(rig.executor.builds(), 1);
    assert_eq!(rig.submitter.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn feed_stuck_reconnecting_sends_no_order() {
    let rig = Rig::new();
    let feed = Arc::new(MockFeed::steady(book(dec!(0.995))).stall_after(Duration::from_secs(1)));

    let record = run_session(market("stuck", 15), sniper_config(false), rig.ctx(feed), StopSignal::never()).await;

    assert_eq!(record.state, SessionState::Aborted(AbortReason::MissedWindow));
    assert!(record.history.iter().all(|t| t.to != SessionState::Armed));
    assert_eq!(rig.executor.builds(), 0);
    assert_eq!(rig.submitter.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn expired_market_never_subscribes() {
    let rig = Rig::new();
    let feed = Arc::new(MockFeed::steady(book(dec!(0.995))));
    let past = Market {
        deadline: START - Duration::from_secs(30),
        ..market("old", 0)
    };

    let record = run_session(past, sniper_config(true), rig.ctx(feed.clone()), StopSignal::never()).await;

    assert_eq!(record.state, SessionState::Aborted(AbortReason::Expired));
    assert_eq!(feed.subscriptions(), 0);
    assert!(record.history.iter().all(|t| t.to != SessionState::Monitoring));
}

#[tokio::test(start_paused = true)]
async fn lost_feed_fails_session_and_supervisor_moves_on() {
    let rig = Rig::new();
    let feed = Arc::new(FlakyOnce {
        first: MockFeed::losing_after(book(dec!(0.995)), Duration::from_secs(2)),
        rest: MockFeed::steady(book(dec!(0.995))),
        opened: AtomicU32::new(0),
    });
    let scanner = Arc::new(MockScanner::new(vec![market("a", 15), market("b", 45)]));
    let supervisor = SniperSupervisor::new(
        scanner,
        rig.ctx(feed),
        sniper_config(true),
        SupervisorSettings::default(),
    );
    let stats_rx = supervisor.watch_stats();

    let stats = supervisor.run(stop_after(120)).await.expect("supervisor keeps running");

    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.settled, 1);
    assert_eq!(stats.last_outcome.as_deref(), Some("SETTLED"));
    assert_eq!(*stats_rx.borrow(), stats);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_order_per_market() {
    let rig = Rig::new();
    let feed = Arc::new(MockFeed::steady(book(dec!(0.995))));
    let scanner = Arc::new(MockScanner::new(vec![market("a", 15), market("b", 45), market("c", 80)]));
    let supervisor = SniperSupervisor::new(
        scanner.clone(),
        rig.ctx(feed),
        sniper_config(false),
        SupervisorSettings {
            live_start_delay: Duration::ZERO,
            ..SupervisorSettings::default()
        },
    );

    let stats = supervisor.run(stop_after(300)).await.expect("supervisor result");

    assert_eq!(stats.sessions, 3);
    assert_eq!(stats.settled, 3);

    let requests = rig.submitter.requests();
    assert_eq!(requests.len(), 3);
    let tokens: HashSet<_> = requests.iter().map(|r| r.token_id().to_string()).collect();
    assert_eq!(tokens.len(), 3);
    assert!(scanner.scans() >= 4);
}

#[tokio::test(start_paused = true)]
async fn stop_signal_cancels_without_ordering() {
    let rig = Rig::new();
    let feed = Arc::new(MockFeed::steady(book(dec!(0.995))));

    let record = run_session(market("x", 15), sniper_config(false), rig.ctx(feed), stop_after(8)).await;

    assert_eq!(record.state, SessionState::Aborted(AbortReason::Cancelled));
    assert_eq!(rig.executor.builds(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_feed_is_a_connect_failure() {
    let rig = Rig::new();
    let feed = Arc::new(MockFeed::silent());

    let record = run_session(market("s", 60), sniper_config(true), rig.ctx(feed), StopSignal::never()).await;

    assert_eq!(record.state, SessionState::Failed(FailReason::FeedConnect));
}

/// Config with defaults and the key from the environment, if usable.
fn env_config() -> Option<Config> {
    dotenvy::dotenv().ok();

    let private_key = std::env::var("POLYMARKET_PRIVATE_KEY").ok()?;

    // Skip if using placeholder key
    if private_key.starts_with("0x1234") || private_key.len() < 64 {
        return None;
    }

    envy::from_iter([("POLYMARKET_PRIVATE_KEY".to_string(), private_key)]).ok()
}

/// Test that the Gamma scanner can find a candidate.
#[tokio::test]
#[ignore = "requires network access"]
async fn test_market_discovery() {
    let config: Config = envy::from_iter([(
        "POLYMARKET_PRIVATE_KEY".to_string(),
        "0x0000000000000000000000000000000000000000000000000000000000000001".to_string(),
    )])
    .expect("default config");
    let scanner = GammaScanner::new(
        reqwest::Client::new(),
        config.polymarket_gamma_url.clone(),
        config.scan_queries(),
        SidePick::Favorite,
    );

    let filter = CandidateFilter {
        now: OffsetDateTime::now_utc(),
        horizon: Duration::from_secs(24 * 3600),
        exclude: HashSet::new(),
    };

    match scanner.next_candidate(&filter).await {
        Ok(Some(market)) => {
            println!("Found market: {} ({})", market.label(), market.id);
            assert!(!market.up_token_id.is_empty());
            assert!(!market.down_token_id.is_empty());
            assert!(market.deadline > filter.now);
        }
        Ok(None) => println!("No market within 24h"),
        Err(e) => panic!("Scan failed: {}", e),
    }
}

/// Test that the live feed delivers a first snapshot.
#[tokio::test]
#[ignore = "requires network access"]
async fn test_live_feed_first_snapshot() {
    let config: Config = envy::from_iter([(
        "POLYMARKET_PRIVATE_KEY".to_string(),
        "0x0000000000000000000000000000000000000000000000000000000000000001".to_string(),
    )])
    .expect("default config");
    let scanner = GammaScanner::new(
        reqwest::Client::new(),
        config.polymarket_gamma_url.clone(),
        config.scan_queries(),
        SidePick::Favorite,
    );
    let filter = CandidateFilter {
        now: OffsetDateTime::now_utc(),
        horizon: Duration::from_secs(24 * 3600),
        exclude: HashSet::new(),
    };
    let Some(market) = scanner.next_candidate(&filter).await.expect("scan") else {
        println!("Skipping: no market to subscribe to");
        return;
    };

    let feed = ClobFeed::new(config.feed());
    let handle = feed.subscribe(&market).await.expect("first snapshot");
    let snapshot = handle.latest().expect("snapshot");
    println!("UP: {:?} DOWN: {:?}", snapshot.up, snapshot.down);
    assert!(snapshot.sequence >= 1);
}

/// Test that the configured key loads into a signer.
#[tokio::test]
#[ignore = "requires POLYMARKET_PRIVATE_KEY"]
async fn test_wallet_address() {
    let config = match env_config() {
        Some(c) => c,
        None => {
            println!("Skipping: POLYMARKET_PRIVATE_KEY not set or invalid");
            return;
        }
    };

    let signer = polymarket_sniper::signing::create_signer(&config.polymarket_private_key).expect("signer");
    let address = polymarket_sniper::signing::address_of(&signer);
    assert!(address.starts_with("0x"), "Invalid address format");
    assert_eq!(address.len(), 42, "Address should be 42 characters");
}
