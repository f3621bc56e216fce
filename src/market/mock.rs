//! Scripted scanner, feed, and submitter for tests.
//!
//! Everything here runs on tokio time, so tests can pause and advance the clock
//! without touching the network.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;

use super::scanner::{CandidateFilter, MarketScanner};
use super::types::Market;
use crate::error::{MarketError, OrderError, RejectReason};
use crate::orderbook::{BookFeed, FeedHandle, FeedStatus, OrderBookSnapshot, TopOfBook};
use crate::trading::{OrderRequest, OrderSubmitter, SubmitFill};

/// Scanner over a fixed list of markets.
#[derive(Debug, Default)]
pub struct MockScanner {
    markets: Mutex<Vec<Market>>,
    scans: AtomicU32,
}

impl MockScanner {
    /// Scanner that knows `markets`.
    pub fn new(markets: Vec<Market>) -> Self {
        Self {
            markets: Mutex::new(markets),
            scans: AtomicU32::new(0),
        }
    }

    /// Make another market discoverable.
    pub fn push(&self, market: Market) {
        self.markets.lock().unwrap_or_else(|e| e.into_inner()).push(market);
    }

    /// Number of scans served.
    pub fn scans(&self) -> u32 {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketScanner for MockScanner {
    async fn next_candidate(&self, filter: &CandidateFilter) -> Result<Option<Market>, MarketError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let markets = self.markets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(markets
            .iter()
            .filter(|m| filter.accepts(m))
            .min_by_key(|m| m.deadline)
            .cloned())
    }
}

/// Feed that replays a book script from the moment it is opened.
#[derive(Debug)]
pub struct MockFeed {
    steps: Vec<(Duration, TopOfBook, TopOfBook)>,
    interval: Duration,
    lose_after: Option<Duration>,
    stall: Option<(Duration, Option<Duration>)>,
    connect_timeout: Duration,
    subscriptions: AtomicU32,
}

impl MockFeed {
    fn with_steps(steps: Vec<(Duration, TopOfBook, TopOfBook)>) -> Self {
        Self {
            steps,
            interval: Duration::from_millis(100),
            lose_after: None,
            stall: None,
            connect_timeout: Duration::from_secs(10),
            subscriptions: AtomicU32::new(0),
        }
    }

    /// Publishes the same book for as long as it is open.
    pub fn steady(book: (TopOfBook, TopOfBook)) -> Self {
        Self::with_steps(vec![(Duration::ZERO, book.0, book.1)])
    }

    /// Never delivers a snapshot.
    pub fn silent() -> Self {
        Self::with_steps(Vec::new())
    }

    /// Delivers `book`, then reports the feed lost after `after`.
    pub fn losing_after(book: (TopOfBook, TopOfBook), after: Duration) -> Self {
        Self::steady(book).lose_after(after)
    }

    /// Switch to `book` once `offset` has elapsed since opening.
    pub fn then_at(mut self, offset: Duration, book: (TopOfBook, TopOfBook)) -> Self {
        self.steps.push((offset, book.0, book.1));
        self.steps.sort_by_key(|(at, _, _)| *at);
        self
    }

    /// Report the feed lost once `after` has elapsed since opening.
    pub fn lose_after(mut self, after: Duration) -> Self {
        self.lose_after = Some(after);
        self
    }

    /// Report `Reconnecting` and stop publishing from `from` onwards, never recovering.
    pub fn stall_after(mut self, from: Duration) -> Self {
        self.stall = Some((from, None));
        self
    }

    /// Report `Reconnecting` between `from` and `until`, then go live and publish again.
    pub fn stall_between(mut self, from: Duration, until: Duration) -> Self {
        self.stall = Some((from, Some(until)));
        self
    }

    /// Time between republished snapshots.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Number of times the feed was opened.
    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BookFeed for MockFeed {
    fn open(&self, _market: &Market) -> FeedHandle {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (snap_tx, snap_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let steps = self.steps.clone();
        let interval = self.interval;
        let lose_after = self.lose_after;
        let stall = self.stall;

        let task = tokio::spawn(async move {
            if steps.is_empty() {
                std::future::pending::<()>().await;
            }

            let opened = Instant::now();
            let mut current = 0usize;
            let mut sequence = 0u64;
            let mut stalled = false;
            status_tx.send_replace(FeedStatus::Live);

            loop {
                let elapsed = opened.elapsed();
                if lose_after.is_some_and(|after| elapsed >= after) {
                    status_tx.send_replace(FeedStatus::Lost { attempts: 5 });
                    return;
                }
                let in_stall = stall.is_some_and(|(from, until)| {
                    elapsed >= from && until.map_or(true, |until| elapsed < until)
                });
                if in_stall {
                    if !stalled {
                        status_tx.send_replace(FeedStatus::Reconnecting { attempt: 1 });
                        stalled = true;
                    }
                    tokio::time::sleep(interval).await;
                    continue;
                }
                if stalled {
                    status_tx.send_replace(FeedStatus::Live);
                    stalled = false;
                }
                while current + 1 < steps.len() && steps[current + 1].0 <= elapsed {
                    current += 1;
                }

                sequence += 1;
                let (_, up, down) = steps[current];
                snap_tx.send_replace(Some(OrderBookSnapshot {
                    up,
                    down,
                    received_at: OffsetDateTime::now_utc(),
                    server_time: None,
                    sequence,
                }));
                tokio::time::sleep(interval).await;
            }
        });

        FeedHandle::new(snap_rx, status_rx, Some(task))
    }

    fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[derive(Debug, Clone)]
enum SubmitBehavior {
    Fill,
    Fail(OrderError),
}

/// Submitter that records requests and answers from a fixed behavior.
#[derive(Debug)]
pub struct MockSubmitter {
    behavior: SubmitBehavior,
    latency: Duration,
    calls: AtomicU32,
    requests: Mutex<Vec<OrderRequest>>,
}

impl MockSubmitter {
    fn with_behavior(behavior: SubmitBehavior) -> Self {
        Self {
            behavior,
            latency: Duration::from_millis(30),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fills every order at its limit.
    pub fn filling() -> Self {
        Self::with_behavior(SubmitBehavior::Fill)
    }

    /// Rejects every order.
    pub fn rejecting(reason: RejectReason) -> Self {
        Self::with_behavior(SubmitBehavior::Fail(OrderError::Rejected(reason)))
    }

    /// Fails every order with `error`.
    pub fn failing(error: OrderError) -> Self {
        Self::with_behavior(SubmitBehavior::Fail(error))
    }

    /// Number of submissions.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request submitted, in order.
    pub fn requests(&self) -> Vec<OrderRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl OrderSubmitter for MockSubmitter {
    async fn submit(&self, request: &OrderRequest) -> Result<SubmitFill, OrderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        tokio::time::sleep(self.latency).await;

        match &self.behavior {
            SubmitBehavior::Fill => Ok(SubmitFill {
                order_id: Some(format!("mock-{}", n)),
                filled_price: request.price(),
                filled_size: request.size(),
            }),
            SubmitBehavior::Fail(e) => Err(e.clone()),
        }
    }
}
