//! Live order-book feed for one market.
//!
//! A feed task owns the websocket and publishes into two single-slot cells: the latest
//! [`OrderBookSnapshot`] and a [`FeedStatus`] health signal. Readers only ever see the
//! freshest value.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::types::OrderBookSnapshot;
use super::websocket::{Backoff, MarketBook};
use crate::error::FeedError;
use crate::market::Market;
use crate::metrics;

/// Health of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// First connection in progress.
    Connecting,
    /// Connected and delivering snapshots.
    Live,
    /// Connection dropped; retrying.
    Reconnecting {
        /// One-based reconnect attempt.
        attempt: u32,
    },
    /// Reconnect budget exhausted. Terminal.
    Lost {
        /// Failed attempts before giving up.
        attempts: u32,
    },
}

/// Something the session should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A newer snapshot is available.
    Snapshot(OrderBookSnapshot),
    /// Health changed but the feed is still usable.
    Status(FeedStatus),
    /// The feed is gone for good.
    Lost(FeedError),
}

/// Tunables for the live feed.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket base URL.
    pub ws_url: String,
    /// Time allowed for the first snapshot.
    pub connect_timeout: Duration,
    /// Consecutive failed connection attempts before the feed is lost.
    pub max_reconnects: u32,
    /// Reconnect delay schedule.
    pub backoff: Backoff,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_reconnects: 5,
            backoff: Backoff::default(),
        }
    }
}

/// Reader side of a running feed. Stops the feed task when dropped.
pub struct FeedHandle {
    snapshots: watch::Receiver<Option<OrderBookSnapshot>>,
    status: watch::Receiver<FeedStatus>,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    /// Wrap the receiving ends of a feed. `task` is aborted on drop.
    pub fn new(
        snapshots: watch::Receiver<Option<OrderBookSnapshot>>,
        status: watch::Receiver<FeedStatus>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { snapshots, status, task }
    }

    /// The freshest snapshot, if any has arrived.
    pub fn latest(&self) -> Option<OrderBookSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Current health.
    pub fn status(&self) -> FeedStatus {
        *self.status.borrow()
    }

    fn terminal_error(&self) -> FeedError {
        match *self.status.borrow() {
            FeedStatus::Lost { attempts } => FeedError::Lost { attempts },
            _ => FeedError::Closed,
        }
    }

    /// Wait for the first snapshot, failing after `timeout`.
    pub async fn wait_first(&mut self, timeout: Duration) -> Result<OrderBookSnapshot, FeedError> {
        let wait = async {
            loop {
                if let Some(snapshot) = self.snapshots.borrow_and_update().clone() {
                    return Ok(snapshot);
                }
                if let FeedStatus::Lost { attempts } = *self.status.borrow_and_update() {
                    return Err(FeedError::Lost { attempts });
                }
                let closed = tokio::select! {
                    r = self.snapshots.changed() => r.is_err(),
                    r = self.status.changed() => r.is_err(),
                };
                if closed {
                    return Err(self.terminal_error());
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| FeedError::ConnectTimeout { timeout })?
    }

    /// Wait for the next snapshot or health change.
    pub async fn next_event(&mut self) -> FeedEvent {
        loop {
            tokio::select! {
                biased;
                r = self.status.changed() => {
                    if r.is_err() {
                        return FeedEvent::Lost(self.terminal_error());
                    }
                    let status = *self.status.borrow_and_update();
                    return match status {
                        FeedStatus::Lost { attempts } => FeedEvent::Lost(FeedError::Lost { attempts }),
                        other => FeedEvent::Status(other),
                    };
                }
                r = self.snapshots.changed() => {
                    if r.is_err() {
                        return FeedEvent::Lost(self.terminal_error());
                    }
                    if let Some(snapshot) = self.snapshots.borrow_and_update().clone() {
                        return FeedEvent::Snapshot(snapshot);
                    }
                }
            }
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Source of live order-book data.
#[async_trait]
pub trait BookFeed: Send + Sync {
    /// Start streaming the market's two outcome books. Returns immediately.
    fn open(&self, market: &Market) -> FeedHandle;

    /// How long [`BookFeed::subscribe`] waits for the first snapshot.
    fn connect_timeout(&self) -> Duration;

    /// Open the feed and wait until the first snapshot arrives.
    async fn subscribe(&self, market: &Market) -> Result<FeedHandle, FeedError> {
        let mut handle = self.open(market);
        handle.wait_first(self.connect_timeout()).await?;
        Ok(handle)
    }
}

/// Feed backed by the CLOB market websocket.
#[derive(Debug, Clone, Default)]
pub struct ClobFeed {
    settings: FeedSettings,
}

impl ClobFeed {
    /// Create a feed with the given settings.
    pub fn new(settings: FeedSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BookFeed for ClobFeed {
    fn open(&self, market: &Market) -> FeedHandle {
        let (snap_tx, snap_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let book = Arc::new(MarketBook::new(&market.up_token_id, &market.down_token_id));
        let task = tokio::spawn(run_feed(self.settings.clone(), book, snap_tx, status_tx));
        FeedHandle::new(snap_rx, status_rx, Some(task))
    }

    fn connect_timeout(&self) -> Duration {
        self.settings.connect_timeout
    }
}

/// Keep the websocket alive until the budget runs out or every reader is gone.
#[instrument(skip_all)]
async fn run_feed(
    settings: FeedSettings,
    book: Arc<MarketBook>,
    snapshots: watch::Sender<Option<OrderBookSnapshot>>,
    status: watch::Sender<FeedStatus>,
) {
    let url = format!("{}/ws/market", settings.ws_url.trim_end_matches('/'));
    let mut failures = 0u32;

    loop {
        match book
            .stream_once(&url, settings.connect_timeout, &snapshots, &status)
            .await
        {
            Ok(true) => {
                warn!("Market feed stream ended, will reconnect");
                failures = 0;
            }
            Ok(false) => {
                warn!("Market feed closed before delivering data");
                failures += 1;
            }
            Err(e) => {
                warn!(error = %e, failures = failures + 1, "Market feed connection failed");
                failures += 1;
            }
        }

        if snapshots.is_closed() {
            info!("Feed handle dropped, stopping market feed");
            return;
        }

        if failures >= settings.max_reconnects {
            error!(attempts = failures, "Market feed reconnect budget exhausted");
            status.send_replace(FeedStatus::Lost { attempts: failures });
            return;
        }

        let delay = settings.backoff.next_delay(failures.saturating_sub(1));
        status.send_replace(FeedStatus::Reconnecting { attempt: failures + 1 });
        metrics::inc_feed_reconnects();
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting market feed");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::TopOfBook;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn snapshot(sequence: u64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            up: TopOfBook::new(Some(dec!(0.9)), Some(dec!(0.91))),
            down: TopOfBook::new(Some(dec!(0.09)), Some(dec!(0.1))),
            received_at: OffsetDateTime::UNIX_EPOCH,
            server_time: None,
            sequence,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_first_times_out_without_data() {
        let (_snap_tx, snap_rx) = watch::channel(None);
        let (_status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let mut handle = FeedHandle::new(snap_rx, status_rx, None);

        let err = handle.wait_first(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err, FeedError::ConnectTimeout { timeout: Duration::from_secs(10) });
    }

    #[tokio::test(start_paused = true)]
    async fn wait_first_returns_published_snapshot() {
        let (snap_tx, snap_rx) = watch::channel(None);
        let (_status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let mut handle = FeedHandle::new(snap_rx, status_rx, None);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            snap_tx.send_replace(Some(snapshot(1)));
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let first = handle.wait_first(Duration::from_secs(10)).await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(handle.latest(), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_first_reports_lost_feed() {
        let (_snap_tx, snap_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let mut handle = FeedHandle::new(snap_rx, status_rx, None);
        status_tx.send_replace(FeedStatus::Lost { attempts: 5 });

        let err = handle.wait_first(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err, FeedError::Lost { attempts: 5 });
    }

    #[tokio::test]
    async fn next_event_prefers_status_and_keeps_latest_snapshot() {
        let (snap_tx, snap_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let mut handle = FeedHandle::new(snap_rx, status_rx, None);

        snap_tx.send_replace(Some(snapshot(1)));
        snap_tx.send_replace(Some(snapshot(2)));
        assert_eq!(handle.next_event().await, FeedEvent::Snapshot(snapshot(2)));

        status_tx.send_replace(FeedStatus::Reconnecting { attempt: 1 });
        assert_eq!(handle.next_event().await, FeedEvent::Status(FeedStatus::Reconnecting { attempt: 1 }));

        status_tx.send_replace(FeedStatus::Lost { attempts: 5 });
        assert_eq!(handle.next_event().await, FeedEvent::Lost(FeedError::Lost { attempts: 5 }));
    }

    #[tokio::test]
    async fn dropped_feed_is_reported_as_closed() {
        let (snap_tx, snap_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Live);
        let mut handle = FeedHandle::new(snap_rx, status_rx, None);
        drop(snap_tx);
        drop(status_tx);

        assert_eq!(handle.next_event().await, FeedEvent::Lost(FeedError::Closed));
    }
}
