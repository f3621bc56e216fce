//! WebSocket client for the Polymarket CLOB market channel.
//!
//! Features:
//! - L2 book per asset from `book` snapshots and `price_change` deltas
//! - Stale and duplicate event discard per asset
//! - Exponential reconnect backoff
//! - Heartbeat pings

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::feed::FeedStatus;
use super::types::{OrderBookSnapshot, TopOfBook};
use crate::error::WsError;
use crate::metrics;

/// Interval between application-level pings.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// L2 book state maintained from WebSocket updates.
#[derive(Debug, Clone, Default)]
pub struct L2BookState {
    /// Bid levels: price -> size.
    pub bids: HashMap<Decimal, Decimal>,
    /// Ask levels: price -> size.
    pub asks: HashMap<Decimal, Decimal>,
    /// Server timestamp of the last accepted event (milliseconds).
    pub last_timestamp_ms: Option<i64>,
    /// Hash of the last accepted event.
    pub last_hash: Option<String>,
}

impl L2BookState {
    /// Apply a full book snapshot.
    pub fn apply_snapshot(&mut self, bids: &[WsLevel], asks: &[WsLevel]) {
        self.bids.clear();
        self.asks.clear();

        for level in bids {
            if let (Some(price), Some(size)) = (level.price_decimal(), level.size_decimal()) {
                if size > Decimal::ZERO {
                    self.bids.insert(price, size);
                }
            }
        }

        for level in asks {
            if let (Some(price), Some(size)) = (level.price_decimal(), level.size_decimal()) {
                if size > Decimal::ZERO {
                    self.asks.insert(price, size);
                }
            }
        }
    }

    /// Apply a price change delta.
    pub fn apply_delta(&mut self, change: &WsPriceChange) {
        let (Ok(price), Ok(size)) = (change.price.parse::<Decimal>(), change.size.parse::<Decimal>()) else {
            return;
        };

        let book = match change.side.to_uppercase().as_str() {
            "BUY" => &mut self.bids,
            "SELL" => &mut self.asks,
            _ => return,
        };

        if size <= Decimal::ZERO {
            book.remove(&price);
        } else {
            book.insert(price, size);
        }
    }

    /// Whether an event stamped `(timestamp, hash)` is newer than what was applied.
    ///
    /// Older timestamps are stale; an identical timestamp and hash is a duplicate.
    pub fn accepts(&self, timestamp_ms: Option<i64>, hash: Option<&str>) -> bool {
        match (self.last_timestamp_ms, timestamp_ms) {
            (Some(last), Some(ts)) if ts < last => false,
            (Some(last), Some(ts)) if ts == last => match (self.last_hash.as_deref(), hash) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            },
            _ => true,
        }
    }

    /// Record the stamp of an applied event.
    pub fn mark(&mut self, timestamp_ms: Option<i64>, hash: Option<&str>) {
        if timestamp_ms.is_some() {
            self.last_timestamp_ms = timestamp_ms;
        }
        if let Some(hash) = hash {
            self.last_hash = Some(hash.to_string());
        }
    }

    /// Highest bid and lowest ask.
    pub fn top(&self) -> TopOfBook {
        TopOfBook {
            best_bid: self.bids.keys().copied().max(),
            best_ask: self.asks.keys().copied().min(),
        }
    }
}

/// Price level from WebSocket.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WsLevel {
    /// Price as string.
    pub price: String,
    /// Size as string.
    pub size: String,
}

impl WsLevel {
    /// Parse price to Decimal.
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.parse().ok()
    }

    /// Parse size to Decimal.
    pub fn size_decimal(&self) -> Option<Decimal> {
        self.size.parse().ok()
    }
}

/// Price change from WebSocket.
#[derive(Debug, Clone, Deserialize)]
pub struct WsPriceChange {
    /// Asset ID (absent in the older per-asset format).
    #[serde(default)]
    pub asset_id: Option<String>,
    /// Price as string.
    pub price: String,
    /// Size as string.
    pub size: String,
    /// Side: "BUY" or "SELL".
    pub side: String,
    /// Optional hash.
    #[serde(default)]
    pub hash: Option<String>,
}

/// WebSocket event from Polymarket.
#[derive(Debug, Clone, Deserialize)]
pub struct WsEvent {
    /// Event type: "book" or "price_change".
    #[serde(default)]
    pub event_type: Option<String>,
    /// Asset ID (for book events).
    #[serde(default)]
    pub asset_id: Option<String>,
    /// Bid levels (for book events).
    #[serde(default, alias = "buys")]
    pub bids: Option<Vec<WsLevel>>,
    /// Ask levels (for book events).
    #[serde(default, alias = "sells")]
    pub asks: Option<Vec<WsLevel>>,
    /// Price changes (for price_change events).
    #[serde(default, alias = "changes")]
    pub price_changes: Option<Vec<WsPriceChange>>,
    /// Timestamp in milliseconds; sent as a string or a number.
    #[serde(default, deserialize_with = "de_opt_millis")]
    pub timestamp: Option<i64>,
    /// Event hash.
    #[serde(default)]
    pub hash: Option<String>,
}

fn de_opt_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// WebSocket subscription message.
#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    /// Message type.
    #[serde(rename = "type")]
    msg_type: &'static str,
    /// Asset IDs to subscribe to.
    assets_ids: [&'a str; 2],
}

/// Reconnect backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            multiplier: 2.0,
            cap: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Calculate the delay for a zero-based attempt with exponential backoff.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let clamped_ms = delay_ms.min(self.cap.as_millis() as f64) as u64;
        Duration::from_millis(clamped_ms)
    }
}

/// Book state for one market's two outcome tokens.
pub struct MarketBook {
    /// Book state per asset ID.
    books: DashMap<String, L2BookState>,
    up_asset: String,
    down_asset: String,
    /// Accepted-update counter.
    sequence: AtomicU64,
}

impl MarketBook {
    /// Create empty books for the up and down tokens.
    pub fn new(up_asset: impl Into<String>, down_asset: impl Into<String>) -> Self {
        let up_asset = up_asset.into();
        let down_asset = down_asset.into();
        let books = DashMap::new();
        books.insert(up_asset.clone(), L2BookState::default());
        books.insert(down_asset.clone(), L2BookState::default());
        Self {
            books,
            up_asset,
            down_asset,
            sequence: AtomicU64::new(0),
        }
    }

    /// Get book state for an asset.
    pub fn get_book(&self, asset_id: &str) -> Option<L2BookState> {
        self.books.get(asset_id).map(|b| b.clone())
    }

    /// Current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn top(&self, asset_id: &str) -> TopOfBook {
        self.books.get(asset_id).map(|b| b.top()).unwrap_or_default()
    }

    /// Apply one raw message; returns a fresh snapshot when anything was accepted.
    ///
    /// Messages can be single objects or arrays.
    pub fn apply_message(&self, text: &str, received_at: OffsetDateTime) -> Option<OrderBookSnapshot> {
        let trimmed = text.trim();
        let events: Vec<WsEvent> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).ok()?
        } else if trimmed.starts_with('{') {
            vec![serde_json::from_str(trimmed).ok()?]
        } else {
            // "PONG" and other keepalive text
            return None;
        };

        let mut accepted = false;
        let mut newest_ts: Option<i64> = None;

        for event in &events {
            let applied = match event.event_type.as_deref() {
                Some("book") => self.apply_book(event),
                Some("price_change") => self.apply_price_change(event),
                _ => false,
            };
            if applied {
                accepted = true;
                newest_ts = newest_ts.max(event.timestamp);
            }
        }

        if !accepted {
            return None;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let server_time = newest_ts.and_then(|ms| {
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
        });

        Some(OrderBookSnapshot {
            up: self.top(&self.up_asset),
            down: self.top(&self.down_asset),
            received_at,
            server_time,
            sequence,
        })
    }

    fn apply_book(&self, event: &WsEvent) -> bool {
        let Some(asset_id) = event.asset_id.as_deref() else {
            return false;
        };
        let Some(mut book) = self.books.get_mut(asset_id) else {
            return false;
        };
        if !book.accepts(event.timestamp, event.hash.as_deref()) {
            debug!(asset = %asset_id, ts = ?event.timestamp, "Discarding stale book event");
            return false;
        }
        book.apply_snapshot(
            event.bids.as_deref().unwrap_or_default(),
            event.asks.as_deref().unwrap_or_default(),
        );
        book.mark(event.timestamp, event.hash.as_deref());
        true
    }

    fn apply_price_change(&self, event: &WsEvent) -> bool {
        let Some(changes) = &event.price_changes else {
            return false;
        };

        let mut applied = false;
        for change in changes {
            let Some(asset_id) = change.asset_id.as_deref().or(event.asset_id.as_deref()) else {
                continue;
            };
            let Some(mut book) = self.books.get_mut(asset_id) else {
                continue;
            };
            let hash = change.hash.as_deref().or(event.hash.as_deref());
            if !book.accepts(event.timestamp, hash) {
                debug!(asset = %asset_id, ts = ?event.timestamp, "Discarding stale price change");
                continue;
            }
            book.apply_delta(change);
            book.mark(event.timestamp, hash);
            applied = true;
        }
        applied
    }

    /// Connect once, subscribe, and publish snapshots until the stream ends.
    ///
    /// Returns whether at least one snapshot was delivered on this connection.
    pub async fn stream_once(
        &self,
        url: &str,
        connect_timeout: Duration,
        snapshots: &watch::Sender<Option<OrderBookSnapshot>>,
        status: &watch::Sender<FeedStatus>,
    ) -> Result<bool, WsError> {
        info!(url = %url, up = %self.up_asset, down = %self.down_asset, "Connecting to market feed");

        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| WsError::ConnectionFailed(format!("connect timed out after {:?}", connect_timeout)))??;

        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = SubscribeMessage {
            msg_type: "market",
            assets_ids: [self.up_asset.as_str(), self.down_asset.as_str()],
        };
        let msg_json = serde_json::to_string(&subscribe_msg)
            .map_err(|e| WsError::SendFailed(e.to_string()))?;
        write
            .send(Message::Text(msg_json))
            .await
            .map_err(|e| WsError::SendFailed(e.to_string()))?;

        info!("Subscribed to market channel");

        let mut delivered = false;
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write
                        .send(Message::Text("PING".to_string()))
                        .await
                        .map_err(|e| WsError::SendFailed(e.to_string()))?;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::inc_feed_messages();
                        if let Some(snapshot) = self.apply_message(&text, OffsetDateTime::now_utc()) {
                            if !delivered {
                                status.send_replace(FeedStatus::Live);
                                delivered = true;
                            }
                            if snapshots.send(Some(snapshot)).is_err() {
                                debug!("No snapshot receivers left");
                                return Ok(delivered);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(frame = ?frame, "WebSocket closed");
                        return Ok(delivered);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(delivered),
                }
            }
        }
    }
}
