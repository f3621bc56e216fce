//! Order book module for live market data.
//!
//! This module handles:
//! - Top-of-book snapshot types
//! - L2 book maintenance from the market websocket
//! - The feed handle sessions read from

pub mod feed;
pub mod types;
pub mod websocket;

pub use feed::{BookFeed, ClobFeed, FeedEvent, FeedHandle, FeedSettings, FeedStatus};
pub use types::{OrderBookSnapshot, TopOfBook};
pub use websocket::{Backoff, L2BookState, MarketBook};
