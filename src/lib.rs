//! Last-second sniper for Polymarket crypto up/down markets.
//!
//! Short-horizon "Bitcoin/Ethereum/Solana Up or Down" markets resolve at a fixed instant.
//! A second before resolution the outcome is usually no longer in doubt, yet the winning
//! side can still trade below $1.00. The sniper watches the live book and, at
//! `deadline - trigger_offset`, buys the likely winner with a single Fill-or-Kill order
//! when its implied probability clears a threshold.
//!
//! ```text
//! deadline:          12:15:00
//! monitor from:      12:10:00   subscribe to the book
//! arm at:            12:14:58.5
//! fire at:           12:14:59   mid(UP) = 0.995 >= 0.50 -> FOK BUY UP @ 0.99
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`market`]: Market descriptors and candidate discovery
//! - [`orderbook`]: Live order-book feed and top-of-book snapshots
//! - [`sniper`]: Probability, timing, the session state machine, and the supervisor
//! - [`trading`]: Order construction and execution
//! - [`signing`]: Wallet signing and API authentication
//! - [`api`]: HTTP API for health/status
//! - [`metrics`]: Prometheus metrics
//! - [`utils`]: Shutdown plumbing

pub mod api;
pub mod config;
pub mod error;
pub mod market;
pub mod metrics;
pub mod orderbook;
pub mod signing;
pub mod sniper;
pub mod trading;
pub mod utils;

pub use config::{Config, SniperConfig};
pub use error::{BotError, Result};
pub use sniper::{run_session, start_supervisor};
