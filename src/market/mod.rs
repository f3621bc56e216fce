//! Market module for crypto up/down prediction markets.
//!
//! This module handles:
//! - Market descriptors and outcome/side types
//! - Candidate discovery through the Gamma search API
//! - Scripted scanner, feed, and submitter for tests

pub mod mock;
pub mod scanner;
pub mod types;

pub use mock::{MockFeed, MockScanner, MockSubmitter};
pub use scanner::{CandidateFilter, GammaScanner, MarketScanner};
pub use types::{Market, Outcome, SidePick};
