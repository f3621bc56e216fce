//! Order book types and data structures.

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use crate::market::Outcome;

/// Best bid and ask for one outcome token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopOfBook {
    /// Highest bid, if any.
    pub best_bid: Option<Decimal>,
    /// Lowest ask, if any.
    pub best_ask: Option<Decimal>,
}

impl TopOfBook {
    /// Create from explicit prices.
    pub fn new(best_bid: Option<Decimal>, best_ask: Option<Decimal>) -> Self {
        Self { best_bid, best_ask }
    }

    /// Mid price; `None` unless both sides are present.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }
}

/// Latest view of both outcome books. Replaced wholesale on every accepted update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookSnapshot {
    /// Up (YES) token.
    pub up: TopOfBook,
    /// Down (NO) token.
    pub down: TopOfBook,
    /// Local wall-clock receipt time.
    pub received_at: OffsetDateTime,
    /// Server timestamp of the newest event folded in, when reported.
    pub server_time: Option<OffsetDateTime>,
    /// Monotonic feed sequence number.
    pub sequence: u64,
}

impl OrderBookSnapshot {
    /// Top of book for an outcome.
    pub fn side(&self, outcome: Outcome) -> &TopOfBook {
        match outcome {
            Outcome::Up => &self.up,
            Outcome::Down => &self.down,
        }
    }
}
