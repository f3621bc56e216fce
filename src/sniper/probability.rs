//! Implied win probability from the live book.

use rust_decimal::Decimal;

use crate::market::Outcome;
use crate::orderbook::OrderBookSnapshot;

/// Implied probability for one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbabilityEstimate {
    /// Mid price clamped to [0, 1].
    Known(Decimal),
    /// One side of the book is empty.
    Indeterminate,
}

impl ProbabilityEstimate {
    /// The probability, if determinate.
    pub fn value(&self) -> Option<Decimal> {
        match self {
            ProbabilityEstimate::Known(p) => Some(*p),
            ProbabilityEstimate::Indeterminate => None,
        }
    }

    /// Whether the estimate clears `threshold`. Indeterminate never does.
    pub fn clears(&self, threshold: Decimal) -> bool {
        self.value().is_some_and(|p| p >= threshold)
    }
}

/// Mid price of the outcome's token, clamped to [0, 1].
pub fn evaluate(snapshot: &OrderBookSnapshot, outcome: Outcome) -> ProbabilityEstimate {
    match snapshot.side(outcome).mid() {
        Some(mid) => ProbabilityEstimate::Known(mid.clamp(Decimal::ZERO, Decimal::ONE)),
        None => ProbabilityEstimate::Indeterminate,
    }
}

/// The outcome the book currently favours. Ties go to Up.
///
/// Returns `None` when neither side is determinate.
pub fn favorite(snapshot: &OrderBookSnapshot) -> Option<Outcome> {
    match (
        evaluate(snapshot, Outcome::Up).value(),
        evaluate(snapshot, Outcome::Down).value(),
    ) {
        (Some(up), Some(down)) if down > up => Some(Outcome::Down),
        (Some(_), _) => Some(Outcome::Up),
        (None, Some(_)) => Some(Outcome::Down),
        (None, None) => None,
    }
}
