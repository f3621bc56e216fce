//! Market descriptors for time-bounded up/down markets.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

/// One side of a binary up/down market.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Outcome {
    /// Price finishes up (YES token).
    #[strum(to_string = "up", serialize = "yes")]
    #[default]
    Up,
    /// Price finishes down (NO token).
    #[strum(to_string = "down", serialize = "no")]
    Down,
}

impl Outcome {
    /// Get the opposite outcome.
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Up => Outcome::Down,
            Outcome::Down => Outcome::Up,
        }
    }
}

/// Which side a session assumes will win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SidePick {
    /// Always buy this outcome.
    Fixed(Outcome),
    /// Buy whichever outcome the book favours at the fire instant.
    #[default]
    Favorite,
}

impl FromStr for SidePick {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("favorite") || s.eq_ignore_ascii_case("favourite") {
            return Ok(SidePick::Favorite);
        }
        Outcome::from_str(s).map(SidePick::Fixed)
    }
}

impl std::fmt::Display for SidePick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SidePick::Fixed(outcome) => write!(f, "{}", outcome),
            SidePick::Favorite => f.write_str("favorite"),
        }
    }
}

/// A market eligible for sniping. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Market {
    /// Condition id.
    pub id: String,
    /// UP (YES) token ID for CLOB.
    pub up_token_id: String,
    /// DOWN (NO) token ID for CLOB.
    pub down_token_id: String,
    /// Assumed winning side.
    pub side: SidePick,
    /// Resolution deadline (UTC).
    pub deadline: OffsetDateTime,
    /// Market question text.
    pub question: Option<String>,
}

impl Market {
    /// Get the token ID for a given outcome.
    pub fn token_id(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Up => &self.up_token_id,
            Outcome::Down => &self.down_token_id,
        }
    }

    /// Map a token id back to its outcome.
    pub fn outcome_of(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.up_token_id {
            Some(Outcome::Up)
        } else if token_id == self.down_token_id {
            Some(Outcome::Down)
        } else {
            None
        }
    }

    /// Time left until the deadline, or `None` once it has passed.
    pub fn time_remaining(&self, now: OffsetDateTime) -> Option<Duration> {
        let remaining = self.deadline - now;
        if remaining.is_positive() {
            Duration::try_from(remaining).ok()
        } else {
            None
        }
    }

    /// Format remaining time as "Xm Ys" string.
    pub fn time_remaining_str(&self, now: OffsetDateTime) -> String {
        match self.time_remaining(now) {
            Some(duration) => {
                let secs = duration.as_secs();
                format!("{}m {}s", secs / 60, secs % 60)
            }
            None => "CLOSED".to_string(),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &str {
        self.question.as_deref().unwrap_or(&self.id)
    }
}
