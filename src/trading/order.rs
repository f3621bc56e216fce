//! Order types and creation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::OrderError;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy order.
    #[strum(to_string = "BUY", serialize = "buy")]
    Buy,
    /// Sell order.
    #[strum(to_string = "SELL", serialize = "sell")]
    Sell,
}

/// Order time-in-force.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Fill-or-kill: must fill entirely or cancel.
    #[default]
    #[strum(to_string = "FOK", serialize = "fok")]
    FOK,
    /// Good-till-cancelled: stays on book until filled or cancelled.
    #[strum(to_string = "GTC", serialize = "gtc")]
    GTC,
}

/// A validated order, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    token_id: String,
    side: Side,
    price: Decimal,
    size: Decimal,
    tif: TimeInForce,
}

impl OrderRequest {
    /// Fill-or-Kill buy of `size` shares of `token_id` at limit `price`.
    pub fn fok_buy(token_id: impl Into<String>, price: Decimal, size: Decimal) -> Result<Self, OrderError> {
        let request = Self {
            token_id: token_id.into(),
            side: Side::Buy,
            price,
            size,
            tif: TimeInForce::FOK,
        };
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<(), OrderError> {
        if self.token_id.trim().is_empty() {
            return Err(OrderError::InvalidParams("token_id is required".to_string()));
        }
        if self.price <= Decimal::ZERO || self.price >= Decimal::ONE {
            return Err(OrderError::PriceOutOfRange(self.price));
        }
        if self.size <= Decimal::ZERO {
            return Err(OrderError::InvalidParams("size must be positive".to_string()));
        }
        Ok(())
    }

    /// Token to trade.
    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    /// Order side.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Limit price.
    pub fn price(&self) -> Decimal {
        self.price
    }

    /// Share count.
    pub fn size(&self) -> Decimal {
        self.size
    }

    /// Time-in-force.
    pub fn tif(&self) -> TimeInForce {
        self.tif
    }

    /// Collateral committed if filled at the limit.
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}
