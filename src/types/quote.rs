use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::position::Side;

/// Latest quote for one symbol. Never persisted; rebuilt from the next tick
/// after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub bid: Decimal,
    pub ask: Decimal,
    /// (bid + ask) / 2.
    pub mid: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl PriceQuote {
    /// Price a position opens at: the side unfavorable to the trader.
    /// Long fills against the ask, Short against the bid.
    pub fn open_price(&self, side: Side) -> Decimal {
        match side {
            Side::Long => self.ask,
            Side::Short => self.bid,
        }
    }

    /// Price a position closes at: the opening convention in reverse.
    /// A flattening Long sells into the bid, a Short buys back at the ask.
    pub fn close_price(&self, side: Side) -> Decimal {
        match side {
            Side::Long => self.bid,
            Side::Short => self.ask,
        }
    }
}
