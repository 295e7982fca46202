//! Latest bid/ask/mid per symbol. Written only by the engine loop's
//! price-update dispatch; read by every margin calculation and sweep.

use std::collections::HashMap;

use chrono::Utc;
use log::warn;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::evaluator::MAX_INPUT_MAGNITUDE;
use crate::types::quote::PriceQuote;

#[derive(Debug, Default)]
pub struct PriceCache {
    quotes: HashMap<String, PriceQuote>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the symbol's quote. Non-positive and out-of-range prices
    /// are rejected as a logged no-op; returns whether the quote was stored.
    pub fn update(&mut self, symbol: &str, bid: Decimal, ask: Decimal) -> bool {
        if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
            warn!("rejecting non-positive quote for {symbol}: bid={bid} ask={ask}");
            return false;
        }
        if bid > MAX_INPUT_MAGNITUDE || ask > MAX_INPUT_MAGNITUDE {
            warn!("rejecting out-of-range quote for {symbol}: bid={bid} ask={ask}");
            return false;
        }
        self.quotes.insert(
            symbol.to_string(),
            PriceQuote {
                bid,
                ask,
                mid: (bid + ask) / dec!(2),
                last_updated: Utc::now(),
            },
        );
        true
    }

    /// Latest quote, or `None` if the symbol was never seen. Callers must
    /// treat `None` as a hard precondition failure for any priced action.
    pub fn quote(&self, symbol: &str) -> Option<&PriceQuote> {
        self.quotes.get(symbol)
    }
}
