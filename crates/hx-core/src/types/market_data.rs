//! Market data structures flowing from the feed to the scheduler.
//!
//! # Timestamp convention
//!
//! All timestamps are in **microseconds since Unix epoch** (us).

use serde::{Deserialize, Serialize};

use super::enums::TickType;

/// A tick as delivered by a [`PriceSource`](crate::exchange::PriceSource),
/// before normalization. Symbols may carry whitespace or lowercase and prices
/// are not validated yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    pub symbol: String,
    pub price: f64,
    pub timestamp_us: u64,
    pub kind: TickType,
}

impl RawTick {
    pub fn trade(symbol: impl Into<String>, price: f64, timestamp_us: u64) -> Self {
        Self { symbol: symbol.into(), price, timestamp_us, kind: TickType::Trade }
    }

    pub fn book(symbol: impl Into<String>, price: f64, timestamp_us: u64) -> Self {
        Self { symbol: symbol.into(), price, timestamp_us, kind: TickType::BookUpdate }
    }
}

/// A normalized market event.
///
/// `epoch` increases by one each time the feed (re)connects to its source.
/// Timestamps are non-decreasing per symbol within an epoch; across epochs
/// gaps and resets are possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub price: f64,
    pub timestamp_us: u64,
    pub kind: TickType,
    pub epoch: u64,
}

impl std::fmt::Display for MarketEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tick({} {:.8} {:?} ts={} ep={})",
            self.symbol, self.price, self.kind, self.timestamp_us, self.epoch
        )
    }
}
