//! # hx-md
//!
//! Market data feed for the trading engine.
//!
//! ## Architecture
//!
//! A [`feed::MarketDataFeed`] subscribes to a
//! [`PriceSource`](hx_core::exchange::PriceSource), tags every tick with the
//! connection epoch and hands it to a normalizer running on a blocking
//! thread. The normalizer emits [`MarketEvent`](hx_core::types::MarketEvent)s
//! whose timestamps never go backwards per symbol within an epoch.
//!
//! - [`feed`]: ingest task, reconnect with backoff, symbol set
//! - [`normalize`]: validation, ordering filter, counters

pub mod feed;
pub mod normalize;

pub use feed::MarketDataFeed;
pub use normalize::{FeedStats, FeedStatsSnapshot};
