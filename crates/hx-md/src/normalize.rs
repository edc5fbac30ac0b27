//! Tick normalization worker that runs on a dedicated thread.
//!
//! Receives `(epoch, RawTick)` pairs from the ingest task over a crossbeam
//! channel, cleans and validates them, enforces per-symbol timestamp
//! ordering within an epoch and forwards [`MarketEvent`]s to the dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Receiver;
use hx_core::dedup::MonotonicGuard;
use hx_core::types::{MarketEvent, RawTick};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Feed counters, shared between the worker and whoever reports on it.
#[derive(Debug, Default)]
pub struct FeedStats {
    pub accepted: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub dropped_stale: AtomicU64,
    /// Connection epochs opened so far.
    pub epochs: AtomicU64,
    /// Times the ingest task had to wait on a full queue.
    pub ingest_waits: AtomicU64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            epochs: self.epochs.load(Ordering::Relaxed),
            ingest_waits: self.ingest_waits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedStatsSnapshot {
    pub accepted: u64,
    pub dropped_invalid: u64,
    pub dropped_stale: u64,
    pub epochs: u64,
    pub ingest_waits: u64,
}

/// Why a tick was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// Empty symbol or non-finite / non-positive price.
    Invalid,
    /// Timestamp older than the last accepted tick of the symbol in this epoch.
    Stale,
}

/// Stateful tick cleaner. Ordering state is reset whenever the epoch changes.
pub struct Normalizer {
    guard: MonotonicGuard,
    epoch: u64,
}

impl Normalizer {
    pub fn new() -> Self {
        Self { guard: MonotonicGuard::new(), epoch: 0 }
    }

    pub fn normalize(&mut self, epoch: u64, raw: RawTick) -> Result<MarketEvent, Rejected> {
        if epoch != self.epoch {
            self.guard.reset();
            self.epoch = epoch;
        }

        let symbol = raw.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() || !raw.price.is_finite() || raw.price <= 0.0 {
            return Err(Rejected::Invalid);
        }
        if !self.guard.check_and_update(&symbol, raw.timestamp_us) {
            return Err(Rejected::Stale);
        }
        Ok(MarketEvent {
            symbol,
            price: raw.price,
            timestamp_us: raw.timestamp_us,
            kind: raw.kind,
            epoch,
        })
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the normalizer loop on the calling thread until the ingest side hangs
/// up or the dispatcher goes away.
///
/// Sending to the dispatcher blocks when its queue is full, which in turn
/// backs up the crossbeam queue and stalls ingest.
pub fn run_normalizer_loop(
    label: &str,
    rx: Receiver<(u64, RawTick)>,
    tx: mpsc::Sender<MarketEvent>,
    stats: Arc<FeedStats>,
    cpu_core: Option<i32>,
) {
    hx_core::cpu_affinity::maybe_bind(cpu_core);
    let mut normalizer = Normalizer::new();

    info!("[{label}] normalizer started");

    while let Ok((epoch, raw)) = rx.recv() {
        match normalizer.normalize(epoch, raw) {
            Ok(event) => {
                stats.accepted.fetch_add(1, Ordering::Relaxed);
                if tx.blocking_send(event).is_err() {
                    debug!("[{label}] dispatcher closed");
                    break;
                }
            }
            Err(Rejected::Invalid) => {
                stats.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            }
            Err(Rejected::Stale) => {
                stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    info!("[{label}] normalizer exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleans_symbol_and_rejects_bad_prices() {
        let mut n = Normalizer::new();
        let ev = n.normalize(1, RawTick::trade(" btc ", 100.0, 1)).unwrap();
        assert_eq!(ev.symbol, "BTC");
        assert_eq!(ev.epoch, 1);

        assert_eq!(n.normalize(1, RawTick::trade("BTC", f64::NAN, 2)), Err(Rejected::Invalid));
        assert_eq!(n.normalize(1, RawTick::trade("BTC", 0.0, 2)), Err(Rejected::Invalid));
        assert_eq!(n.normalize(1, RawTick::trade("  ", 1.0, 2)), Err(Rejected::Invalid));
    }

    #[test]
    fn regressions_dropped_within_epoch_only() {
        let mut n = Normalizer::new();
        assert!(n.normalize(1, RawTick::book("ETH", 10.0, 50)).is_ok());
        assert_eq!(n.normalize(1, RawTick::book("ETH", 10.0, 40)), Err(Rejected::Stale));
        // New epoch: the source may restart its clock.
        assert!(n.normalize(2, RawTick::book("ETH", 10.0, 40)).is_ok());
    }

    #[test]
    fn loop_counts_and_forwards() {
        let (raw_tx, raw_rx) = crossbeam_channel::bounded(16);
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Arc::new(FeedStats::default());

        raw_tx.send((1, RawTick::trade("BTC", 1.0, 10))).unwrap();
        raw_tx.send((1, RawTick::trade("BTC", 1.0, 5))).unwrap();
        raw_tx.send((1, RawTick::trade("BTC", -1.0, 20))).unwrap();
        raw_tx.send((1, RawTick::trade("BTC", 2.0, 20))).unwrap();
        drop(raw_tx);

        run_normalizer_loop("test", raw_rx, tx, Arc::clone(&stats), None);

        let s = stats.snapshot();
        assert_eq!((s.accepted, s.dropped_stale, s.dropped_invalid), (2, 1, 1));
        assert_eq!(rx.try_recv().unwrap().price, 1.0);
        assert_eq!(rx.try_recv().unwrap().price, 2.0);
    }
}
