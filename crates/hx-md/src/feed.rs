//! Market data feed: ingest task + normalizer thread.
//!
//! # Architecture
//!
//! ```text
//! PriceSource ──stream──► ingest task ──crossbeam (bounded)──► normalizer thread
//!                           (epochs,                             (clean, order,
//!                            reconnect)                           count)
//!                                                     ──mpsc (bounded)──► dispatcher
//! ```
//!
//! Every successful subscription opens a new epoch. When the stream ends or
//! the subscription fails, the ingest task reconnects with exponential
//! backoff. Adding symbols triggers an immediate resubscription.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Sender, TrySendError};
use futures_util::StreamExt;
use hx_core::config::FeedConfig;
use hx_core::exchange::PriceSource;
use hx_core::types::{MarketEvent, RawTick};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::normalize::{self, FeedStats, FeedStatsSnapshot};

/// Poll interval while the normalizer queue is full.
const FULL_QUEUE_PAUSE: Duration = Duration::from_micros(200);

pub struct MarketDataFeed {
    source: Arc<dyn PriceSource>,
    cfg: FeedConfig,
    stats: Arc<FeedStats>,
    symbols_tx: watch::Sender<Vec<String>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MarketDataFeed {
    pub fn new(source: Arc<dyn PriceSource>, cfg: FeedConfig) -> Self {
        let symbols = normalize_symbols(&cfg.symbols);
        let (symbols_tx, _) = watch::channel(symbols);
        Self {
            source,
            cfg,
            stats: Arc::new(FeedStats::default()),
            symbols_tx,
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Spawn the ingest task and the normalizer thread. Normalized events are
    /// sent to `out`.
    pub fn start(&mut self, out: mpsc::Sender<MarketEvent>) -> Result<()> {
        if self.shutdown_tx.is_some() {
            anyhow::bail!("feed already started");
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (raw_tx, raw_rx) = crossbeam_channel::bounded(self.cfg.queue_capacity.max(1));

        let stats = Arc::clone(&self.stats);
        let cpu_core = self.cfg.cpu_core;
        self.tasks.push(tokio::task::spawn_blocking(move || {
            normalize::run_normalizer_loop("feed", raw_rx, out, stats, cpu_core);
        }));

        let ingest = IngestLoop {
            source: Arc::clone(&self.source),
            stats: Arc::clone(&self.stats),
            tx: raw_tx,
            symbols_rx: self.symbols_tx.subscribe(),
            shutdown_rx,
            base_backoff: Duration::from_millis(self.cfg.reconnect_backoff_ms.max(1)),
            max_backoff: Duration::from_millis(self.cfg.max_reconnect_backoff_ms.max(1)),
        };
        self.tasks.push(tokio::spawn(ingest.run()));
        self.shutdown_tx = Some(shutdown_tx);

        info!("[feed] started ({} symbols)", self.symbols_tx.borrow().len());
        Ok(())
    }

    /// Add symbols to the subscription. Returns `true` if the set changed,
    /// in which case the ingest task resubscribes (opening a new epoch).
    pub fn add_symbols(&self, symbols: &[String]) -> bool {
        let wanted = normalize_symbols(symbols);
        self.symbols_tx.send_if_modified(|current| {
            let mut changed = false;
            for s in wanted {
                if !current.contains(&s) {
                    current.push(s);
                    changed = true;
                }
            }
            changed
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.symbols_tx.borrow().clone()
    }

    pub fn stats(&self) -> FeedStatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal shutdown and wait for both tasks to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("[feed] stopped");
    }
}

fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(symbols.len());
    for s in symbols {
        let s = s.trim().to_ascii_uppercase();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Ingest loop: subscribe, forward, reconnect
// ---------------------------------------------------------------------------

struct IngestLoop {
    source: Arc<dyn PriceSource>,
    stats: Arc<FeedStats>,
    tx: Sender<(u64, RawTick)>,
    symbols_rx: watch::Receiver<Vec<String>>,
    shutdown_rx: watch::Receiver<bool>,
    base_backoff: Duration,
    max_backoff: Duration,
}

enum StreamEnd {
    Shutdown,
    Resubscribe,
    Dropped,
}

impl IngestLoop {
    async fn run(mut self) {
        let mut backoff = self.base_backoff;
        let mut epoch = 0u64;

        loop {
            if *self.shutdown_rx.borrow() {
                info!("[feed] shutdown requested");
                return;
            }

            let symbols = self.symbols_rx.borrow_and_update().clone();
            if symbols.is_empty() {
                // Nothing to subscribe yet; wait for symbols or shutdown.
                tokio::select! {
                    r = self.symbols_rx.changed() => if r.is_err() { return },
                    _ = self.shutdown_rx.changed() => return,
                }
                continue;
            }

            let stream = match self.source.subscribe_prices(&symbols).await {
                Ok(s) => s,
                Err(e) => {
                    error!("[feed] subscribe failed: {e}, retrying in {backoff:?}");
                    if !self.pause(backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                    continue;
                }
            };

            epoch += 1;
            self.stats.epochs.fetch_add(1, Ordering::Relaxed);
            info!("[feed] subscribed to {} symbols (epoch {epoch})", symbols.len());

            match self.forward(stream, epoch, &mut backoff).await {
                StreamEnd::Shutdown => return,
                StreamEnd::Resubscribe => {
                    info!("[feed] symbol set changed, resubscribing");
                    continue;
                }
                StreamEnd::Dropped => {}
            }

            warn!("[feed] stream ended, reconnecting in {backoff:?}");
            if !self.pause(backoff).await {
                return;
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    async fn forward(
        &mut self,
        mut stream: futures_util::stream::BoxStream<'static, RawTick>,
        epoch: u64,
        backoff: &mut Duration,
    ) -> StreamEnd {
        let mut first = true;
        let mut symbols_open = true;
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return StreamEnd::Shutdown,
                r = self.symbols_rx.changed(), if symbols_open => {
                    if r.is_ok() {
                        return StreamEnd::Resubscribe;
                    }
                    symbols_open = false;
                }
                item = stream.next() => {
                    let Some(tick) = item else {
                        return StreamEnd::Dropped;
                    };
                    if first {
                        // Only a stream that actually delivered resets backoff.
                        *backoff = self.base_backoff;
                        first = false;
                    }
                    if !self.push(epoch, tick).await {
                        return StreamEnd::Shutdown;
                    }
                }
            }
        }
    }

    /// Queue a tick for the normalizer, waiting while the queue is full.
    /// Returns `false` if the normalizer is gone or shutdown was requested.
    async fn push(&mut self, epoch: u64, tick: RawTick) -> bool {
        let mut item = (epoch, tick);
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    self.stats.ingest_waits.fetch_add(1, Ordering::Relaxed);
                    if *self.shutdown_rx.borrow() {
                        return false;
                    }
                    tokio::time::sleep(FULL_QUEUE_PAUSE).await;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Sleep unless shutdown arrives first.
    async fn pause(&mut self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.shutdown_rx.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};
    use hx_core::exchange::ExchangeError;

    /// Each subscription pops the next scripted batch; an exhausted script
    /// fails the subscription.
    struct ScriptedSource {
        batches: Mutex<VecDeque<Vec<RawTick>>>,
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        async fn subscribe_prices(
            &self,
            _symbols: &[String],
        ) -> Result<BoxStream<'static, RawTick>, ExchangeError> {
            match self.batches.lock().unwrap().pop_front() {
                Some(batch) => Ok(stream::iter(batch).boxed()),
                None => Err(ExchangeError::Disconnected("script exhausted".into())),
            }
        }
    }

    fn cfg() -> FeedConfig {
        FeedConfig {
            symbols: vec!["btc".into()],
            queue_capacity: 4,
            reconnect_backoff_ms: 1,
            max_reconnect_backoff_ms: 5,
            cpu_core: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn epochs_and_ordering_across_reconnects() {
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(VecDeque::from(vec![
                vec![
                    RawTick::trade("BTC", 100.0, 10),
                    RawTick::trade("BTC", 99.0, 5), // regression, dropped
                    RawTick::trade("BTC", f64::INFINITY, 11), // invalid
                    RawTick::trade("BTC", 101.0, 12),
                ],
                vec![RawTick::trade("btc", 102.0, 1)], // new epoch, clock restarted
            ])),
        });
        let (tx, mut rx) = mpsc::channel(64);
        let mut feed = MarketDataFeed::new(source, cfg());
        feed.start(tx).unwrap();

        let mut got = Vec::new();
        while got.len() < 3 {
            let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("feed stalled")
                .unwrap();
            got.push(ev);
        }
        feed.stop().await;

        assert_eq!(got[0].epoch, 1);
        assert_eq!(got[1].price, 101.0);
        assert_eq!(got[2].epoch, 2);
        assert_eq!(got[2].symbol, "BTC");
        let s = feed.stats();
        assert_eq!(s.dropped_stale, 1);
        assert_eq!(s.dropped_invalid, 1);
        assert!(s.epochs >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_consumer_backs_up_without_loss() {
        let ticks: Vec<RawTick> =
            (0..200u64).map(|i| RawTick::trade("BTC", 1.0 + i as f64, i)).collect();
        let source = Arc::new(ScriptedSource { batches: Mutex::new(VecDeque::from(vec![ticks])) });
        let (tx, mut rx) = mpsc::channel(2);
        let mut feed = MarketDataFeed::new(source, cfg());
        feed.start(tx).unwrap();

        let mut last = 0u64;
        for i in 0..200u64 {
            let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("feed stalled")
                .unwrap();
            assert_eq!(ev.timestamp_us, i);
            last = ev.timestamp_us;
            if i % 50 == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        assert_eq!(last, 199);
        assert!(feed.stats().ingest_waits > 0);
        feed.stop().await;
    }

    #[test]
    fn symbol_set_normalized() {
        let source = Arc::new(ScriptedSource { batches: Mutex::new(VecDeque::new()) });
        let feed = MarketDataFeed::new(source, cfg());
        assert!(!feed.add_symbols(&["BTC".into()]));
        assert!(feed.add_symbols(&[" eth".into()]));
        assert_eq!(feed.symbols(), vec!["BTC".to_string(), "ETH".to_string()]);
    }
}
