//! Bounded drop-oldest tick mailbox.
//!
//! The dispatcher must never wait on a slow strategy, and a strategy only
//! cares about recent prices, so when an instance's mailbox is full the
//! oldest queued tick is discarded to make room. The queue is a bounded
//! `crossbeam-channel`; the consumer side keeps a receiver clone for
//! evicting and a `Notify` wakes the instance's actor.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use hx_core::types::MarketEvent;
use tokio::sync::Notify;

pub struct TickMailbox {
    tx: Sender<MarketEvent>,
    rx: Receiver<MarketEvent>,
    notify: Notify,
    dropped: AtomicU64,
}

impl TickMailbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx, notify: Notify::new(), dropped: AtomicU64::new(0) }
    }

    /// Enqueue, evicting the oldest tick if full. Never blocks.
    pub fn push(&self, mut event: MarketEvent) {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    event = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<MarketEvent> {
        match self.rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Resolves when a push happened since the last wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Re-arm the wake-up when ticks remain after a partial drain.
    pub fn renotify(&self) {
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Ticks discarded because the mailbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
