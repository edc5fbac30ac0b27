//! Emergency-stop signal shared by the scheduler, router and gateway.
//!
//! A halt is a `tokio::sync::watch` flag, either global or per owner. Hot
//! paths poll [`KillSwitch::is_halted`] at the top of each tick and before
//! each gateway call; waits (retry backoff) race against
//! [`KillSwitch::halted`] so a sleeping retry is preempted immediately.
//!
//! Halts are sticky: they stay raised until [`KillSwitch::resume`].

use std::sync::RwLock;
use std::time::Duration;

use ahash::AHashMap;
use tokio::sync::watch;
use tracing::warn;

use crate::types::{Owner, StopScope};

pub struct KillSwitch {
    global: watch::Sender<bool>,
    owners: RwLock<AHashMap<Owner, watch::Sender<bool>>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        let (global, _) = watch::channel(false);
        Self { global, owners: RwLock::new(AHashMap::new()) }
    }

    /// Raise the halt flag for `scope`.
    pub fn halt(&self, scope: &StopScope) {
        warn!("[kill-switch] halt raised for {scope}");
        match scope {
            StopScope::Global => {
                self.global.send_replace(true);
            }
            StopScope::Owner(owner) => {
                self.sender(owner).send_replace(true);
            }
        }
    }

    /// Clear the halt flag for `scope`. Resuming `Global` does not clear
    /// owner-level halts.
    pub fn resume(&self, scope: &StopScope) {
        match scope {
            StopScope::Global => {
                self.global.send_replace(false);
            }
            StopScope::Owner(owner) => {
                self.sender(owner).send_replace(false);
            }
        }
    }

    /// Whether new orders for `owner` must be refused.
    #[inline]
    pub fn is_halted(&self, owner: &Owner) -> bool {
        if *self.global.borrow() {
            return true;
        }
        let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
        owners.get(owner).is_some_and(|tx| *tx.borrow())
    }

    /// The scope currently halting `owner`, global first.
    pub fn halted_scope(&self, owner: &Owner) -> Option<StopScope> {
        if *self.global.borrow() {
            return Some(StopScope::Global);
        }
        let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
        owners
            .get(owner)
            .filter(|tx| *tx.borrow())
            .map(|_| StopScope::Owner(owner.clone()))
    }

    /// Whether `scope` itself is halted (owner scopes also honour the global flag).
    pub fn is_scope_halted(&self, scope: &StopScope) -> bool {
        match scope {
            StopScope::Global => *self.global.borrow(),
            StopScope::Owner(owner) => self.is_halted(owner),
        }
    }

    /// Resolves once `owner` is halted (immediately if it already is).
    pub async fn halted(&self, owner: &Owner) {
        let mut global = self.global.subscribe();
        let mut own = self.sender(owner).subscribe();
        loop {
            if *global.borrow_and_update() || *own.borrow_and_update() {
                return;
            }
            tokio::select! {
                r = global.changed() => {
                    if r.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                r = own.changed() => {
                    if r.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    /// Sleep for `dur` unless `owner` gets halted first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if interrupted.
    pub async fn sleep_unless_halted(&self, owner: &Owner, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.halted(owner) => false,
        }
    }

    fn sender(&self, owner: &Owner) -> watch::Sender<bool> {
        {
            let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = owners.get(owner) {
                return tx.clone();
            }
        }
        let mut owners = self.owners.write().unwrap_or_else(|e| e.into_inner());
        owners
            .entry(owner.clone())
            .or_insert_with(|| watch::channel(false).0)
            .clone()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}
