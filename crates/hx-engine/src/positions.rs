//! Per-owner position book.
//!
//! Every owner gets one [`OwnerBook`] behind its own `tokio::sync::Mutex`.
//! That mutex is the single serialization point for risk authorization (check
//! + reserve) and for fill application, so two concurrent intents of one
//! owner can never both pass a check that only one of them fits under.
//!
//! An owner book holds:
//!
//! - open positions by symbol,
//! - cash equity (account value excluding unrealized P&L),
//! - today's realized P&L (net of fees), rolled at the UTC day boundary,
//! - exposure reservations of authorized-but-unfilled orders, by
//!   idempotency key.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use hx_core::time_util::trading_day;
use hx_core::types::*;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

/// Exposure held for an authorized order until it fills or dies.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub symbol: String,
    pub side: Side,
    /// Size not yet converted into position.
    pub remaining: f64,
    /// Price the exposure was valued at when reserved.
    pub price: f64,
}

// ---------------------------------------------------------------------------
// OwnerBook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct OwnerBook {
    positions: BTreeMap<String, Position>,
    /// Cash equity; unrealized P&L is added on top.
    equity: f64,
    realized_today: f64,
    day: u64,
    reservations: AHashMap<String, Reservation>,
}

/// Serializable state of one owner book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerSnapshot {
    pub owner: Owner,
    pub equity: f64,
    pub realized_today: f64,
    pub day: u64,
    pub positions: Vec<Position>,
}

impl OwnerBook {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn cash_equity(&self) -> f64 {
        self.equity
    }

    pub fn unrealized(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Cash equity plus unrealized P&L.
    pub fn equity(&self) -> f64 {
        self.equity + self.unrealized()
    }

    /// Set the account value as reported including unrealized P&L.
    pub fn set_account_equity(&mut self, total: f64) {
        self.equity = total - self.unrealized();
    }

    /// Set cash equity directly.
    pub fn set_cash_equity(&mut self, cash: f64) {
        self.equity = cash;
    }

    pub fn realized_today(&self, now_us: u64) -> f64 {
        if trading_day(now_us) == self.day { self.realized_today } else { 0.0 }
    }

    /// Today's loss as a positive number (negative when in profit).
    pub fn daily_loss(&self, now_us: u64) -> f64 {
        -(self.realized_today(now_us) + self.unrealized())
    }

    pub fn reservation(&self, key: &str) -> Option<&Reservation> {
        self.reservations.get(key)
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn reserve(&mut self, key: &str, symbol: &str, side: Side, size: f64, price: f64) {
        self.reservations.insert(
            key.to_string(),
            Reservation { symbol: symbol.to_string(), side, remaining: size, price },
        );
    }

    pub fn release(&mut self, key: &str) -> Option<Reservation> {
        self.reservations.remove(key)
    }

    /// Price used to value exposure in `symbol`: the position's mark, else
    /// the highest of `fallback` and the symbol's reservation prices.
    fn symbol_price(&self, symbol: &str, fallback: Option<f64>) -> Option<f64> {
        if let Some(px) = self.positions.get(symbol).map(|p| p.reference_price()) {
            if px > 0.0 {
                return Some(px);
            }
        }
        self.reservations
            .values()
            .filter(|r| r.symbol == symbol)
            .map(|r| r.price)
            .chain(fallback)
            .reduce(f64::max)
    }

    /// Worst-case absolute size of `symbol` if every reserved order (plus an
    /// optional extra order) filled in full.
    fn worst_size(&self, symbol: &str, extra: Option<(Side, f64)>) -> f64 {
        let net = self.positions.get(symbol).map_or(0.0, |p| p.net_size);
        let (mut buys, mut sells) = (0.0, 0.0);
        let pending = self
            .reservations
            .values()
            .filter(|r| r.symbol == symbol)
            .map(|r| (r.side, r.remaining))
            .chain(extra);
        for (side, size) in pending {
            match side {
                Side::Buy => buys += size,
                Side::Sell => sells += size,
            }
        }
        (net + buys).abs().max((net - sells).abs())
    }

    /// Notional of `symbol` and total notional across all symbols, both
    /// worst case, after adding a hypothetical order valued at `price`.
    pub fn projected_exposure(&self, symbol: &str, side: Side, size: f64, price: f64) -> (f64, f64) {
        let mut symbols: Vec<&str> = self.positions.keys().map(String::as_str).collect();
        for r in self.reservations.values() {
            symbols.push(r.symbol.as_str());
        }
        symbols.push(symbol);
        symbols.sort_unstable();
        symbols.dedup();

        let mut symbol_notional = 0.0;
        let mut total = 0.0;
        for s in symbols {
            let (extra, fallback) =
                if s == symbol { (Some((side, size)), Some(price)) } else { (None, None) };
            let px = self.symbol_price(s, fallback).unwrap_or(0.0);
            let notional = self.worst_size(s, extra) * px;
            if s == symbol {
                symbol_notional = notional;
            }
            total += notional;
        }
        (symbol_notional, total)
    }

    /// Apply one execution. Returns the realized P&L net of fee.
    pub fn apply_fill(&mut self, fill: &Fill) -> f64 {
        let pos = self
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::new(fill.owner.clone(), fill.symbol.clone()));
        let gross = pos.apply_fill(fill.side, fill.size, fill.price);
        pos.realized_pnl -= fill.fee;
        let net = gross - fill.fee;

        self.equity += net;
        self.roll_day(fill.timestamp_us);
        self.realized_today += net;

        let done = match self.reservations.get_mut(&fill.idempotency_key) {
            Some(r) => {
                r.remaining -= fill.size;
                r.remaining <= SIZE_EPS
            }
            None => false,
        };
        if done {
            self.reservations.remove(&fill.idempotency_key);
        }
        net
    }

    /// Mark `symbol`. Returns the updated position if one is open.
    pub fn mark(&mut self, symbol: &str, price: f64) -> Option<Position> {
        let pos = self.positions.get_mut(symbol)?;
        pos.mark(price);
        if pos.is_flat() { None } else { Some(pos.clone()) }
    }

    fn roll_day(&mut self, now_us: u64) {
        let day = trading_day(now_us);
        if day != self.day {
            self.day = day;
            self.realized_today = 0.0;
        }
    }

    fn snapshot(&self, owner: &Owner) -> OwnerSnapshot {
        OwnerSnapshot {
            owner: owner.clone(),
            equity: self.equity,
            realized_today: self.realized_today,
            day: self.day,
            positions: self.positions.values().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// PositionBook
// ---------------------------------------------------------------------------

/// All owner books plus the latest mark per symbol.
#[derive(Default)]
pub struct PositionBook {
    books: RwLock<AHashMap<Owner, Arc<Mutex<OwnerBook>>>>,
    marks: RwLock<AHashMap<String, f64>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// The owner's book, created empty on first use.
    pub fn owner_book(&self, owner: &Owner) -> Arc<Mutex<OwnerBook>> {
        {
            let books = self.books.read().unwrap_or_else(|e| e.into_inner());
            if let Some(b) = books.get(owner) {
                return Arc::clone(b);
            }
        }
        let mut books = self.books.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(books.entry(owner.clone()).or_default())
    }

    pub fn owners(&self) -> Vec<Owner> {
        let books = self.books.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Owner> = books.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn mark_price(&self, symbol: &str) -> Option<f64> {
        self.marks.read().unwrap_or_else(|e| e.into_inner()).get(symbol).copied()
    }

    /// Record the latest price and re-mark every open position in `symbol`.
    /// Returns the open positions after marking.
    pub async fn mark_symbol(&self, symbol: &str, price: f64) -> Vec<Position> {
        self.marks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.to_string(), price);
        let books: Vec<Arc<Mutex<OwnerBook>>> = {
            let books = self.books.read().unwrap_or_else(|e| e.into_inner());
            books.values().cloned().collect()
        };
        let mut out = Vec::new();
        for book in books {
            if let Some(p) = book.lock().await.mark(symbol, price) {
                out.push(p);
            }
        }
        out
    }

    /// Apply a fill to its owner's book. Returns realized P&L net of fee.
    pub async fn apply_fill(&self, fill: &Fill) -> f64 {
        let book = self.owner_book(&fill.owner);
        let mut book = book.lock().await;
        let realized = book.apply_fill(fill);
        if let Some(px) = self.mark_price(&fill.symbol) {
            book.mark(&fill.symbol, px);
        }
        realized
    }

    /// Open positions of `owner`, by symbol.
    pub async fn positions(&self, owner: &Owner) -> Vec<Position> {
        let book = self.owner_book(owner);
        let book = book.lock().await;
        book.positions().filter(|p| !p.is_flat()).cloned().collect()
    }

    pub async fn position(&self, owner: &Owner, symbol: &str) -> Option<Position> {
        let book = self.owner_book(owner);
        let book = book.lock().await;
        book.position(symbol).cloned()
    }

    pub async fn equity(&self, owner: &Owner) -> f64 {
        self.owner_book(owner).lock().await.equity()
    }

    pub async fn set_account_equity(&self, owner: &Owner, total: f64) {
        self.owner_book(owner).lock().await.set_account_equity(total);
    }

    pub async fn set_cash_equity(&self, owner: &Owner, cash: f64) {
        self.owner_book(owner).lock().await.set_cash_equity(cash);
    }

    pub async fn snapshot(&self) -> Vec<OwnerSnapshot> {
        let books: Vec<(Owner, Arc<Mutex<OwnerBook>>)> = {
            let books = self.books.read().unwrap_or_else(|e| e.into_inner());
            books.iter().map(|(o, b)| (o.clone(), Arc::clone(b))).collect()
        };
        let mut out = Vec::with_capacity(books.len());
        for (owner, book) in books {
            out.push(book.lock().await.snapshot(&owner));
        }
        out.sort_by(|a, b| a.owner.cmp(&b.owner));
        out
    }

    pub async fn restore(&self, snapshots: Vec<OwnerSnapshot>) {
        for snap in snapshots {
            let book = self.owner_book(&snap.owner);
            let mut book = book.lock().await;
            book.equity = snap.equity;
            book.realized_today = snap.realized_today;
            book.day = snap.day;
            book.positions =
                snap.positions.into_iter().map(|p| (p.symbol.clone(), p)).collect();
        }
    }
}
