//! # hx-core
//!
//! Core crate for the agent-wallet trading engine, providing:
//!
//! - **Types** (`types`): owners, enums, market data and trading structs
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): domain-specific `HxError` via thiserror
//! - **Exchange contract** (`exchange`): client and price-source traits
//! - **Kill switch** (`kill_switch`): global / per-owner emergency halt
//! - **Deduplication** (`dedup`): tick ordering, TTL stores, fill dedup
//! - **CPU affinity** (`cpu_affinity`): thread-to-core pinning
//! - **Time utilities** (`time_util`): microsecond timestamps, trading day
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod cpu_affinity;
pub mod dedup;
pub mod error;
pub mod exchange;
pub mod kill_switch;
pub mod logging;
pub mod time_util;
pub mod types;

// Re-export types at crate root for convenience.
pub use types::*;
