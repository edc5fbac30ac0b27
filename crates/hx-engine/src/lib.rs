//! # hx-engine
//!
//! Strategy execution and risk management for agent-wallet trading.
//!
//! [`engine::Engine`] is the facade: it owns the market data feed, the
//! strategy scheduler, the risk-checked order router, the position books and
//! the vault ledger, and exposes the operator commands.
//!
//! | Module        | Purpose                                                |
//! |---------------|--------------------------------------------------------|
//! | `engine`      | Wiring, background loops, command surface              |
//! | `scheduler`   | One actor per strategy instance, tick/fill routing     |
//! | `strategy`    | Grid, maker-rebate, staking and arbitrage state machines |
//! | `mailbox`     | Drop-oldest tick mailbox                               |
//! | `router`      | Halt check, risk authorization, gateway calls          |
//! | `risk`        | Pre-trade limits, reservations, stop-loss              |
//! | `positions`   | Per-owner books, marks, realized/unrealized P&L        |
//! | `vault`       | Pooled capital, shares, withdrawals, distributions     |
//! | `persistence` | Engine snapshots (JSON file or memory)                 |

pub mod engine;
pub mod mailbox;
pub mod persistence;
pub mod positions;
pub mod risk;
pub mod router;
pub mod scheduler;
pub mod strategy;
pub mod vault;

pub use engine::{EmergencyStopReport, Engine, EngineContext};
pub use persistence::{EngineSnapshot, JsonFileStore, MemoryStore, StateStore};
pub use positions::PositionBook;
pub use risk::{Decision, RiskManager};
pub use router::OrderRouter;
pub use scheduler::{Scheduler, StrategyInstance};
pub use strategy::StrategyParams;
pub use vault::{VaultLedger, VaultSummary, WithdrawalTicket};
