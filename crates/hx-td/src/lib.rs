//! # hx-td
//!
//! Order execution for the trading engine.
//!
//! The [`gateway::OrderGateway`] turns risk-approved intents into exchange
//! orders through any [`ExchangeClient`](hx_core::exchange::ExchangeClient):
//! idempotent submission, bounded retries with exponential backoff,
//! reconciliation of ambiguous outcomes, cancel sweeps for emergency stops,
//! and a fill pump feeding [`event::GatewayEvent`]s to the engine.
//!
//! | Module    | Purpose                                              |
//! |-----------|------------------------------------------------------|
//! | `agent`   | Trade-only agent wallets, request signing            |
//! | `gateway` | Submission, cancel/modify, reconciliation, fills     |
//! | `event`   | Gateway -> engine event channel                      |
//! | `config`  | Retry policy and key retention                       |
//! | `paper`   | In-process exchange with fault injection             |

pub mod agent;
pub mod config;
pub mod event;
pub mod gateway;
pub mod paper;

pub use agent::{AgentRegistry, AgentWallet, ExchangeContext};
pub use event::{GatewayEvent, GatewayEventReceiver, GatewayEventSender};
pub use gateway::{CancelOutcome, OrderGateway};
pub use paper::PaperExchange;
