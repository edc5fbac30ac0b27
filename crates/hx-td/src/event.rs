//! Events emitted by the order gateway to the engine.
//!
//! The scheduler's event loop polls a [`GatewayEventReceiver`] and routes
//! fills to positions, vault accounting and the owning strategy instance.

use hx_core::types::{Fill, Order, Owner};

/// A typed event emitted by the [`OrderGateway`](crate::gateway::OrderGateway).
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// An execution reported by the exchange. May be delivered more than once.
    Fill(Fill),

    /// An order changed state (acknowledged, amended, cancelled, filled).
    OrderUpdate(Order),

    /// A non-fatal error in a background task (fill stream, reconciliation).
    Error {
        owner: Option<Owner>,
        message: String,
    },
}

/// Sender half of the gateway event channel.
pub type GatewayEventSender = tokio::sync::mpsc::UnboundedSender<GatewayEvent>;

/// Receiver half of the gateway event channel.
pub type GatewayEventReceiver = tokio::sync::mpsc::UnboundedReceiver<GatewayEvent>;
