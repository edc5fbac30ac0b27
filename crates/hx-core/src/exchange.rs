//! The narrow contract the engine consumes from an exchange client.
//!
//! Wire formats, endpoints and request signing schemes live behind these
//! traits. The gateway only needs to place/cancel/modify/query orders, read
//! account state and receive fills; the feed only needs a price stream.
//!
//! Every call is keyed by the client-generated idempotency key (`client_key`)
//! so that a retried placement is recognizable on the exchange side.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::*;

/// Signed order placement as handed to the exchange client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_key: String,
    pub owner: Owner,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: OrderPrice,
    pub post_only: bool,
    pub reduce_only: bool,
    /// Hex-encoded public key of the agent that signed this request.
    pub agent_key: String,
    /// Agent signature over the canonical request payload.
    pub signature: String,
}

/// Exchange answer to a placement, modification or status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub client_key: String,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_price: f64,
}

/// Errors surfaced by an exchange client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// No response within the deadline. The request may have been applied.
    #[error("timeout")]
    Timeout,

    /// 5xx-class failure. The request may have been applied.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Throttled before processing.
    #[error("rate limited")]
    RateLimited,

    /// Connection could not be established; nothing was sent.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Definitive refusal (insufficient margin, bad tick size, ...).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unknown order")]
    UnknownOrder,
}

impl ExchangeError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Server { .. } | Self::RateLimited | Self::Disconnected(_)
        )
    }

    /// The request may or may not have taken effect.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout | Self::Server { .. })
    }
}

/// Order and account operations of an exchange client.
///
/// All methods take `&self` so one client can be shared by every gateway
/// task.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place an order. Exchanges deduplicate on `client_key`: placing the
    /// same key twice returns the existing order.
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    /// Cancel a resting order. `Ok(false)` when it was no longer live.
    async fn cancel_order(&self, owner: &Owner, order_id: OrderId) -> Result<bool, ExchangeError>;

    /// Amend price and/or size of a resting order.
    async fn modify_order(
        &self,
        owner: &Owner,
        order_id: OrderId,
        new_price: Option<f64>,
        new_size: Option<f64>,
    ) -> Result<OrderAck, ExchangeError>;

    /// Look an order up by client key. `Ok(None)` means the exchange has no
    /// record of it.
    async fn query_order_status(
        &self,
        owner: &Owner,
        client_key: &str,
    ) -> Result<Option<OrderAck>, ExchangeError>;

    async fn get_account_state(&self, owner: &Owner) -> Result<AccountState, ExchangeError>;

    /// Stream of executions for every agent this client serves. Delivery is
    /// at-least-once; consumers deduplicate on `fill_id`.
    async fn fills(&self) -> Result<BoxStream<'static, Fill>, ExchangeError>;
}

/// Source of raw price ticks. Each successful call opens a new connection
/// epoch; the stream ends when the connection drops.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn subscribe_prices(
        &self,
        symbols: &[String],
    ) -> Result<BoxStream<'static, RawTick>, ExchangeError>;
}
