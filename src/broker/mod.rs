use async_trait::async_trait;

use crate::error::BrokerError;
use crate::models::Holding;

pub mod paper;

pub use paper::PaperBroker;

/// Outcome of an accepted order.
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub order_no: String,
    /// Average fill price when the broker reports it; market orders may
    /// acknowledge before fills are known.
    pub avg_fill_price: Option<i64>,
    pub filled_quantity: i64,
}

/// Order gateway for a single-position account.
///
/// The account holds at most one instrument at a time, so `holdings` and
/// `available_cash` take no instrument argument.
#[async_trait]
pub trait OrderPort: Send + Sync {
    async fn buy_market(&self, instrument: &str, quantity: i64)
        -> Result<OrderReceipt, BrokerError>;

    async fn sell_limit(
        &self,
        instrument: &str,
        quantity: i64,
        price: i64,
    ) -> Result<OrderReceipt, BrokerError>;

    async fn sell_market(
        &self,
        instrument: &str,
        quantity: i64,
    ) -> Result<OrderReceipt, BrokerError>;

    /// The account's current holding, if any.
    async fn holdings(&self) -> Result<Option<Holding>, BrokerError>;

    async fn available_cash(&self) -> Result<i64, BrokerError>;

    /// Latest traded price for sizing orders outside the stream path.
    async fn current_price(&self, instrument: &str) -> Result<i64, BrokerError>;
}
