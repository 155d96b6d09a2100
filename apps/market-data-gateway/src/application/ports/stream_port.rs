//! Stream Path Port
//!
//! The live stream as the router sees it: its state, its freshness, and a
//! way to widen the subscription set.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::connection::ConnectionState;
use crate::domain::market_data::DataType;
use crate::domain::subscription::SubscriptionError;

/// Live stream facade.
#[async_trait]
pub trait StreamPath: Send + Sync {
    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Instant of the last delivered market message.
    fn last_delivery(&self) -> Option<Instant>;

    /// Make sure `symbols` are streamed for `data_type`.
    async fn ensure_subscribed(
        &self,
        data_type: DataType,
        symbols: &[String],
    ) -> Result<(), SubscriptionError>;
}
