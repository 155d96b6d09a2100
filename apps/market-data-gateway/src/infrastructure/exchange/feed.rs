//! Exchange Feed
//!
//! Glues the ticket pool to the connection worker: subscription changes are
//! rendered by [`SubscriptionManager`] and published through the
//! [`ConnectionHandle`]. Implements [`StreamPath`] for the smart router.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use super::connection::ConnectionHandle;
use crate::application::ports::StreamPath;
use crate::application::services::MessageRouter;
use crate::domain::connection::ConnectionState;
use crate::domain::market_data::DataType;
use crate::domain::subscription::{
    SubscriptionError, SubscriptionManager, SubscriptionParams, TicketId,
};
use crate::infrastructure::metrics;

/// Live stream as one component.
#[derive(Clone)]
pub struct ExchangeFeed {
    connection: ConnectionHandle,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<MessageRouter>,
}

impl std::fmt::Debug for ExchangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeFeed")
            .field("state", &self.connection.state())
            .field("tickets", &self.subscriptions.ticket_count())
            .finish_non_exhaustive()
    }
}

impl ExchangeFeed {
    /// Create a feed.
    #[must_use]
    pub const fn new(
        connection: ConnectionHandle,
        subscriptions: Arc<SubscriptionManager>,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self {
            connection,
            subscriptions,
            router,
        }
    }

    /// Connection handle.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Ticket pool.
    #[must_use]
    pub const fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Subscribe `symbols` with extra `params` and publish the ticket.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError`] if the pool cannot take the entry.
    pub async fn subscribe(
        &self,
        data_type: DataType,
        symbols: &[String],
        params: SubscriptionParams,
    ) -> Result<TicketId, SubscriptionError> {
        let ticket = self.subscriptions.subscribe(data_type, symbols, params)?;
        self.publish(&ticket).await;
        metrics::set_tickets_in_use(self.subscriptions.ticket_count());
        Ok(ticket)
    }

    /// Drop `symbols` for `data_type`. Changed tickets are re-sent; retired
    /// tickets simply stop being replayed.
    pub async fn release(&self, data_type: DataType, symbols: &[String]) {
        let outcome = self.subscriptions.unsubscribe(data_type, symbols);
        for ticket in &outcome.updated {
            self.publish(ticket).await;
        }
        if !outcome.retired.is_empty() {
            tracing::info!(
                retired = outcome.retired.len(),
                "Tickets retired; dropped from the next reconnect"
            );
        }
        metrics::set_tickets_in_use(self.subscriptions.ticket_count());
    }

    async fn publish(&self, ticket: &TicketId) {
        let Some(message) = self.subscriptions.replay_message(ticket) else {
            return;
        };
        if let Err(e) = self.connection.publish(message).await {
            tracing::warn!(ticket = %ticket, error = %e, "Ticket not published; replayed on reconnect");
        }
    }
}

#[async_trait]
impl StreamPath for ExchangeFeed {
    fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn last_delivery(&self) -> Option<Instant> {
        self.router.last_delivery()
    }

    async fn ensure_subscribed(
        &self,
        data_type: DataType,
        symbols: &[String],
    ) -> Result<(), SubscriptionError> {
        let missing: Vec<String> = symbols
            .iter()
            .filter(|s| !self.subscriptions.is_subscribed(data_type, s))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        tracing::debug!(data_type = %data_type, symbols = missing.len(), "Subscribing on demand");
        self.subscribe(data_type, &missing, SubscriptionParams::new())
            .await
            .map(|_| ())
    }
}
