//! Data Service Port (Driver Port)
//!
//! How consumers, and the fallback manager, reach a data access
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;

use super::batch_port::UpstreamError;
use crate::domain::request::{DataQuery, DataResponse};
use crate::domain::subscription::SubscriptionError;
use crate::error::DataGapError;

/// Errors from a data service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Batch API failure.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// The upstream cannot supply what was asked for.
    #[error(transparent)]
    DataGap(#[from] DataGapError),
    /// Stream subscription could not be placed.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    /// The query itself is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The service cannot serve at all.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Whether this error says something about service health.
    ///
    /// Caller mistakes and unsupported history kinds do not.
    #[must_use]
    pub const fn is_service_failure(&self) -> bool {
        !matches!(self, Self::DataGap(_) | Self::InvalidQuery(_))
    }
}

/// Request/response data access.
#[async_trait]
pub trait DataService: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Serve one query.
    async fn request(&self, query: &DataQuery) -> Result<DataResponse, ServiceError>;

    /// Whether the service considers itself able to serve.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Builds fresh primary services for re-initialization.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    /// Build a new service instance.
    async fn build(&self) -> Result<Arc<dyn DataService>, ServiceError>;
}
