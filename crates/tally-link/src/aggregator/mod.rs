//! Aggregation API client boundary.
//!
//! The rest of the core talks to the aggregator through [`AggregatorClient`]
//! so tests can script failures and the HTTP transport stays in one place.

mod http;
mod types;

pub use http::{HttpAggregatorClient, HttpAggregatorConfig};
pub use types::{
    AccountSummary, Balances, DateRange, ExchangeResponse, LinkTokenResponse, TransactionRecord,
    TransactionsPage,
};

use async_trait::async_trait;

use crate::error::LinkError;

/// How an upstream failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The aggregator's own rate limiter rejected the call.
    RateLimited,
    /// The requested data is still being staged upstream.
    NotReady,
    /// Auth failure, malformed request, hard network failure.
    Fatal,
}

/// An error from the aggregation API, classified for retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("aggregator error ({kind:?}{}): {message}", code.as_deref().map(|c| format!(", {c}")).unwrap_or_default())]
pub struct AggregatorError {
    pub kind: FailureKind,
    /// Upstream error code, when one was returned.
    pub code: Option<String>,
    pub message: String,
}

impl AggregatorError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            code: None,
            message: message.into(),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NotReady,
            code: None,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            code: None,
            message: message.into(),
        }
    }
}

impl From<AggregatorError> for LinkError {
    fn from(err: AggregatorError) -> Self {
        match err.kind {
            FailureKind::RateLimited => LinkError::RateLimited(err.message),
            FailureKind::NotReady => LinkError::NotReady(err.message),
            FailureKind::Fatal => LinkError::Fatal(err.message),
        }
    }
}

/// Client for the external financial-account aggregation API.
///
/// All calls may fail with any [`FailureKind`]; callers are expected to go
/// through the request queue and retry policy rather than calling retry
/// loops of their own.
#[async_trait]
pub trait AggregatorClient: Send + Sync {
    /// Mint a short-lived link token used to open the UI handshake.
    async fn create_link_token(&self, user_id: &str) -> Result<LinkTokenResponse, AggregatorError>;

    /// Exchange the handshake's public token for a durable access credential.
    async fn exchange_public_token(
        &self,
        public_token: &str,
    ) -> Result<ExchangeResponse, AggregatorError>;

    /// Fetch current balances for every account on the item.
    async fn get_accounts(&self, credential: &str)
        -> Result<Vec<AccountSummary>, AggregatorError>;

    /// Fetch one page of transactions at the given cursor.
    async fn sync_transactions(
        &self,
        credential: &str,
        cursor: Option<&str>,
    ) -> Result<TransactionsPage, AggregatorError>;

    /// Revoke the item upstream. Best-effort; callers must not rely on it.
    async fn remove_item(&self, credential: &str) -> Result<(), AggregatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_maps_to_link_error() {
        let err: LinkError = AggregatorError::rate_limited("429").into();
        assert!(matches!(err, LinkError::RateLimited(_)));

        let err: LinkError = AggregatorError::not_ready("staging").into();
        assert!(matches!(err, LinkError::NotReady(_)));

        let err: LinkError = AggregatorError::fatal("bad request").into();
        assert!(matches!(err, LinkError::Fatal(_)));
    }

    #[test]
    fn display_includes_code_when_present() {
        let err = AggregatorError {
            kind: FailureKind::NotReady,
            code: Some("PRODUCT_NOT_READY".to_string()),
            message: "try again".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("PRODUCT_NOT_READY"));
        assert!(rendered.contains("try again"));
    }
}
