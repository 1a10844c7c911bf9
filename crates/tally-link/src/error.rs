//! Error taxonomy for the linking core.
//!
//! Everything a caller can see is a `LinkError`. Internal upstream detail
//! (error codes, response bodies) is logged at the point of failure and
//! reduced to a sanitized message here so credential material and raw
//! aggregator errors never reach the UI.

use std::time::Duration;

/// Errors surfaced by the linking core.
///
/// Cloneable by design: concurrent callers joined on the same in-flight
/// fetch all receive the same error value.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LinkError {
    /// An attempt throttle rejected the call. Retry after `wait`.
    #[error("too many attempts, retry in {}s", wait.as_secs())]
    Throttled {
        /// How long the caller should wait before trying again.
        wait: Duration,
    },

    /// The aggregator rate-limited us and retries were exhausted.
    #[error("aggregator is rate limiting requests: {0}")]
    RateLimited(String),

    /// The requested data is still being prepared upstream.
    #[error("requested data is not ready yet: {0}")]
    NotReady(String),

    /// The link handshake failed; the orchestrator returned to idle.
    #[error("link handshake failed: {0}")]
    Handshake(String),

    /// A queued call exceeded its per-caller timeout.
    #[error("request timed out")]
    Timeout,

    /// An operation that requires a linked connection was called without one.
    #[error("no bank connection is established")]
    NotConnected,

    /// Anything else: auth failure, malformed request, hard network failure.
    #[error("{0}")]
    Fatal(String),
}

impl LinkError {
    /// Shorthand for a fatal error with a formatted message.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// User-facing message, distinct from the internal error detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::Throttled { wait } => {
                format!("Please wait {} seconds before trying again.", wait.as_secs().max(1))
            }
            Self::RateLimited(_) => "The service is busy. Please try again later.".to_string(),
            Self::NotReady(_) => {
                "Your account data is still processing. Check back shortly.".to_string()
            }
            Self::Handshake(_) => {
                "We couldn't finish linking your account. Please try again.".to_string()
            }
            Self::Timeout | Self::Fatal(_) => {
                "Something went wrong. Please try again shortly.".to_string()
            }
            Self::NotConnected => "No bank account is linked yet.".to_string(),
        }
    }

    /// Whether the caller can reasonably retry later without intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::RateLimited(_) | Self::NotReady(_) | Self::Timeout
        )
    }
}
