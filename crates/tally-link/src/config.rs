//! Linking core configuration
//!
//! Every externally-imposed tunable lives here: cache TTLs, the queue's
//! inter-call spacing, retry backoff shapes, and the per-channel attempt
//! throttles. Defaults match the aggregator's published rate limits.

use std::time::Duration;

/// Top-level configuration for the linking core.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// TTL for cached account snapshots. Accounts change rarely.
    pub accounts_ttl: Duration,
    /// TTL for cached transaction fetches.
    pub transactions_ttl: Duration,
    /// Minimum spacing the request queue enforces between upstream calls.
    pub queue_spacing: Duration,
    /// Per-caller timeout for a queued upstream call.
    pub request_timeout: Duration,
    /// Retry backoff shape.
    pub retry: RetryConfig,
    /// Throttle limits for link-token minting.
    pub link_token_limits: ChannelLimits,
    /// Throttle limits for the full UI-facing link flow.
    pub link_flow_limits: ChannelLimits,
    /// Throttle limits for post-handshake completion.
    pub success_flow_limits: ChannelLimits,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            accounts_ttl: Duration::from_secs(10 * 60),
            transactions_ttl: Duration::from_secs(5 * 60),
            queue_spacing: Duration::from_millis(350),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            link_token_limits: ChannelLimits {
                debounce: Duration::from_secs(2),
                max_attempts: 5,
                reset_interval: Duration::from_secs(10 * 60),
                grace_period: Duration::from_secs(3 * 60),
            },
            link_flow_limits: ChannelLimits {
                debounce: Duration::from_secs(1),
                max_attempts: 10,
                reset_interval: Duration::from_secs(30 * 60),
                grace_period: Duration::from_secs(10 * 60),
            },
            success_flow_limits: ChannelLimits {
                debounce: Duration::from_secs(1),
                max_attempts: 5,
                reset_interval: Duration::from_secs(10 * 60),
                grace_period: Duration::from_secs(3 * 60),
            },
        }
    }
}

/// Backoff shape for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for rate-limited retries (`base * 2^attempt`).
    pub rate_limit_base: Duration,
    /// Ceiling on any single rate-limited backoff sleep.
    pub rate_limit_ceiling: Duration,
    /// Max retry attempts after a rate-limited failure.
    pub rate_limit_max_attempts: u32,
    /// Fixed escalating schedule for not-ready retries, indexed by attempt.
    pub not_ready_schedule: Vec<Duration>,
    /// Quiet period after which the global rate-limit counter decays to zero.
    pub rate_limit_quiet_period: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_base: Duration::from_secs(30),
            rate_limit_ceiling: Duration::from_secs(5 * 60),
            rate_limit_max_attempts: 3,
            not_ready_schedule: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
                Duration::from_secs(90),
                Duration::from_secs(180),
            ],
            rate_limit_quiet_period: Duration::from_secs(15 * 60),
        }
    }
}

/// Limits for one throttle channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    /// Minimum spacing between consecutive attempts.
    pub debounce: Duration,
    /// Maximum attempts inside one rolling window.
    pub max_attempts: u32,
    /// Rolling window length; the attempt counter resets after this.
    pub reset_interval: Duration,
    /// After this much of the window has elapsed with the counter maxed,
    /// one attempt is forgiven instead of forcing the full window wait.
    pub grace_period: Duration,
}
