//! Link attempt throttling.
//!
//! Guards the three linking entry points (token minting, the full UI link
//! flow, and post-handshake completion) against a hammering UI: each channel
//! has a debounce between consecutive attempts, a max attempt count inside a
//! rolling window, and a graceful-degradation rule that forgives one attempt
//! after a grace period so a legitimate retrying user is not locked out for
//! the whole window.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::ChannelLimits;
use crate::error::LinkError;

/// Which linking entry point an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleChannel {
    /// Minting a link token.
    LinkToken,
    /// The full link flow: token, session, UI open.
    LinkFlow,
    /// Post-handshake completion: token exchange and first fetch.
    SuccessFlow,
}

#[derive(Default)]
struct ChannelState {
    attempts: u32,
    window_started: Option<Instant>,
    last_attempt: Option<Instant>,
}

/// Rolling-window throttle over the three link channels.
pub struct LinkAttemptThrottle {
    link_token: Channel,
    link_flow: Channel,
    success_flow: Channel,
}

struct Channel {
    limits: ChannelLimits,
    state: Mutex<ChannelState>,
}

impl Channel {
    fn new(limits: ChannelLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(ChannelState::default()),
        }
    }

    fn try_acquire(&self) -> Result<(), LinkError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        // Window expired: start fresh.
        if let Some(started) = state.window_started {
            if now.duration_since(started) > self.limits.reset_interval {
                state.attempts = 0;
                state.window_started = None;
            }
        }

        // Debounce between consecutive attempts.
        if let Some(last) = state.last_attempt {
            let since = now.duration_since(last);
            if since < self.limits.debounce {
                return Err(LinkError::Throttled {
                    wait: self.limits.debounce - since,
                });
            }
        }

        if state.attempts >= self.limits.max_attempts {
            let elapsed = state
                .window_started
                .map(|started| now.duration_since(started))
                .unwrap_or(Duration::ZERO);

            if elapsed > self.limits.grace_period {
                // Graceful degradation: forgive one attempt, never the whole
                // window. The window restarts here so the next forgiveness
                // needs another full grace period and throughput stays bounded.
                state.attempts = self.limits.max_attempts.saturating_sub(1);
                state.window_started = Some(now);
                tracing::debug!("throttle window relaxed by one attempt");
            } else {
                return Err(LinkError::Throttled {
                    wait: self.limits.grace_period - elapsed,
                });
            }
        }

        state.attempts += 1;
        if state.window_started.is_none() {
            state.window_started = Some(now);
        }
        state.last_attempt = Some(now);
        Ok(())
    }
}

impl LinkAttemptThrottle {
    pub fn new(
        link_token: ChannelLimits,
        link_flow: ChannelLimits,
        success_flow: ChannelLimits,
    ) -> Self {
        Self {
            link_token: Channel::new(link_token),
            link_flow: Channel::new(link_flow),
            success_flow: Channel::new(success_flow),
        }
    }

    /// Claim one attempt on `channel`, or report how long to wait.
    pub fn try_acquire(&self, channel: ThrottleChannel) -> Result<(), LinkError> {
        let result = match channel {
            ThrottleChannel::LinkToken => self.link_token.try_acquire(),
            ThrottleChannel::LinkFlow => self.link_flow.try_acquire(),
            ThrottleChannel::SuccessFlow => self.success_flow.try_acquire(),
        };
        if let Err(LinkError::Throttled { wait }) = &result {
            tracing::info!(?channel, wait_secs = wait.as_secs(), "link attempt throttled");
        }
        result
    }
}
