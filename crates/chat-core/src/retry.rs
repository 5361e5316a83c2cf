use std::time::Duration;

use crate::error::{ChatError, ChatErrorCategory};

/// Why a reconnect loop stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The gateway rejected the session token; retrying cannot help.
    AuthRejected,
    /// The failure is permanent for some non-auth reason (bad endpoint,
    /// malformed handshake response).
    NotRetryable,
    /// The bounded attempt budget ran out.
    AttemptsExhausted,
}

/// Next action for a reconnect loop after a connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait for `delay`, then attempt to reconnect.
    Retry { delay: Duration },
    /// Give up and settle in `Disconnected`.
    Stop { reason: StopReason },
}

/// Bounded backoff policy for gateway reconnection.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }

    /// Decide what a reconnect loop should do after losing the connection on
    /// the given zero-based `attempt`.
    ///
    /// Auth failures are terminal regardless of the remaining attempt budget.
    pub fn decide(&self, attempt: u32, error: &ChatError) -> ReconnectDecision {
        if !error.is_transient() {
            let reason = if error.category == ChatErrorCategory::Auth {
                StopReason::AuthRejected
            } else {
                StopReason::NotRetryable
            };
            return ReconnectDecision::Stop { reason };
        }
        if attempt >= self.max_attempts {
            return ReconnectDecision::Stop {
                reason: StopReason::AttemptsExhausted,
            };
        }
        ReconnectDecision::Retry {
            delay: self.delay_for_attempt(attempt, error.retry_after_ms),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(500, 30_000, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorCategory;

    fn network_error() -> ChatError {
        ChatError::new(ChatErrorCategory::Network, "socket_lost", "reset by peer")
    }

    #[test]
    fn starts_with_base_delay() {
        let policy = ReconnectPolicy::new(250, 8_000, 5);
        assert_eq!(
            policy.delay_for_attempt(0, None),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn scales_exponentially_for_attempts() {
        let policy = ReconnectPolicy::new(100, 10_000, 5);
        assert_eq!(
            policy.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = ReconnectPolicy::new(1_000, 4_000, 5);
        assert_eq!(
            policy.delay_for_attempt(5, None),
            Duration::from_millis(4_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let policy = ReconnectPolicy::new(500, 20_000, 5);
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn retries_transient_errors_within_budget() {
        let policy = ReconnectPolicy::new(500, 30_000, 5);
        match policy.decide(0, &network_error()) {
            ReconnectDecision::Retry { delay } => assert_eq!(delay, Duration::from_millis(500)),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn stops_after_attempt_budget_is_spent() {
        let policy = ReconnectPolicy::new(500, 30_000, 5);
        assert_eq!(
            policy.decide(5, &network_error()),
            ReconnectDecision::Stop {
                reason: StopReason::AttemptsExhausted
            }
        );
    }

    #[test]
    fn auth_rejection_is_terminal_on_first_attempt() {
        let policy = ReconnectPolicy::default();
        let auth = ChatError::new(ChatErrorCategory::Auth, "auth_rejected", "expired token");
        assert_eq!(
            policy.decide(0, &auth),
            ReconnectDecision::Stop {
                reason: StopReason::AuthRejected
            }
        );
    }

    #[test]
    fn non_auth_permanent_failures_stop_without_auth_blame() {
        let policy = ReconnectPolicy::default();
        let gone = ChatError::new(
            ChatErrorCategory::Conflict,
            "gateway_handshake_rejected",
            "gateway handshake failed with HTTP 404",
        );
        assert_eq!(
            policy.decide(0, &gone),
            ReconnectDecision::Stop {
                reason: StopReason::NotRetryable
            }
        );
    }
}
