//! Exponential backoff bookkeeping for reconnection.
//!
//! Pure policy math plus a small attempt-counting manager; the transport
//! is driven elsewhere.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::FeedError;

/// Reconnection behavior after an unexpected disconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Never reconnect; the connection settles in `Disconnected`.
    Never,
    /// Retry with exponential backoff. Unset fields fall back to the
    /// [`ResolvedBackoffPolicy`] defaults.
    ExponentialBackoff {
        initial_delay: Option<Duration>,
        max_delay: Option<Duration>,
        multiplier: Option<f64>,
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Fills unset fields with defaults. `None` for [`ReconnectPolicy::Never`].
    pub fn resolve(&self) -> Option<ResolvedBackoffPolicy> {
        match *self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                max_attempts,
            } => {
                let defaults = ResolvedBackoffPolicy::default();
                Some(ResolvedBackoffPolicy {
                    initial_delay: initial_delay.unwrap_or(defaults.initial_delay),
                    max_delay: max_delay.unwrap_or(defaults.max_delay),
                    multiplier: multiplier.unwrap_or(defaults.multiplier),
                    max_attempts: max_attempts.unwrap_or(defaults.max_attempts),
                })
            }
        }
    }
}

/// A backoff policy with every field populated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedBackoffPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Attempts after which reconnection gives up.
    pub max_attempts: u32,
}

impl Default for ResolvedBackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

/// Delay for a given attempt (0-indexed):
/// `min(initial_delay * multiplier^attempt, max_delay)`, then ±10% jitter
/// against thundering herds. A multiplier of 1.0 degenerates to
/// fixed-interval retry.
pub fn calculate_delay(attempt: u32, policy: &ResolvedBackoffPolicy) -> Duration {
    let exp = attempt.min(63) as i32;
    let base = (policy.initial_delay.as_secs_f64() * policy.multiplier.powi(exp))
        .min(policy.max_delay.as_secs_f64());

    // Jitter offset in [-1.0, 1.0) from the subsecond clock.
    let offset = (f64::from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    ) / 1_000_000_000.0)
        * 2.0
        - 1.0;

    Duration::from_secs_f64((base + base * 0.1 * offset).max(0.0))
}

/// Tracks reconnection attempts against a policy and exposes the
/// cancellable backoff wait.
#[derive(Debug)]
pub struct ReconnectionManager {
    policy: ReconnectPolicy,
    resolved: Option<ResolvedBackoffPolicy>,
    attempt: u32,
}

impl ReconnectionManager {
    /// Creates a manager for the given policy.
    pub fn new(policy: ReconnectPolicy) -> Self {
        let resolved = policy.resolve();
        Self {
            policy,
            resolved,
            attempt: 0,
        }
    }

    /// The policy this manager was built from.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Current attempt number (0-indexed).
    pub fn current_attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the policy allows another attempt.
    pub fn should_retry(&self) -> bool {
        match self.resolved {
            None => false,
            Some(resolved) => self.attempt < resolved.max_attempts,
        }
    }

    /// The delay the next `wait` would sleep, `None` under a `Never` policy.
    pub fn next_delay(&self) -> Option<Duration> {
        self.resolved
            .as_ref()
            .map(|resolved| calculate_delay(self.attempt, resolved))
    }

    /// Sleeps out the current attempt's delay.
    ///
    /// Fails with [`FeedError::ReconnectAborted`] if `cancel` is already
    /// cancelled or fires while waiting, and with
    /// [`FeedError::NeverPolicyWait`] under a `Never` policy; waiting to
    /// reconnect when the policy forbids it is a caller bug.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), FeedError> {
        let resolved = self.resolved.as_ref().ok_or(FeedError::NeverPolicyWait)?;
        if cancel.is_cancelled() {
            return Err(FeedError::ReconnectAborted);
        }
        let delay = calculate_delay(self.attempt, resolved);
        tokio::select! {
            _ = cancel.cancelled() => Err(FeedError::ReconnectAborted),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Records a failed attempt.
    pub fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Resets the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
