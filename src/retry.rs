//! Error classification and retry policy for remote generation calls.
//!
//! # Architecture
//!
//! ```text
//! EngineError ──classify──> ErrorClass ──delay_for──> Option<Duration>
//!                               │                          │
//!                               ▼                          ▼
//!                      fatal / non-retryable        sleep, then retry
//!                         (rethrow now)
//! ```
//!
//! The classifier is a pure mapping over [`FailureKind`]; transports decide
//! the kind once at the HTTP boundary. The policy owns every wait in the
//! retry loop, so tests can drive it under tokio's paused clock.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::{EngineError, FailureKind};

// ============================================================================
// Defaults
// ============================================================================

/// Total attempts per call, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for server-fault exponential backoff.
pub const DEFAULT_BASE_DELAY_MS: u64 = 2000;

/// Per-attempt step for rate limits without a provider hint.
pub const DEFAULT_RATE_LIMIT_STEP_MS: u64 = 10_000;

/// Padding added on top of a provider-suggested wait.
pub const DEFAULT_HINT_BUFFER_MS: u64 = 1000;

/// Upper bound for any single wait.
pub const DEFAULT_MAX_DELAY_MS: u64 = 120_000;

// ============================================================================
// Classification
// ============================================================================

/// Fixed failure taxonomy. Derived fresh from each failure, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    FatalQuota,
    FatalPermission,
    RetryableRateLimit,
    RetryableServer,
    NonRetryable,
}

impl ErrorClass {
    /// Fatal classes halt the whole batch and need a human.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalQuota | Self::FatalPermission)
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableRateLimit | Self::RetryableServer)
    }

    /// Operator-facing next step for this class.
    #[must_use]
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::FatalQuota => {
                "Daily quota exhausted. Switch to a key with remaining quota, then resume the batch."
            }
            Self::FatalPermission => {
                "Access denied. Check the API key, its permissions and billing, then resume the batch."
            }
            Self::RetryableRateLimit => "Rate limited. Wait a minute and retry the item.",
            Self::RetryableServer => "Provider is struggling. Retry the item later.",
            Self::NonRetryable => "The request was refused. Adjust the prompt and retry the item.",
        }
    }
}

impl From<FailureKind> for ErrorClass {
    fn from(kind: FailureKind) -> Self {
        classify(kind)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FatalQuota => "FATAL_QUOTA",
            Self::FatalPermission => "FATAL_PERMISSION",
            Self::RetryableRateLimit => "RETRYABLE_RATE_LIMIT",
            Self::RetryableServer => "RETRYABLE_SERVER",
            Self::NonRetryable => "NON_RETRYABLE",
        };
        write!(f, "{s}")
    }
}

/// Map a transport failure kind onto the taxonomy.
#[must_use]
pub fn classify(kind: FailureKind) -> ErrorClass {
    match kind {
        FailureKind::DailyQuota => ErrorClass::FatalQuota,
        FailureKind::PermissionDenied => ErrorClass::FatalPermission,
        FailureKind::RateLimited => ErrorClass::RetryableRateLimit,
        FailureKind::ServerFault => ErrorClass::RetryableServer,
        FailureKind::Unavailable | FailureKind::Rejected => ErrorClass::NonRetryable,
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Retry section of the settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub rate_limit_step_ms: u64,
    pub hint_buffer_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            rate_limit_step_ms: DEFAULT_RATE_LIMIT_STEP_MS,
            hint_buffer_ms: DEFAULT_HINT_BUFFER_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            problems.push("retry.max_delay_ms must not be below retry.base_delay_ms".to_string());
        }
        problems
    }
}

/// Control-flow decorator around one remote call.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Wait before the next attempt, or `None` when the class never retries.
    ///
    /// `attempt` is the 1-based number of the attempt that just failed.
    #[must_use]
    pub fn delay_for(
        &self,
        class: ErrorClass,
        attempt: u32,
        hint: Option<Duration>,
    ) -> Option<Duration> {
        let millis = match class {
            ErrorClass::RetryableRateLimit => match hint {
                Some(hint) => {
                    let secs = hint.as_secs_f64().ceil() as u64;
                    secs.saturating_mul(1000)
                        .saturating_add(self.config.hint_buffer_ms)
                }
                None => self
                    .config
                    .rate_limit_step_ms
                    .saturating_mul(u64::from(attempt)),
            },
            ErrorClass::RetryableServer => {
                let multiplier = 2u64.saturating_pow(attempt);
                self.config.base_delay_ms.saturating_mul(multiplier)
            }
            _ => return None,
        };
        Some(Duration::from_millis(millis.min(self.config.max_delay_ms)))
    }

    /// Invoke `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// Fatal and non-retryable failures are returned at once with no wait.
    /// After the last attempt the final error is returned unchanged so the
    /// caller can classify it again.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = err.class();
            if class.is_fatal() {
                warn!(class = %class, error = %err.message, "Fatal failure, not retrying");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(
                    class = %class,
                    attempts = attempt,
                    error = %err.message,
                    "Retry budget exhausted"
                );
                return Err(err);
            }
            let Some(delay) = self.delay_for(class, attempt, err.retry_after) else {
                debug!(class = %class, error = %err.message, "Failure is not retryable");
                return Err(err);
            };

            warn!(
                class = %class,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
