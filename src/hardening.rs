use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::constants::{RETRYABLE_STATUS_CODES, TRANSIENT_ERROR_PATTERNS};
use crate::types::{ObservedError, QuotientError, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Transient failures are worth another attempt; validation and unknown
/// errors are not.
pub fn is_retryable_error(err: &ObservedError) -> bool {
    match &err.inner {
        QuotientError::Network(_) | QuotientError::Io(_) => true,
        QuotientError::RateLimited { .. } => true,
        QuotientError::Upstream(status, body) => {
            status.is_server_error()
                || RETRYABLE_STATUS_CODES.contains(&status.as_u16())
                || is_transient_message(body)
        }
        QuotientError::Internal(msg, _) => is_transient_message(msg),
        _ => false,
    }
}

fn is_transient_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    TRANSIENT_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// `min(initial × multiplier^attempt, max)`, perturbed by ± jitter × delay.
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config.initial_delay_ms as f64 * config.multiplier.powi(attempt as i32);
    let capped = base.min(config.max_delay_ms as f64);
    let jitter_span = capped * config.jitter;
    let jittered = if jitter_span > 0.0 {
        capped + (fastrand::f64() * 2.0 - 1.0) * jitter_span
    } else {
        capped
    };
    Duration::from_millis(jittered.max(1.0) as u64)
}

/// Runs `operation` up to `max_retries + 1` times. A non-retryable error
/// aborts immediately and is re-thrown verbatim; exhausting retryable
/// failures yields a RetryExhausted carrying the attempt count and the last
/// underlying error.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let total_attempts = config.max_retries + 1;
    let mut last_error: Option<ObservedError> = None;

    for attempt in 0..total_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable_error(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "Attempt {}/{} failed: {}",
                    attempt + 1,
                    total_attempts,
                    e
                );
                last_error = Some(e);
                if attempt + 1 < total_attempts {
                    tokio::time::sleep(calculate_delay(attempt, config)).await;
                }
            }
        }
    }

    Err(QuotientError::RetryExhausted {
        attempts: total_attempts,
        last: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
    .into())
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
    open: bool,
}

/// Per-key circuit breakers, owned by the serving process and shared across
/// request tasks. Keys name the guarded upstream ("completion",
/// "passage-search"); `reset`/`reset_all` exist for tests and operations.
pub struct CircuitRegistry {
    breakers: Mutex<HashMap<String, BreakerState>>,
    config: CircuitBreakerConfig,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Fails fast while the key's circuit is open and the reset window has
    /// not elapsed. When the window has elapsed, admits a single half-open
    /// probe (the window is restarted so concurrent callers keep failing
    /// fast until the probe settles).
    pub async fn check(&self, key: &str) -> Result<()> {
        let mut breakers = self.breakers.lock().await;
        let state = breakers.entry(key.to_string()).or_default();

        if !state.open {
            return Ok(());
        }

        let elapsed = state
            .last_failure
            .map(|t| t.elapsed())
            .unwrap_or(self.config.reset_after);

        if elapsed >= self.config.reset_after {
            tracing::info!("Circuit '{}' transitioning to half-open", key);
            state.last_failure = Some(Instant::now());
            return Ok(());
        }

        Err(QuotientError::CircuitOpen(key.to_string()).into())
    }

    pub async fn record_success(&self, key: &str) {
        let mut breakers = self.breakers.lock().await;
        let state = breakers.entry(key.to_string()).or_default();
        state.failures = 0;
        if state.open {
            tracing::info!("Circuit '{}' closed", key);
            state.open = false;
        }
    }

    pub async fn record_failure(&self, key: &str) {
        let mut breakers = self.breakers.lock().await;
        let state = breakers.entry(key.to_string()).or_default();
        state.failures += 1;
        state.last_failure = Some(Instant::now());
        if state.failures >= self.config.failure_threshold && !state.open {
            tracing::error!(
                "Circuit '{}' opened after {} consecutive failures",
                key,
                state.failures
            );
            state.open = true;
        }
    }

    /// check + call + record in one step.
    pub async fn guard<F, Fut, T>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check(key).await?;
        match operation().await {
            Ok(value) => {
                self.record_success(key).await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(key).await;
                Err(e)
            }
        }
    }

    pub async fn is_open(&self, key: &str) -> bool {
        let breakers = self.breakers.lock().await;
        breakers.get(key).map(|s| s.open).unwrap_or(false)
    }

    pub async fn reset(&self, key: &str) {
        let mut breakers = self.breakers.lock().await;
        breakers.remove(key);
    }

    pub async fn reset_all(&self) {
        let mut breakers = self.breakers.lock().await;
        breakers.clear();
    }
}

/// --- RATE LIMITING ---

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after: Duration,
}

/// Fixed-window request counter keyed by caller identity.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, (Instant, u32)>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(key.to_string()).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.config.window {
            *entry = (now, 0);
        }

        let window_ends_in = self
            .config
            .window
            .saturating_sub(now.duration_since(entry.0));

        if entry.1 >= self.config.max_requests {
            return RateLimitDecision {
                allowed: false,
                limit: self.config.max_requests,
                remaining: 0,
                retry_after: window_ends_in,
            };
        }

        entry.1 += 1;
        RateLimitDecision {
            allowed: true,
            limit: self.config.max_requests,
            remaining: self.config.max_requests - entry.1,
            retry_after: window_ends_in,
        }
    }
}
