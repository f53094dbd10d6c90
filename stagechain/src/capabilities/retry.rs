//! Retry utilities with configurable backoff and jitter strategies.
//!
//! Retrying belongs to the capability collaborator, never to the pipeline
//! core: wrap a model in [`RetryingChatModel`] (or call [`with_retry`]
//! yourself) and the stages above it only see the final outcome.

use super::{ChatModel, ChatRequest, ModelResponse};
use crate::errors::CapabilityError;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// State tracking for one retried operation.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Number of retries already scheduled.
    pub attempt: usize,
    previous_delay: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once every allowed attempt has been made.
    ///
    /// `attempt` counts retries, so the first call plus `attempt` retries
    /// have run.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt + 1 >= config.max_attempts
    }

    /// Calculates the delay before the next retry.
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let attempt = u32::try_from(self.attempt).unwrap_or(u32::MAX);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(attempt)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Constant => base,
        }
        .min(max);

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        self.previous_delay = Some(jittered);
        Duration::from_millis(jittered)
    }
}

/// Executes an operation, retrying every error.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, key: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    with_retry_when(config, key, operation, |_| true).await
}

/// Executes an operation, retrying only errors accepted by `retryable`.
pub async fn with_retry_when<T, E, F, Fut, P>(
    config: &RetryConfig,
    key: &str,
    operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    with_retry_hinted(config, key, operation, retryable, |_| None).await
}

/// Like [`with_retry_when`], but an error may ask for a minimum delay
/// before the next attempt (e.g. a rate limit's retry-after).
pub async fn with_retry_hinted<T, E, F, Fut, P, H>(
    config: &RetryConfig,
    key: &str,
    mut operation: F,
    retryable: P,
    min_delay: H,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
{
    let mut state = RetryState::new();

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !retryable(&e) || state.is_exhausted(config) {
                    return Err(e);
                }
                let mut delay = state.calculate_delay(config);
                if let Some(hint) = min_delay(&e) {
                    delay = delay.max(hint);
                }
                state.attempt += 1;
                tracing::debug!(
                    key,
                    attempt = state.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// A chat model that retries transient failures of an inner model.
///
/// Only errors for which [`CapabilityError::is_retryable`] holds are
/// retried. A rate-limit hint from the collaborator stretches the delay.
pub struct RetryingChatModel {
    inner: Arc<dyn ChatModel>,
    config: RetryConfig,
}

impl RetryingChatModel {
    /// Wraps `inner` with the given retry policy.
    #[must_use]
    pub fn new(inner: Arc<dyn ChatModel>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl fmt::Debug for RetryingChatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingChatModel")
            .field("model", &self.inner.model_name())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl ChatModel for RetryingChatModel {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, request: ChatRequest) -> Result<ModelResponse, CapabilityError> {
        with_retry_hinted(
            &self.config,
            self.inner.model_name(),
            || self.inner.complete(request.clone()),
            CapabilityError::is_retryable,
            |e: &CapabilityError| match e {
                CapabilityError::RateLimited {
                    retry_after_ms: Some(hint),
                    ..
                } => Some(Duration::from_millis(*hint)),
                _ => None,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ChatMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.jitter_strategy, JitterStrategy::Full);
    }

    #[test]
    fn test_retry_config_from_json() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 5, "jitter_strategy": "none"}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
        assert_eq!(config.max_delay_ms, 30000);
    }

    #[test]
    fn test_calculate_delay_without_jitter() {
        let exponential = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        let linear = exponential.clone().with_backoff(BackoffStrategy::Linear);
        let constant = exponential.clone().with_backoff(BackoffStrategy::Constant);

        let mut state = RetryState::new();
        state.attempt = 2;
        assert_eq!(state.calculate_delay(&exponential), Duration::from_millis(400));
        assert_eq!(state.calculate_delay(&linear), Duration::from_millis(300));
        assert_eq!(state.calculate_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_calculate_delay_capped_and_jittered() {
        let capped = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();
        state.attempt = 10;
        assert_eq!(state.calculate_delay(&capped), Duration::from_millis(5000));

        let full = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        for _ in 0..10 {
            assert!(state.calculate_delay(&full) <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_with_retry_success_after_failures() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None);
        let mut calls = 0;

        let result: Result<i32, String> = with_retry(&config, "test", || {
            calls += 1;
            let current = calls;
            async move {
                if current < 3 {
                    Err(format!("attempt {current}"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_at_max_attempts() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None);
        let mut calls = 0;

        let result: Result<i32, String> = with_retry(&config, "test", || {
            calls += 1;
            async { Err("always fails".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_with_retry_when_skips_permanent_errors() {
        let config = RetryConfig::new().with_base_delay_ms(1);
        let mut calls = 0;

        let result: Result<i32, String> = with_retry_when(
            &config,
            "test",
            || {
                calls += 1;
                async { Err("permanent".to_string()) }
            },
            |e: &String| e != "permanent",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[derive(Default)]
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        error: Option<CapabilityError>,
    }

    #[async_trait]
    impl ChatModel for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _request: ChatRequest) -> Result<ModelResponse, CapabilityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.error {
                Some(err) if call < self.failures => Err(err.clone()),
                _ => Ok(ModelResponse::new("done", "flaky")),
            }
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    #[tokio::test]
    async fn test_retrying_model_retries_transient_errors() {
        let inner = Arc::new(Flaky {
            failures: 2,
            error: Some(CapabilityError::timeout("flaky", 10)),
            ..Flaky::default()
        });
        let model = RetryingChatModel::new(inner.clone(), fast_config());

        let response = model
            .complete(ChatRequest::new(vec![ChatMessage::human("hi")]))
            .await
            .unwrap();
        assert_eq!(response.content, "done");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(model.model_name(), "flaky");
    }

    #[tokio::test]
    async fn test_with_retry_hinted_waits_at_least_the_hint() {
        let mut calls = 0;
        let started = std::time::Instant::now();

        let result: Result<i32, u64> = with_retry_hinted(
            &fast_config(),
            "test",
            || {
                calls += 1;
                let current = calls;
                async move { if current < 2 { Err(40) } else { Ok(7) } }
            },
            |_| true,
            |hint: &u64| Some(Duration::from_millis(*hint)),
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls, 2);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_retrying_model_gives_up_on_rejection() {
        let inner = Arc::new(Flaky {
            failures: 5,
            error: Some(CapabilityError::rejected("flaky", "content policy")),
            ..Flaky::default()
        });
        let model = RetryingChatModel::new(inner.clone(), fast_config());

        let err = model.complete(ChatRequest::new(vec![])).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Rejected { .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
