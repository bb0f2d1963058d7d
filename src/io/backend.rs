//! Model backend abstraction and retry policy.
//!
//! The [`ModelBackend`] trait decouples the stage runner from provider
//! clients; the engine only ever sees `generate`. Tests use scripted mock
//! backends that return predetermined outputs without any network.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::cancel::CancelToken;
use crate::core::cost::{CallReport, Cost, CostTracker, Usage};

/// Provider error with the metadata retry policy needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub status: Option<u16>,
    pub transient: bool,
    pub message: String,
}

impl BackendError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            status: None,
            transient: false,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            status: None,
            transient: true,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            transient: false,
            message: message.into(),
        }
    }

    /// Safe to retry: explicitly transient, rate-limited, or a 5xx.
    pub fn is_transient(&self) -> bool {
        if self.transient {
            return true;
        }
        matches!(self.status, Some(429) | Some(500..=599))
    }
}

/// One model response plus optional provider-reported usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

/// A language-model provider as consumed by the engine.
pub trait ModelBackend: Send + Sync {
    fn generate(
        &self,
        token: &CancelToken,
        model: &str,
        prompt: &str,
    ) -> Result<GenerateResponse, BackendError>;

    fn name(&self) -> &str;

    fn models(&self) -> Vec<String>;
}

/// Named backends available to a run.
pub type BackendRegistry = BTreeMap<String, Box<dyn ModelBackend>>;

/// Bounded exponential backoff caps for transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 200,
            max_backoff_ms: 2000,
        }
    }
}

/// Backoff for the n-th retry (0-based), doubling from base up to max.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let max = Duration::from_millis(config.max_backoff_ms);
    let mut backoff = Duration::from_millis(config.base_backoff_ms);
    for _ in 0..attempt {
        backoff *= 2;
        if backoff >= max {
            return max;
        }
    }
    backoff.min(max)
}

/// Call `generate` with budget checks and bounded retry on transient
/// errors, recording one [`CallReport`] into the tracker per attempt
/// chain (failed chains keep their error string).
///
/// Permanent errors and exhausted retries surface the provider error;
/// budget violations and cancellation abort before the call.
pub fn call_with_retry(
    backend: &dyn ModelBackend,
    token: &CancelToken,
    model: &str,
    prompt: &str,
    retry: &RetryConfig,
    tracker: &mut CostTracker,
    fallback_used: bool,
) -> Result<GenerateResponse> {
    let adapter = backend.name().to_string();

    for attempt in 0..=retry.max_retries {
        tracker.check_budget(&adapter, model)?;
        token.check()?;

        match backend.generate(token, model, prompt) {
            Ok(response) => {
                let usage = response.usage.unwrap_or_default().normalized();
                let cost = tracker.estimate(&adapter, model, usage);
                tracker.record_reports(&[CallReport {
                    adapter: adapter.clone(),
                    model: model.to_string(),
                    usage,
                    cost,
                    retries: attempt,
                    fallback_used,
                    error: String::new(),
                }]);
                debug!(adapter = %adapter, model, attempt, "backend call succeeded");
                return Ok(response);
            }
            Err(err) => {
                let retryable = err.is_transient() && attempt < retry.max_retries;
                warn!(adapter = %adapter, model, attempt, retryable, error = %err, "backend call failed");
                if !retryable {
                    tracker.record_reports(&[CallReport {
                        adapter: adapter.clone(),
                        model: model.to_string(),
                        usage: Usage::default(),
                        cost: Cost::usd(),
                        retries: attempt,
                        fallback_used,
                        error: err.to_string(),
                    }]);
                    return Err(anyhow!(err));
                }
                token.sleep(compute_backoff(retry, attempt))?;
            }
        }
    }

    unreachable!("retry loop always returns");
}

/// A scripted response for [`MockBackend`].
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Content(String),
    ContentWithUsage(String, Usage),
    Error(BackendError),
}

/// Deterministic backend for tests and dry pipelines.
///
/// Responses are consumed in order; the last one repeats once the script
/// is exhausted. Prompts are recorded for assertions.
pub struct MockBackend {
    name: String,
    models: Vec<String>,
    script: Mutex<Vec<ScriptedResponse>>,
    next: Mutex<usize>,
    prompts: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(name: &str, script: Vec<ScriptedResponse>) -> Self {
        Self {
            name: name.to_string(),
            models: vec!["mock-sonnet".to_string(), "mock-opus".to_string()],
            script: Mutex::new(script),
            next: Mutex::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn echoing(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl ModelBackend for MockBackend {
    fn generate(
        &self,
        _token: &CancelToken,
        _model: &str,
        prompt: &str,
    ) -> Result<GenerateResponse, BackendError> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());

        let script = self.script.lock().expect("script lock");
        if script.is_empty() {
            return Ok(GenerateResponse {
                content: format!("mock response to: {prompt}"),
                usage: None,
            });
        }

        let mut next = self.next.lock().expect("next lock");
        let index = (*next).min(script.len() - 1);
        *next += 1;
        match &script[index] {
            ScriptedResponse::Content(content) => Ok(GenerateResponse {
                content: content.clone(),
                usage: None,
            }),
            ScriptedResponse::ContentWithUsage(content, usage) => Ok(GenerateResponse {
                content: content.clone(),
                usage: Some(*usage),
            }),
            ScriptedResponse::Error(err) => Err(err.clone()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = RetryConfig {
            max_retries: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 2000,
        };
        assert_eq!(compute_backoff(&config, 0), Duration::from_millis(200));
        assert_eq!(compute_backoff(&config, 1), Duration::from_millis(400));
        assert_eq!(compute_backoff(&config, 2), Duration::from_millis(800));
        assert_eq!(compute_backoff(&config, 4), Duration::from_millis(2000));
        assert_eq!(compute_backoff(&config, 10), Duration::from_millis(2000));
    }

    #[test]
    fn transient_classification_follows_status() {
        assert!(BackendError::transient("timeout").is_transient());
        assert!(BackendError::with_status(429, "rate limited").is_transient());
        assert!(BackendError::with_status(503, "unavailable").is_transient());
        assert!(!BackendError::with_status(400, "bad request").is_transient());
        assert!(!BackendError::permanent("no such model").is_transient());
    }

    #[test]
    fn retries_transient_errors_then_succeeds() {
        let backend = MockBackend::new(
            "mock",
            vec![
                ScriptedResponse::Error(BackendError::with_status(503, "busy")),
                ScriptedResponse::Error(BackendError::transient("timeout")),
                ScriptedResponse::Content("ok".to_string()),
            ],
        );
        let mut tracker = CostTracker::default();

        let response = call_with_retry(
            &backend,
            &CancelToken::new(),
            "mock-sonnet",
            "p",
            &retry_fast(),
            &mut tracker,
            false,
        )
        .expect("retry succeeds");

        assert_eq!(response.content, "ok");
        let calls = tracker.report().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].retries, 2);
        assert!(calls[0].error.is_empty());
    }

    #[test]
    fn permanent_error_fails_immediately() {
        let backend = MockBackend::new(
            "mock",
            vec![
                ScriptedResponse::Error(BackendError::with_status(400, "bad request")),
                ScriptedResponse::Content("never reached".to_string()),
            ],
        );
        let mut tracker = CostTracker::default();

        let err = call_with_retry(
            &backend,
            &CancelToken::new(),
            "mock-sonnet",
            "p",
            &retry_fast(),
            &mut tracker,
            false,
        )
        .expect_err("permanent");
        assert!(err.to_string().contains("bad request"));
        assert_eq!(backend.prompts().len(), 1);
        let calls = tracker.report().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].error, "bad request");
    }

    #[test]
    fn exhausted_retries_surface_last_error() {
        let backend = MockBackend::new(
            "mock",
            vec![ScriptedResponse::Error(BackendError::transient("always down"))],
        );
        let mut tracker = CostTracker::default();

        let err = call_with_retry(
            &backend,
            &CancelToken::new(),
            "mock-sonnet",
            "p",
            &retry_fast(),
            &mut tracker,
            false,
        )
        .expect_err("exhausted");
        assert!(err.to_string().contains("always down"));
        assert_eq!(backend.prompts().len(), 3);
    }

    #[test]
    fn budget_violation_aborts_before_calling() {
        let backend = MockBackend::echoing("mock");
        let mut tracker = CostTracker::new(Default::default(), 0.01);
        tracker.record_reports(&[CallReport {
            adapter: "mock".to_string(),
            model: "mock-sonnet".to_string(),
            usage: Usage::default(),
            cost: Cost {
                currency: "USD".to_string(),
                amount: 0.02,
                is_estimate: true,
                pricing_model: String::new(),
            },
            retries: 0,
            fallback_used: false,
            error: String::new(),
        }]);

        let err = call_with_retry(
            &backend,
            &CancelToken::new(),
            "mock-sonnet",
            "p",
            &retry_fast(),
            &mut tracker,
            false,
        )
        .expect_err("budget");
        assert!(err
            .downcast_ref::<crate::core::cost::BudgetExceeded>()
            .is_some());
        assert!(backend.prompts().is_empty());
    }

    #[test]
    fn mock_script_repeats_last_entry() {
        let backend = MockBackend::new(
            "mock",
            vec![ScriptedResponse::Content("same".to_string())],
        );
        let token = CancelToken::new();
        for _ in 0..3 {
            let response = backend.generate(&token, "m", "p").expect("generate");
            assert_eq!(response.content, "same");
        }
    }
}
