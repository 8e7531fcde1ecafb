//! # API Module
//!
//! The external LLM client: one stateless, single-turn chat completion per call,
//! with a fixed system preamble and the rendered prompt as the only user message.
//!
//! Transient failures (connection errors, rate limits, server-side API errors)
//! are retried with exponential backoff plus random jitter, bounded by
//! [`RetryPolicy::max_attempts`]. Once the budget is spent the last failure is
//! returned as [`LlmError::Exhausted`] so the task runner can do its own
//! bookkeeping. Admission control (calls per minute) is **not** done here; the
//! worker pool owns it.
//!
//! Everything downstream talks to the [`Completion`] trait, so tests can swap
//! the HTTP client for a scripted fake.
//!
//! # Example
//!
//! ```no_run
//! use topranks::api::{Completion, OpenAiClient};
//! use topranks::config::load_config;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("config.yaml")?;
//! let client = OpenAiClient::new(&config)?;
//! let answer = client.complete("What is the capital of France?", None).await?;
//! println!("{answer}");
//! # Ok(()) }
//! ```

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use rand::Rng;
use std::{future::Future, time::Duration};
use tracing::{debug, warn};

use crate::config::{RetrySettings, TopRanksConfig};
use crate::error::{LlmError, RankError};

/// Something that turns a prompt into completion text.
#[async_trait]
pub trait Completion: Send + Sync {
    /// Runs one single-turn completion. `model` overrides the configured default.
    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<String, LlmError>;
}

/// Bounded exponential backoff with full-range jitter.
///
/// Attempt `n` (1-based) waits a uniformly random delay in
/// `[min_delay, min(max_delay, min_delay * 2^(n-1))]` before attempt `n + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = (self.max_delay.as_millis() as u64).max(min);
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let upper = min.saturating_mul(factor).min(max);
        let millis = if upper > min {
            rand::thread_rng().gen_range(min..=upper)
        } else {
            min
        };
        Duration::from_millis(millis)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            min_delay: Duration::from_millis(settings.min_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

/// Runs `operation` until it succeeds, fails fatally, or the attempt budget is spent.
///
/// `operation` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, LlmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                return Err(LlmError::Exhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "LLM call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Maps provider errors onto retryable and non-retryable classes.
fn classify(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) => LlmError::Transient(e.to_string()),
        OpenAIError::JSONDeserialize(e) => LlmError::Transient(e.to_string()),
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.as_deref().unwrap_or_default();
            let code = api
                .code
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default();
            if matches!(
                kind,
                "invalid_request_error" | "authentication_error" | "permission_error"
            ) || code.contains("invalid_api_key")
            {
                LlmError::Fatal(api.message)
            } else {
                LlmError::Transient(api.message)
            }
        }
        other => LlmError::Fatal(other.to_string()),
    }
}

/// [`Completion`] over an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    system_prompt: String,
    retry: RetryPolicy,
}

impl OpenAiClient {
    /// Creates a client from configuration.
    ///
    /// The library's own backoff is disabled so [`RetryPolicy`] is the only
    /// retry loop.
    pub fn new(config: &TopRanksConfig) -> Result<Self, RankError> {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(config.api_base.clone());
        let http = reqwest::Client::builder()
            .timeout(config.retry.request_timeout())
            .build()
            .map_err(|e| RankError::Config(format!("failed to build HTTP client: {e}")))?;
        let no_internal_retry = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        debug!(api_base = %config.api_base, model = %config.model, "LLM client created");
        Ok(Self {
            client: Client::with_config(openai_config)
                .with_http_client(http)
                .with_backoff(no_internal_retry),
            model: config.model.clone(),
            temperature: config.temperature,
            system_prompt: config.prompts.system.clone(),
            retry: RetryPolicy::from(&config.retry),
        })
    }

    async fn complete_once(&self, prompt: &str, model: &str, attempt: u32) -> Result<String, LlmError> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_prompt.as_str())
                .build()
                .map_err(classify)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(classify)?
                .into(),
        ];
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .temperature(self.temperature)
            .messages(messages)
            .build()
            .map_err(classify)?;

        debug!(attempt, model, "sending completion request");
        let response = self.client.chat().create(request).await.map_err(classify)?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[async_trait]
impl Completion for OpenAiClient {
    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<String, LlmError> {
        let model = model.unwrap_or(&self.model);
        retry_with_backoff(&self.retry, |attempt| self.complete_once(prompt, model, attempt)).await
    }
}
