//! LLM provider setup via rig-core, and the worker that answers queries.
//!
//! [`anthropic_client`] builds an Anthropic [`Client`] from a
//! [`SecretString`]-wrapped API key. [`LlmWorker`] wraps it as a
//! [`Worker`](crate::worker::Worker): one chat completion per job, retried
//! with backoff when the provider rate-limits.
//!
//! # Example
//! ```no_run
//! use sakhi_rs::llm::{LlmWorker, anthropic_client};
//! use secrecy::SecretString;
//!
//! let key = SecretString::from("sk-ant-...");
//! let client = anthropic_client(&key).expect("failed to create Anthropic client");
//! let worker = LlmWorker::new(client, "claude-sonnet-4-20250514");
//! ```
//!
//! [`Client`]: rig::providers::anthropic::Client
//! [`SecretString`]: secrecy::SecretString

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use secrecy::{ExposeSecret, SecretString};
use tracing::{Instrument, warn};

use crate::model::JobId;
use crate::retry::RetryPolicy;
use crate::telemetry::genai::start_chat_span;
use crate::worker::Worker;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const MAX_TOKENS: u64 = 1024;

const PREAMBLE: &str = "You are Sakhi, a legal awareness assistant for laws protecting \
women and children. Explain the relevant law in simple language: what it covers, who it \
protects, its key provisions and how a person can use it. Do not give legal advice; when \
asked for advice, suggest consulting a qualified lawyer.";

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}

/// Answers each job's question with one Anthropic chat completion.
pub struct LlmWorker {
    client: rig::providers::anthropic::Client,
    model: String,
    retry: RetryPolicy,
}

impl LlmWorker {
    pub fn new(client: rig::providers::anthropic::Client, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn ask(&self, input: &str) -> anyhow::Result<String> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(PREAMBLE)
            .max_tokens(MAX_TOKENS)
            .build();

        let mut attempt = 0u32;
        loop {
            match agent.prompt(input).await {
                Ok(answer) => return Ok(answer.trim().to_string()),
                Err(e) if is_rate_limited(&e.to_string()) => {
                    attempt += 1;
                    if !self.retry.should_retry(attempt) {
                        return Err(anyhow::anyhow!("rate limit retries exhausted: {e}"));
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Worker for LlmWorker {
    fn name(&self) -> &str {
        "llm"
    }

    async fn process(&self, _id: JobId, input: &str) -> anyhow::Result<String> {
        let span = start_chat_span(&self.model, "anthropic");
        self.ask(input).instrument(span).await
    }
}

/// Provider errors that mean "slow down", not "this request is bad".
fn is_rate_limited(message: &str) -> bool {
    let message = message.to_lowercase();
    ["429", "rate limit", "rate_limit", "overloaded", "resource_exhausted"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_errors_are_recognised() {
        assert!(is_rate_limited("HTTP 429 Too Many Requests"));
        assert!(is_rate_limited("Anthropic: Overloaded"));
        assert!(!is_rate_limited("invalid x-api-key"));
    }
}
