//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::dispatcher::DispatcherConfig;
use crate::error::{Error, Result};
use crate::llm::DEFAULT_MODEL;
use crate::machine::MachineConfig;
use crate::reconciler::SessionConfig;
use crate::retry::RetryPolicy;
use crate::telemetry::TelemetryConfig;
use crate::worker::RunnerConfig;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Required only by processes that run the LLM worker.
    pub anthropic_api_key: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub model: String,
    pub reclaim_after: Duration,
    pub subscriber_buffer: usize,
    pub replay_capacity: usize,
    pub optimistic_timeout: Duration,
    pub reconcile_interval: Duration,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            model: std::env::var("SAKHI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            reclaim_after: secs_var("SAKHI_RECLAIM_AFTER_SECS", 300)?,
            subscriber_buffer: positive_var("SAKHI_SUBSCRIBER_BUFFER", 256)?,
            replay_capacity: parsed_var("SAKHI_REPLAY_CAPACITY", 1024)?,
            optimistic_timeout: secs_var("SAKHI_OPTIMISTIC_TIMEOUT_SECS", 30)?,
            reconcile_interval: secs_var("SAKHI_RECONCILE_INTERVAL_SECS", 60)?,
            poll_interval: secs_var("SAKHI_POLL_INTERVAL_SECS", 5)?,
            max_concurrent: positive_var("SAKHI_MAX_CONCURRENT", 4)?,
        })
    }

    /// The API key, or a config error naming the missing variable.
    pub fn require_anthropic_api_key(&self) -> Result<&SecretString> {
        self.anthropic_api_key.as_ref().ok_or_else(|| {
            Error::Config("required environment variable ANTHROPIC_API_KEY is not set".to_string())
        })
    }

    pub fn telemetry_config(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
        }
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            retry: RetryPolicy::default(),
            reclaim_after: self.reclaim_after,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            subscriber_buffer: self.subscriber_buffer,
            replay_capacity: self.replay_capacity,
            retry: RetryPolicy::default(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            optimistic_timeout: self.optimistic_timeout,
            reconcile_interval: self.reconcile_interval,
            retry: RetryPolicy::default(),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: self.poll_interval,
            max_concurrent: self.max_concurrent,
            // sweep a few times per timeout window
            reclaim_interval: (self.reclaim_after / 4).max(Duration::from_secs(1)),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value {raw:?} for {name}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn positive_var(name: &str, default: usize) -> Result<usize> {
    let value = parsed_var(name, default)?;
    if value == 0 {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(value)
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    let secs = parsed_var(name, default)?;
    if secs == 0 {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(Duration::from_secs(secs))
}
