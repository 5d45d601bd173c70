//! Retrying, circuit-breaker-guarded HTTP transport for upstream APIs.
//!
//! The breaker wraps each raw attempt and the retry loop wraps the guarded
//! attempt. Dropping the returned future (shutdown, outer timeout) abandons
//! any remaining attempts immediately.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};

use crate::clients::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::configuration::ResilienceConfiguration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub retryable_statuses: HashSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            retryable_statuses: [500, 502, 503, 504].into_iter().collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("circuit breaker is open, request not sent")]
    CircuitOpen,
    #[error("upstream answered {status} after {attempts} attempts")]
    Retryable { status: StatusCode, attempts: u32 },
    #[error("upstream answered {status}")]
    NonRetryable { status: StatusCode },
    #[error("request failed after {attempts} attempts: {source}")]
    Network {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build request: {0}")]
    Build(#[source] reqwest::Error),
}

impl TransportError {
    /// Whether the failure was transient (the caller may try again later).
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Retryable { .. } | TransportError::Network { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, TransportError::CircuitOpen)
    }
}

/// Why a single attempt counts as a failure for breaker and retry purposes.
enum AttemptFailure {
    Status(StatusCode),
    Network(reqwest::Error),
}

#[derive(Clone)]
pub struct ResilientTransport {
    client: Client,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientTransport {
    pub fn new(client: Client, policy: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            client,
            policy,
            breaker: Arc::new(CircuitBreaker::new(breaker)),
        }
    }

    pub fn from_configuration(config: &ResilienceConfiguration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("link-tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(TransportError::Build)?;

        Ok(Self::new(
            client,
            RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                delay: config.retry_delay,
                retryable_statuses: config.retryable_statuses.iter().copied().collect(),
            },
            CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                reset_timeout: config.reset_timeout,
            },
        ))
    }

    /// Sends the request produced by `build`, once per attempt, and returns
    /// the first successful response.
    pub async fn execute<F>(&self, build: F) -> Result<Response, TransportError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = self.breaker.call(self.attempt(&build)).await;

            let failure = match outcome {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    return Err(TransportError::NonRetryable {
                        status: response.status(),
                    });
                }
                Err(CircuitBreakerError::Open) => return Err(TransportError::CircuitOpen),
                Err(CircuitBreakerError::Inner(failure)) => failure,
            };

            if attempt >= max_attempts {
                return Err(match failure {
                    AttemptFailure::Status(status) => TransportError::Retryable {
                        status,
                        attempts: attempt,
                    },
                    AttemptFailure::Network(source) => TransportError::Network {
                        attempts: attempt,
                        source,
                    },
                });
            }

            match &failure {
                AttemptFailure::Status(status) => {
                    log::debug!("Attempt {attempt}/{max_attempts} got {status}, retrying");
                }
                AttemptFailure::Network(e) => {
                    log::debug!("Attempt {attempt}/{max_attempts} failed: {e}, retrying");
                }
            }
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    async fn attempt<F>(&self, build: &F) -> Result<Response, AttemptFailure>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = build(&self.client).send().await.map_err(AttemptFailure::Network)?;
        let status = response.status();
        if self.policy.retryable_statuses.contains(&status.as_u16()) {
            return Err(AttemptFailure::Status(status));
        }
        Ok(response)
    }
}
