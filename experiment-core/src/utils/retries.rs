//! Backoff for calls into collaborator services.
//!
//! Configured by the `rpc_retries` table of the engine config. Errors whose `is_retryable()`
//! is false fail on the first attempt.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Deserialize, Copy, Clone, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_num_retries")]
    pub num_retries: usize,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            num_retries: default_num_retries(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_s: default_max_delay_s(),
        }
    }
}

fn default_num_retries() -> usize {
    2
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_max_delay_s() -> f32 {
    5.0
}

impl RetryConfig {
    /// A config that never retries.
    pub fn disabled() -> Self {
        RetryConfig {
            num_retries: 0,
            ..Default::default()
        }
    }

    /// Calls `func` until it succeeds, fails with a non-retryable error, or runs out of
    /// attempts. Each retry is logged under the collaborator's `service` name.
    pub fn retry<R, F: Future<Output = Result<R, Error>>>(
        &self,
        service: &'static str,
        func: impl FnMut() -> F,
    ) -> impl Future<Output = Result<R, Error>> {
        func.retry(self.backoff())
            .when(Error::is_retryable)
            .notify(move |e: &Error, delay: Duration| {
                tracing::warn!(
                    service,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying collaborator call"
                );
            })
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_secs_f32(self.max_delay_s))
            .with_max_times(self.num_retries)
    }
}
