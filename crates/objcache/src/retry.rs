// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded retry with exponential backoff, shared by listing and fetching

use crate::error::{Error, Result};
use backon::{ExponentialBuilder, Retryable};
use diagnostics::*;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1.
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".into()));
        }
        if self.min_delay > self.max_delay {
            return Err(Error::Config("retry min_delay exceeds max_delay".into()));
        }
        if self.factor < 1.0 {
            return Err(Error::Config("retry factor must be >= 1.0".into()));
        }
        Ok(())
    }

    fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_max_times(self.max_attempts.saturating_sub(1));
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Run `op`, retrying while it fails with a transient error and attempts
    /// remain. Non-transient errors surface immediately.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        op.retry(self.backoff())
            .when(Error::is_transient)
            .notify(|e: &Error, delay: Duration| {
                let reason = e.to_string();
                let delay_ms = delay.as_millis() as u64;
                warn!("Retrying {operation} in {delay_ms}ms after: {reason}", operation: operation, delay_ms: delay_ms, reason: reason);
            })
            .await
    }
}
