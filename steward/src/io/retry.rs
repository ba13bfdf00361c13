//! Collaborator call errors and bounded retry.
//!
//! Collaborators report failures as either transient (network, timeout,
//! rate limit) or permanent (malformed output, contract violation). Only
//! transient failures are retried, with exponential backoff and jitter,
//! and only up to the configured attempt budget.

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Failure from a proposal-feed, decision-engine, or execution-surface call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Worth retrying: the same call may succeed shortly.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help; the caller must classify the item as failed.
    #[error("{0}")]
    Permanent(String),
}

impl CallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }
}

/// Bounded backoff applied to transient collaborator errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (must be >= 1).
    pub max_attempts: u32,
    /// Base delay doubled after each failed attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
        }
    }
}

/// Run `op`, retrying transient errors per `policy`. Permanent errors and
/// exhausted budgets return the last error unchanged.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Result<T, CallError>,
) -> Result<T, CallError> {
    let mut attempt = 1u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts.max(1) => {
                let backoff = backoff_delay(policy.base_delay_ms, attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let doubled = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let jitter = if base_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=base_ms / 2)
    };
    Duration::from_millis(doubled.saturating_add(jitter))
}
