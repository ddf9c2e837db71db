//! Per-step retry and timeout policy.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Step;

/// Retry policy for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Per-attempt timeout in seconds; expiry counts as a transient failure
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    1000
}
fn default_backoff_max() -> u64 {
    300_000
} // 5 min
fn default_timeout() -> u64 {
    600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Backoff after `attempts` failed attempts: base × 2^(attempts−1), capped
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }

    /// Whether the budget allows another attempt after `attempts` failures
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Retry policies for every step
#[derive(Debug, Clone, PartialEq)]
pub struct StagePolicies {
    policies: HashMap<Step, RetryPolicy>,
}

impl Default for StagePolicies {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(Step::Transcribe, RetryPolicy::default());
        policies.insert(
            Step::ExtractInsights,
            RetryPolicy {
                timeout_seconds: 120,
                ..Default::default()
            },
        );
        policies.insert(
            Step::Persist,
            RetryPolicy {
                max_attempts: 5,
                timeout_seconds: 30,
                ..Default::default()
            },
        );
        Self { policies }
    }
}

impl StagePolicies {
    /// Same policy for every step
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            policies: Step::ALL.iter().map(|s| (*s, policy.clone())).collect(),
        }
    }

    pub fn with(mut self, step: Step, policy: RetryPolicy) -> Self {
        self.policies.insert(step, policy);
        self
    }

    pub fn get(&self, step: Step) -> RetryPolicy {
        self.policies.get(&step).cloned().unwrap_or_default()
    }
}
