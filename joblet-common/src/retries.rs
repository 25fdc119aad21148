// Copyright 2024-2025 Joblet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Unbounded-attempt variant used by supervisors that must never give
    /// up (the persistence subprocess restarter).
    pub fn supervisor() -> Self {
        Self {
            max_attempts: u32::MAX,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.min_delay;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.multiplier).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "max attempts: {}", self.max_attempts);
        let _ = writeln!(&mut result, "min delay: {:?}", self.min_delay);
        let _ = writeln!(&mut result, "max delay: {:?}", self.max_delay);
        let _ = writeln!(&mut result, "multiplier: {}", self.multiplier);
        result
    }
}

/// Run `action` with exponential backoff until it succeeds, it fails with
/// a non-retriable error, or the attempt budget is exhausted.
pub async fn with_retries<T, E, F, Fut>(
    target: &str,
    operation: &str,
    config: &RetryConfig,
    action: F,
    is_retriable: fn(&E) -> bool,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match action().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(target: "retries", "{target}/{operation} succeeded on attempt {attempt}");
                }
                break Ok(result);
            }
            Err(error) if is_retriable(&error) && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    target: "retries",
                    "{target}/{operation} failed on attempt {attempt}, retrying in {delay:?}: {error}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => break Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "flaky",
            &RetryConfig {
                min_delay: Duration::from_millis(1),
                ..RetryConfig::default()
            },
            || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn non_retriable_errors_fail_fast() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "fatal",
            &RetryConfig::default(),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
