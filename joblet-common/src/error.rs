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
use std::time::Duration;

/// The error taxonomy shared by every Joblet component. Sub-component
/// errors are converted into one of these kinds at the coordinator or API
/// boundary, keeping the failing step attached.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobletError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("isolation failed in step '{step}': {details}")]
    IsolationFailed { step: String, details: String },
    #[error("network setup failed in step '{step}': {details}")]
    NetworkFailed { step: String, details: String },
    #[error("persistence degraded: {0}")]
    PersistDegraded(String),
    #[error("persistence failed: {0}")]
    PersistFailed(String),
    #[error("process launch failed in step '{step}': {details}")]
    ProcessFailed { step: String, details: String },
    #[error("timed out in step '{step}' after {timeout:?}")]
    Timeout { step: String, timeout: Duration },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobletError {
    pub fn invalid_request(details: impl Into<String>) -> Self {
        Self::InvalidRequest(details.into())
    }

    pub fn not_found(details: impl Into<String>) -> Self {
        Self::NotFound(details.into())
    }

    pub fn conflict(details: impl Into<String>) -> Self {
        Self::Conflict(details.into())
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::Internal(details.into())
    }

    pub fn isolation(step: impl Into<String>, details: impl Into<String>) -> Self {
        Self::IsolationFailed {
            step: step.into(),
            details: details.into(),
        }
    }

    pub fn network(step: impl Into<String>, details: impl Into<String>) -> Self {
        Self::NetworkFailed {
            step: step.into(),
            details: details.into(),
        }
    }

    pub fn process(step: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ProcessFailed {
            step: step.into(),
            details: details.into(),
        }
    }

    pub fn timeout(step: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            step: step.into(),
            timeout,
        }
    }

    /// The stable kind tag used in API payloads and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            JobletError::InvalidRequest(_) => "INVALID_REQUEST",
            JobletError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            JobletError::IsolationFailed { .. } => "ISOLATION_FAILED",
            JobletError::NetworkFailed { .. } => "NETWORK_FAILED",
            JobletError::PersistDegraded(_) => "PERSIST_DEGRADED",
            JobletError::PersistFailed(_) => "PERSIST_FAILED",
            JobletError::ProcessFailed { .. } => "PROCESS_FAILED",
            JobletError::Timeout { .. } => "TIMEOUT",
            JobletError::NotFound(_) => "NOT_FOUND",
            JobletError::Conflict(_) => "CONFLICT",
            JobletError::Internal(_) => "INTERNAL",
        }
    }

    pub fn step(&self) -> Option<&str> {
        match self {
            JobletError::IsolationFailed { step, .. }
            | JobletError::NetworkFailed { step, .. }
            | JobletError::ProcessFailed { step, .. }
            | JobletError::Timeout { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl SafeDisplay for JobletError {
    fn to_safe_string(&self) -> String {
        // Variants never embed secret values; details are operator-facing.
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            JobletError::invalid_request("x").kind(),
            "INVALID_REQUEST"
        );
        assert_eq!(
            JobletError::isolation("cgroup", "EPERM").kind(),
            "ISOLATION_FAILED"
        );
        assert_eq!(
            JobletError::timeout("network-ready", Duration::from_secs(30)).kind(),
            "TIMEOUT"
        );
    }

    #[test]
    fn step_attribution_is_preserved() {
        let error = JobletError::process("fork", "EAGAIN");
        assert_eq!(error.step(), Some("fork"));
        assert!(error.to_string().contains("fork"));
    }
}
