//! Failure policy for the policy store and request counter.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Default timeout applied to each external read.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the resolver does when it cannot reach its stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the request through without rate limit headers.
    #[default]
    Open,
    /// Refuse the request with 503.
    Closed,
}

/// Wraps every external read with a timeout and carries the failure mode.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    mode: FailureMode,
    timeout: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            mode: FailureMode::Open,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl FailurePolicy {
    pub fn new(mode: FailureMode, timeout: Duration) -> Self {
        Self { mode, timeout }
    }

    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `operation`, turning an elapsed timeout into [`WardenError::Timeout`].
    pub async fn guard<T, F>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_failure_mode_parsing() {
        let mode: FailureMode = serde_yaml::from_str("closed").unwrap();
        assert_eq!(mode, FailureMode::Closed);
        assert_eq!(FailureMode::default(), FailureMode::Open);
    }

    #[tokio::test]
    async fn test_guard_passes_results_through() {
        let policy = FailurePolicy::default();

        let value = assert_ok!(policy.guard("lookup", async { Ok(7) }).await);
        assert_eq!(value, 7);

        let err = assert_err!(
            policy
                .guard::<u8, _>("lookup", async { Err(WardenError::Store("down".into())) })
                .await
        );
        assert!(matches!(err, WardenError::Store(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out() {
        let policy = FailurePolicy::new(FailureMode::Closed, Duration::from_millis(50));

        let result = policy
            .guard("request count", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(1u64)
            })
            .await;

        match result {
            Err(WardenError::Timeout { operation, after }) => {
                assert_eq!(operation, "request count");
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
