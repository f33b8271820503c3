//! Bounded polling of asynchronous snapshot service operations.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AsyncOperation, OperationStatus, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    /// `None` waits until the operation finishes.
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// How a wait ended, with the last status observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Finished(OperationStatus),
    /// The deadline passed; cancel was requested and the status queried once more.
    TimedOut(OperationStatus),
    /// The token fired; cancel was requested and the status queried once more.
    Interrupted(OperationStatus),
}

impl WaitOutcome {
    pub fn status(&self) -> &OperationStatus {
        match self {
            Self::Finished(status) | Self::TimedOut(status) | Self::Interrupted(status) => status,
        }
    }

    /// Whether the operation ended successfully, even if only at the final query.
    pub fn succeeded(&self) -> bool {
        matches!(self.status(), OperationStatus::Succeeded)
    }
}

/// Poll `operation` until it finishes, the deadline passes, or `cancel` fires.
pub async fn wait_for(
    operation: &mut dyn AsyncOperation,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
    name: &str,
) -> Result<WaitOutcome, ServiceError> {
    let deadline = policy.timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let status = operation.status()?;
        if !status.is_pending() {
            debug!("{} finished: {:?}", name, status);
            return Ok(WaitOutcome::Finished(status));
        }

        if cancel.is_cancelled() {
            warn!("{} interrupted, requesting cancel", name);
            return Ok(WaitOutcome::Interrupted(cancel_and_query(operation, name)?));
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!("{} timed out, requesting cancel", name);
            return Ok(WaitOutcome::TimedOut(cancel_and_query(operation, name)?));
        }

        let sleep_for = match deadline {
            Some(d) => policy.poll_interval.min(d.saturating_duration_since(Instant::now())),
            None => policy.poll_interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

fn cancel_and_query(operation: &mut dyn AsyncOperation, name: &str) -> Result<OperationStatus, ServiceError> {
    if let Err(e) = operation.cancel() {
        warn!("Cancel of {} failed: {}", name, e);
    }
    operation.status()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Finishes with `outcome` after `polls` pending answers.
    struct ScriptedOperation {
        polls: usize,
        outcome: OperationStatus,
        cancel_requested: bool,
        finish_on_cancel: bool,
    }

    impl ScriptedOperation {
        fn new(polls: usize, outcome: OperationStatus) -> Self {
            Self {
                polls,
                outcome,
                cancel_requested: false,
                finish_on_cancel: false,
            }
        }
    }

    impl AsyncOperation for ScriptedOperation {
        fn status(&mut self) -> Result<OperationStatus, ServiceError> {
            if self.cancel_requested {
                return Ok(if self.finish_on_cancel {
                    self.outcome.clone()
                } else {
                    OperationStatus::Cancelled
                });
            }
            if self.polls == 0 {
                return Ok(self.outcome.clone());
            }
            self.polls -= 1;
            Ok(OperationStatus::Pending)
        }

        fn cancel(&mut self) -> Result<(), ServiceError> {
            self.cancel_requested = true;
            Ok(())
        }
    }

    fn fast_policy(timeout: Option<Duration>) -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_millis(5),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_finishes_after_polls() {
        let mut op = ScriptedOperation::new(3, OperationStatus::Succeeded);
        let outcome = wait_for(&mut op, &fast_policy(None), &CancellationToken::new(), "test")
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Finished(OperationStatus::Succeeded));
        assert!(!op.cancel_requested);
    }

    #[tokio::test]
    async fn test_timeout_cancels_then_queries() {
        let mut op = ScriptedOperation::new(usize::MAX, OperationStatus::Succeeded);
        let outcome = wait_for(
            &mut op,
            &fast_policy(Some(Duration::from_millis(30))),
            &CancellationToken::new(),
            "test",
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut(OperationStatus::Cancelled));
        assert!(op.cancel_requested);
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_cancel_is_advisory() {
        let mut op = ScriptedOperation::new(usize::MAX, OperationStatus::Succeeded);
        op.finish_on_cancel = true;
        let outcome = wait_for(
            &mut op,
            &fast_policy(Some(Duration::from_millis(20))),
            &CancellationToken::new(),
            "test",
        )
        .await
        .unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut(_)));
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn test_interrupted_by_token() {
        let mut op = ScriptedOperation::new(usize::MAX, OperationStatus::Succeeded);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = wait_for(&mut op, &fast_policy(None), &token, "test").await.unwrap();
        assert_eq!(outcome, WaitOutcome::Interrupted(OperationStatus::Cancelled));
    }
}
