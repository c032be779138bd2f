//! Per-call context: deadline and cancellation propagation.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::services::error::ServiceError;

/// Deadline and cancellation carried by every public service call.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context with no deadline, for background work.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail fast if the call is already cancelled or past its deadline.
    pub fn ensure_active(&self) -> Result<(), ServiceError> {
        if self.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ServiceError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run a future under this context, aborting it on cancellation or
    /// deadline expiry. The future is dropped when aborted; callers must
    /// sequence non-cancellable work (audit finalization) after this.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        self.ensure_active()?;
        match self.deadline {
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(ServiceError::Cancelled),
                    result = fut => result,
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(ServiceError::Cancelled),
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                        Err(ServiceError::DeadlineExceeded)
                    }
                    result = fut => result,
                }
            }
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_aborts_slow_work() {
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ServiceError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn cancellation_aborts_work() {
        let ctx = CallContext::background();
        ctx.cancel();
        let result = ctx.run(async { Ok(()) }).await;
        assert!(matches!(result, Err(ServiceError::Cancelled)));
    }

    #[tokio::test]
    async fn fast_work_completes() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let result = ctx.run(async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
