use super::SchedulerShared;
use crate::types::ApiResponse;
use crate::{Error, Result};
use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Pending result of a submitted request. Resolves exactly once.
///
/// `wait` never outlives the request's deadline: if the deadline passes first
/// the handle resolves with [`Error::Timeout`] and a still-queued item is
/// withdrawn.
#[derive(Debug)]
pub struct ResultHandle {
    id: u64,
    rx: oneshot::Receiver<Result<ApiResponse>>,
    deadline: Instant,
    timeout: Duration,
    scheduler: Weak<SchedulerShared>,
}

impl ResultHandle {
    pub(crate) fn new(
        id: u64,
        rx: oneshot::Receiver<Result<ApiResponse>>,
        deadline: Instant,
        timeout: Duration,
        scheduler: Weak<SchedulerShared>,
    ) -> Self {
        Self {
            id,
            rx,
            deadline,
            timeout,
            scheduler,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Withdraw the request if it has not been dispatched yet.
    ///
    /// Returns `false` once dispatch has started; the request then runs to completion
    /// or to its deadline.
    pub fn cancel(&self) -> bool {
        self.scheduler
            .upgrade()
            .map(|s| s.cancel(self.id))
            .unwrap_or(false)
    }

    pub async fn wait(mut self) -> Result<ApiResponse> {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            // Responder dropped without answering: the worker was aborted at shutdown.
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => {
                if let Some(s) = self.scheduler.upgrade() {
                    s.expire(self.id);
                }
                // A result may have landed between the timer firing and withdrawal.
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }
}
