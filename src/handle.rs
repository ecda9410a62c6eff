use crate::error::PoolError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing;

/// A handle to a task submitted to a [`Pool`](crate::Pool).
///
/// Allows for requesting cancellation of the task, checking whether it has
/// finished without blocking, and awaiting its result. The handle does not
/// keep the pool alive.
#[derive(Debug)]
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) pool_name: Arc<String>,
  pub(crate) cancellation_token: CancellationToken,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<R, PoolError>>>,
  pub(crate) outcome: Option<Result<R, PoolError>>,
  pub(crate) completed: Arc<AtomicBool>,
}

impl<R: Send + 'static> TaskHandle<R> {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Name of the pool the task was submitted to.
  pub fn pool_name(&self) -> &str {
    &self.pool_name
  }

  /// Returns `true` once the task has finished, whatever its outcome.
  /// Never blocks.
  pub fn is_done(&self) -> bool {
    self.outcome.is_some() || self.completed.load(Ordering::Acquire)
  }

  /// Checks if cancellation has been requested for this task via its token.
  pub fn is_cancellation_requested(&self) -> bool {
    self.cancellation_token.is_cancelled()
  }

  /// Requests cancellation of this specific task by triggering its `CancellationToken`.
  /// A queued task will never start; a running task is interrupted at its next
  /// `.await` point.
  pub fn cancel(&self) {
    tracing::debug!(task_id = %self.task_id, "TaskHandle: Cancellation requested.");
    self.cancellation_token.cancel();
  }

  /// Waits for the task to finish and keeps its outcome inside the handle.
  pub async fn wait(&mut self) {
    if self.outcome.is_some() {
      return;
    }
    if let Some(rx) = self.result_receiver.take() {
      let outcome = match rx.await {
        Ok(task_outcome) => task_outcome,
        Err(recv_error) => self.channel_error(recv_error.to_string()),
      };
      self.outcome = Some(outcome);
    }
  }

  /// Takes the outcome if the task has finished.
  ///
  /// Returns `None` while the task is still queued or running; never blocks.
  /// Once the outcome was taken, further calls return
  /// `Some(Err(PoolError::ResultUnavailable))`.
  pub fn try_result(&mut self) -> Option<Result<R, PoolError>> {
    if let Some(outcome) = self.outcome.take() {
      return Some(outcome);
    }
    let Some(rx) = self.result_receiver.as_mut() else {
      return Some(Err(PoolError::ResultUnavailable));
    };
    match rx.try_recv() {
      Ok(task_outcome) => {
        self.result_receiver = None;
        Some(task_outcome)
      }
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Closed) => {
        self.result_receiver = None;
        Some(self.channel_error("result sender dropped".to_string()))
      }
    }
  }

  /// Awaits the completion of the task and returns its result of type `R`.
  ///
  /// # Errors
  /// Returns `PoolError::TaskFailed` if the task body returned a failure.
  /// Returns `PoolError::TaskPanicked` if the task panicked during execution.
  /// Returns `PoolError::TaskCancelled` if the task was cancelled or interrupted.
  /// Returns `PoolError::ResultChannelError` if the pool lost the task without reporting.
  /// Returns `PoolError::ResultUnavailable` if the outcome was already taken.
  pub async fn await_result(mut self) -> Result<R, PoolError> {
    self.wait().await;
    self.outcome.take().unwrap_or(Err(PoolError::ResultUnavailable))
  }

  fn channel_error(&self, reason: String) -> Result<R, PoolError> {
    tracing::warn!(task_id = %self.task_id, "Result channel receive error: {}", reason);
    Err(PoolError::ResultChannelError(format!(
      "Task (id: {}) result channel unexpectedly closed: {}",
      self.task_id, reason
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn handle_pair() -> (oneshot::Sender<Result<u32, PoolError>>, TaskHandle<u32>) {
    let (tx, rx) = oneshot::channel();
    let handle = TaskHandle {
      task_id: 1,
      pool_name: Arc::new("unit".to_string()),
      cancellation_token: CancellationToken::new(),
      result_receiver: Some(rx),
      outcome: None,
      completed: Arc::new(AtomicBool::new(false)),
    };
    (tx, handle)
  }

  #[test]
  fn try_result_reports_not_done_without_blocking() {
    let (_tx, mut handle) = handle_pair();
    assert!(handle.try_result().is_none());
    assert!(!handle.is_done());
  }

  #[test]
  fn try_result_takes_outcome_once() {
    let (tx, mut handle) = handle_pair();
    tx.send(Ok(5)).unwrap();
    assert_eq!(handle.try_result(), Some(Ok(5)));
    assert_eq!(handle.try_result(), Some(Err(PoolError::ResultUnavailable)));
  }

  #[tokio::test]
  async fn wait_keeps_outcome_for_later() {
    let (tx, mut handle) = handle_pair();
    tx.send(Err(PoolError::TaskPanicked)).unwrap();
    handle.wait().await;
    assert!(handle.is_done());
    assert_eq!(handle.await_result().await, Err(PoolError::TaskPanicked));
  }

  #[tokio::test]
  async fn dropped_sender_surfaces_channel_error() {
    let (tx, handle) = handle_pair();
    drop(tx);
    assert!(matches!(
      handle.await_result().await,
      Err(PoolError::ResultChannelError(_))
    ));
  }

  #[test]
  fn cancel_flips_token() {
    let (_tx, handle) = handle_pair();
    assert!(!handle.is_cancellation_requested());
    handle.cancel();
    assert!(handle.is_cancellation_requested());
  }
}
