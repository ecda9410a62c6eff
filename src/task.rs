use crate::error::{PoolError, TaskError};
use crate::handle::TaskHandle;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// The type of future a computation boils down to.
/// It must be `Send` and `'static`, and produce either a value or a [`TaskError`].
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = Result<R, TaskError>> + Send + 'static>>;

/// A unit of work accepted by a [`Pool`](crate::Pool).
///
/// Either an *action* (`Task<()>`, fire-and-forget) or a *computation* that
/// produces `R` and may fail with a [`TaskError`].
pub struct Task<R: Send + 'static> {
  future: TaskToExecute<R>,
}

impl<R: Send + 'static> Task<R> {
  pub fn computation<F>(future: F) -> Self
  where
    F: Future<Output = Result<R, TaskError>> + Send + 'static,
  {
    Self {
      future: Box::pin(future),
    }
  }
}

impl Task<()> {
  pub fn action<F>(future: F) -> Self
  where
    F: Future<Output = ()> + Send + 'static,
  {
    Self::computation(async move {
      future.await;
      Ok(())
    })
  }
}

impl<R: Send + 'static> fmt::Debug for Task<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task").finish_non_exhaustive()
  }
}

/// Type-erased body of a queued task. Running it executes the user future,
/// reports the outcome to the handle and never panics.
pub(crate) type ErasedRun = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Internal representation of a task managed by the pool.
pub(crate) struct ManagedTaskInternal {
  pub(crate) task_id: u64,
  pub(crate) token: CancellationToken,
  pub(crate) run: ErasedRun,
}

impl fmt::Debug for ManagedTaskInternal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManagedTaskInternal")
      .field("task_id", &self.task_id)
      .field("cancelled", &self.token.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl ManagedTaskInternal {
  /// Wraps `task` for the queue and returns the caller's handle to it.
  pub(crate) fn new<R: Send + 'static>(
    task_id: u64,
    pool_name: Arc<String>,
    task: Task<R>,
    token: CancellationToken,
  ) -> (Self, TaskHandle<R>) {
    let (result_tx, result_rx) = oneshot::channel::<Result<R, PoolError>>();
    let completed = Arc::new(AtomicBool::new(false));

    let run = Self::execute(
      task_id,
      pool_name.clone(),
      task.future,
      token.clone(),
      result_tx,
      completed.clone(),
    );

    let handle = TaskHandle {
      task_id,
      pool_name,
      cancellation_token: token.clone(),
      result_receiver: Some(result_rx),
      outcome: None,
      completed,
    };

    (
      Self {
        task_id,
        token,
        run: Box::pin(run),
      },
      handle,
    )
  }

  async fn execute<R: Send + 'static>(
    task_id: u64,
    pool_name: Arc<String>,
    task_future: TaskToExecute<R>,
    token: CancellationToken,
    result_sender: oneshot::Sender<Result<R, PoolError>>,
    completed: Arc<AtomicBool>,
  ) {
    // A token cancelled while the task sat in the queue wins before the
    // future is ever polled.
    let outcome: Result<R, PoolError> = tokio::select! {
      biased;
      _ = token.cancelled() => {
        trace!(pool_name = %*pool_name, %task_id, "Task cancelled by its token.");
        Err(PoolError::TaskCancelled)
      }
      task_result = AssertUnwindSafe(task_future).catch_unwind() => {
        match task_result {
          Ok(Ok(value)) => {
            trace!(pool_name = %*pool_name, %task_id, "Task executed successfully.");
            Ok(value)
          }
          Ok(Err(task_error)) => {
            trace!(pool_name = %*pool_name, %task_id, error = %task_error, "Task returned a failure.");
            Err(PoolError::TaskFailed(task_error))
          }
          Err(_panic_payload) => {
            error!(pool_name = %*pool_name, %task_id, "Task panicked during execution.");
            Err(PoolError::TaskPanicked)
          }
        }
      }
    };

    if result_sender.send(outcome).is_err() {
      // Fire-and-forget submissions drop their handle right away.
      trace!(pool_name = %*pool_name, %task_id, "Result receiver was dropped, outcome discarded.");
    }
    completed.store(true, Ordering::Release);
  }
}
