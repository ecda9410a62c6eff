use thiserror::Error;

/// Errors that can occur within a `task_pools` pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Pool's internal task queue was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Task result channel error (worker dropped the task or receiver was lost): {0}")]
  ResultChannelError(String),

  #[error("Task result already taken or channel was not available")]
  ResultUnavailable,

  #[error("Submitted task future panicked")]
  TaskPanicked,

  #[error("Task was cancelled or interrupted before it could finish")]
  TaskCancelled,

  #[error("Task failed: {0}")]
  TaskFailed(#[from] TaskError),

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("Pool '{0}' does not support delayed or periodic tasks")]
  SchedulingUnsupported(String),

  #[error("Periodic task period must be greater than zero")]
  InvalidPeriod,
}

/// Failures raised by a task body itself.
///
/// A task returning one of these never affects the pool or its other tasks;
/// the error is only visible through the task's handle as
/// [`PoolError::TaskFailed`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
  #[error("attempt to divide by zero")]
  DivideByZero,

  #[error("{0}")]
  Failed(String),
}

impl TaskError {
  pub fn failed(message: impl Into<String>) -> Self {
    TaskError::Failed(message.into())
  }
}
