use crate::error::{PoolError, TaskError};
use crate::handle::TaskHandle;
use crate::pool::{next_task_id, Pool, PoolShared};
use crate::task::{ManagedTaskInternal, Task};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// A handle to a periodic task created by [`Pool::schedule_at_fixed_rate`].
///
/// Cloning the handle is cheap; every clone controls the same schedule.
#[derive(Debug, Clone)]
pub struct PeriodicHandle {
  task_id: u64,
  token: CancellationToken,
  stopped: CancellationToken,
  completed_runs: Arc<AtomicU64>,
}

impl PeriodicHandle {
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Stops future runs and interrupts the current one, if any.
  pub fn cancel(&self) {
    debug!(task_id = %self.task_id, "PeriodicHandle: Cancellation requested.");
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Number of runs that finished successfully so far.
  pub fn completed_runs(&self) -> u64 {
    self.completed_runs.load(AtomicOrdering::SeqCst)
  }

  /// `true` once no further run will happen, whether it was cancelled, a run
  /// failed, or the pool shut down.
  pub fn is_stopped(&self) -> bool {
    self.stopped.is_cancelled()
  }

  /// Waits until the schedule has stopped for good.
  pub async fn stopped(&self) {
    self.stopped.cancelled().await;
  }
}

impl Pool {
  /// Runs `task` once `delay` has elapsed. Only scheduled pools accept this.
  ///
  /// A graceful shutdown still lets the task fire; `shutdown_now` or
  /// cancelling the handle resolves it to `PoolError::TaskCancelled` without
  /// running it.
  pub fn submit_delayed<R: Send + 'static>(&self, task: Task<R>, delay: Duration) -> Result<TaskHandle<R>, PoolError> {
    let tx = self.scheduling_sender()?;
    let (managed_task, handle) = self.prepare(task);
    let task_id = managed_task.task_id;

    self.shared.delayed_tasks.fetch_add(1, AtomicOrdering::SeqCst);
    debug!(pool_name = %self.shared.pool_name, %task_id, ?delay, "Scheduling delayed task.");

    let span = info_span!("delayed_task", pool_name = %*self.shared.pool_name, %task_id);
    self
      .shared
      .tokio_handle
      .spawn(Self::run_delayed(self.shared.clone(), tx, managed_task, delay).instrument(span));
    Ok(handle)
  }

  /// Runs a task built by `make_task` every `period`, the first time after
  /// `initial_delay`.
  ///
  /// Runs never overlap: a run that takes longer than `period` delays the
  /// next one, and missed ticks are caught up afterwards. The schedule stops
  /// when the handle is cancelled, a run fails, or the pool shuts down.
  pub fn schedule_at_fixed_rate<F, Fut>(
    &self,
    initial_delay: Duration,
    period: Duration,
    make_task: F,
  ) -> Result<PeriodicHandle, PoolError>
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
  {
    if period.is_zero() {
      return Err(PoolError::InvalidPeriod);
    }
    let tx = self.scheduling_sender()?;

    let handle = PeriodicHandle {
      task_id: next_task_id(),
      token: self.shared.abort_token.child_token(),
      stopped: CancellationToken::new(),
      completed_runs: Arc::new(AtomicU64::new(0)),
    };
    debug!(pool_name = %self.shared.pool_name, task_id = %handle.task_id, ?initial_delay, ?period, "Scheduling periodic task.");

    let span = info_span!("periodic_task", pool_name = %*self.shared.pool_name, task_id = %handle.task_id);
    self.shared.tokio_handle.spawn(
      Self::run_periodic(self.shared.clone(), tx, handle.clone(), initial_delay, period, make_task).instrument(span),
    );
    Ok(handle)
  }

  fn scheduling_sender(&self) -> Result<UnboundedSender<ManagedTaskInternal>, PoolError> {
    if !self.shared.kind.supports_scheduling() {
      warn!(pool_name = %self.shared.pool_name, kind = ?self.shared.kind, "Delayed submission to a pool without scheduling support.");
      return Err(PoolError::SchedulingUnsupported(self.shared.pool_name.to_string()));
    }
    if self.shared.shutdown_token.is_cancelled() {
      return Err(PoolError::PoolShuttingDown);
    }
    self.task_queue_tx.lock().as_ref().cloned().ok_or(PoolError::PoolShuttingDown)
  }

  // The timer owns a sender clone, so the workers keep draining until every
  // accepted delayed task has been handed over.
  async fn run_delayed(
    shared: Arc<PoolShared>,
    tx: UnboundedSender<ManagedTaskInternal>,
    managed_task: ManagedTaskInternal,
    delay: Duration,
  ) {
    let token = managed_task.token.clone();
    let delay_elapsed = tokio::select! {
      biased;
      _ = token.cancelled() => false,
      _ = tokio::time::sleep(delay) => true,
    };
    shared.delayed_tasks.fetch_sub(1, AtomicOrdering::SeqCst);

    if !delay_elapsed {
      debug!("Delayed task cancelled before its delay elapsed.");
      // Resolves the handle as cancelled without polling the task body.
      managed_task.run.await;
      return;
    }

    shared.queued_tasks.fetch_add(1, AtomicOrdering::SeqCst);
    if tx.send(managed_task).is_err() {
      shared.queued_tasks.fetch_sub(1, AtomicOrdering::SeqCst);
      warn!("Delay elapsed but the task queue is gone; task dropped.");
    } else {
      debug!("Delay elapsed, task queued.");
    }
  }

  async fn run_periodic<F, Fut>(
    shared: Arc<PoolShared>,
    tx: UnboundedSender<ManagedTaskInternal>,
    handle: PeriodicHandle,
    initial_delay: Duration,
    period: Duration,
    mut make_task: F,
  ) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
  {
    let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);

    loop {
      tokio::select! {
        biased;
        _ = handle.token.cancelled() => {
          debug!("Periodic task cancelled.");
          break;
        }
        _ = shared.shutdown_token.cancelled() => {
          debug!("Pool shutting down, periodic task stops.");
          break;
        }
        _ = ticker.tick() => {}
      }

      let (managed_task, run_handle) = ManagedTaskInternal::new(
        next_task_id(),
        shared.pool_name.clone(),
        Task::computation(make_task()),
        handle.token.child_token(),
      );
      shared.queued_tasks.fetch_add(1, AtomicOrdering::SeqCst);
      if tx.send(managed_task).is_err() {
        shared.queued_tasks.fetch_sub(1, AtomicOrdering::SeqCst);
        warn!("Task queue is gone, periodic task stops.");
        break;
      }

      match run_handle.await_result().await {
        Ok(()) => {
          handle.completed_runs.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Err(run_error) => {
          warn!(error = %run_error, "Periodic run did not succeed; suppressing later runs.");
          break;
        }
      }
    }

    handle.stopped.cancel();
  }
}
