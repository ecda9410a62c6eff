use crate::error::PoolError;
use crate::handle::TaskHandle;
use crate::task::{ManagedTaskInternal, Task};

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

pub(crate) fn next_task_id() -> u64 {
  NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// How long an elastic worker may sit idle before it exits.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Concurrency policy of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
  /// Exactly one worker; tasks run strictly in submission order.
  SingleWorker,
  /// Exactly `n` workers; tasks queue while all of them are busy.
  Fixed(usize),
  /// A new worker for every task that finds no idle one, no upper bound.
  /// Workers idle for longer than `keep_alive` exit.
  Elastic { keep_alive: Duration },
  /// `n` workers, plus delayed and periodic submission.
  Scheduled(usize),
}

impl PoolKind {
  /// Elastic policy with the default keep-alive.
  pub fn elastic() -> Self {
    PoolKind::Elastic {
      keep_alive: DEFAULT_KEEP_ALIVE,
    }
  }

  pub fn supports_scheduling(&self) -> bool {
    matches!(self, PoolKind::Scheduled(_))
  }

  fn is_elastic(&self) -> bool {
    matches!(self, PoolKind::Elastic { .. })
  }

  fn core_workers(&self) -> usize {
    match *self {
      PoolKind::SingleWorker => 1,
      PoolKind::Fixed(n) | PoolKind::Scheduled(n) => n.max(1),
      PoolKind::Elastic { .. } => 0,
    }
  }

  fn keep_alive(&self) -> Option<Duration> {
    match *self {
      PoolKind::Elastic { keep_alive } => Some(keep_alive),
      _ => None,
    }
  }
}

/// Lifecycle of a pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
  Running,
  ShuttingDown,
  Terminated,
}

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stops accepting tasks. Queued and running tasks run to completion.
  Graceful,
  /// Stops accepting tasks and cancels every queued and running task.
  /// Running tasks are interrupted at their next `.await`; a task that never
  /// yields cannot be stopped.
  Immediate,
}

enum NextTask {
  Task(ManagedTaskInternal),
  QueueClosed,
  IdleTimeout,
}

/// State shared by the pool owner, its workers and its timers.
pub(crate) struct PoolShared {
  pub(crate) pool_name: Arc<String>,
  pub(crate) kind: PoolKind,
  pub(crate) tokio_handle: TokioHandle,
  queue_rx: AsyncMutex<mpsc::UnboundedReceiver<ManagedTaskInternal>>,
  pub(crate) shutdown_token: CancellationToken,
  pub(crate) abort_token: CancellationToken,
  terminated_token: CancellationToken,
  live_workers: AtomicUsize,
  idle_workers: AtomicUsize,
  largest_workers: AtomicUsize,
  spawned_workers: AtomicUsize,
  pub(crate) queued_tasks: AtomicUsize,
  pub(crate) delayed_tasks: AtomicUsize,
  completed_tasks: AtomicU64,
  active_task_info: DashMap<u64, CancellationToken>,
}

impl PoolShared {
  fn spawn_worker(self: &Arc<Self>) {
    let live = self.live_workers.fetch_add(1, AtomicOrdering::SeqCst) + 1;
    self.largest_workers.fetch_max(live, AtomicOrdering::SeqCst);
    let worker_id = self.spawned_workers.fetch_add(1, AtomicOrdering::Relaxed);

    trace!(pool_name = %*self.pool_name, worker_id, live, "Spawning worker.");
    let span = info_span!("pool_worker", pool_name = %*self.pool_name, worker_id);
    self.tokio_handle.spawn(self.clone().run_worker_loop().instrument(span));
  }

  async fn run_worker_loop(self: Arc<Self>) {
    debug!("Worker started.");
    let keep_alive = self.kind.keep_alive();

    let exit_reason = loop {
      self.idle_workers.fetch_add(1, AtomicOrdering::SeqCst);
      let next = self.next_task(keep_alive).await;
      // Idle must drop before queued, or a concurrent submitter can count this
      // worker as idle for its own task.
      self.idle_workers.fetch_sub(1, AtomicOrdering::SeqCst);
      if matches!(next, NextTask::Task(_)) {
        self.queued_tasks.fetch_sub(1, AtomicOrdering::SeqCst);
      }

      let task = match next {
        NextTask::Task(task) => task,
        NextTask::QueueClosed => break "task queue closed and drained",
        NextTask::IdleTimeout => {
          // The idle count is already lowered, so a submitter racing with this
          // exit either spawns a replacement or its task is picked up here.
          let last_look = self.queue_rx.lock().await.try_recv();
          match last_look {
            Ok(task) => {
              self.queued_tasks.fetch_sub(1, AtomicOrdering::SeqCst);
              task
            }
            Err(_) => break "idle keep-alive elapsed",
          }
        }
      };

      self.run_task(task).await;
    };

    let remaining = self.live_workers.fetch_sub(1, AtomicOrdering::SeqCst) - 1;
    debug!(remaining, "Worker stopped: {}.", exit_reason);
    if remaining == 0 && self.shutdown_token.is_cancelled() {
      self.mark_terminated();
    }
  }

  async fn next_task(&self, keep_alive: Option<Duration>) -> NextTask {
    let receive = async { self.queue_rx.lock().await.recv().await };
    match keep_alive {
      None => receive.await.map_or(NextTask::QueueClosed, NextTask::Task),
      Some(keep_alive) => match tokio::time::timeout(keep_alive, receive).await {
        Ok(Some(task)) => NextTask::Task(task),
        Ok(None) => NextTask::QueueClosed,
        Err(_elapsed) => NextTask::IdleTimeout,
      },
    }
  }

  async fn run_task(&self, task: ManagedTaskInternal) {
    let task_id = task.task_id;
    self.active_task_info.insert(task_id, task.token.clone());
    debug!(%task_id, "Dequeued task. Executing.");

    task
      .run
      .instrument(info_span!("managed_task", pool_name = %*self.pool_name, %task_id))
      .await;

    self.active_task_info.remove(&task_id);
    self.completed_tasks.fetch_add(1, AtomicOrdering::Relaxed);
    trace!(%task_id, "Managed task finished processing, removed active info.");
  }

  fn mark_terminated(&self) {
    if !self.terminated_token.is_cancelled() {
      info!(pool_name = %*self.pool_name, "Pool terminated.");
      self.terminated_token.cancel();
    }
  }
}

/// A pool of workers executing [`Task`]s on a Tokio runtime.
///
/// Each pool is an owned resource: create it with one of the constructors,
/// submit work, then call [`shutdown`](Pool::shutdown) or
/// [`shutdown_now`](Pool::shutdown_now). Dropping the last `Arc<Pool>` performs
/// an implicit graceful shutdown.
pub struct Pool {
  pub(crate) shared: Arc<PoolShared>,
  pub(crate) task_queue_tx: Mutex<Option<mpsc::UnboundedSender<ManagedTaskInternal>>>,
}

impl Pool {
  pub fn new(kind: PoolKind, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    if matches!(kind, PoolKind::Fixed(0) | PoolKind::Scheduled(0)) {
      warn!(pool_name, "Pool requested with zero workers; using one worker instead.");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(PoolShared {
      pool_name: Arc::new(pool_name.to_string()),
      kind,
      tokio_handle,
      queue_rx: AsyncMutex::new(rx),
      shutdown_token: CancellationToken::new(),
      abort_token: CancellationToken::new(),
      terminated_token: CancellationToken::new(),
      live_workers: AtomicUsize::new(0),
      idle_workers: AtomicUsize::new(0),
      largest_workers: AtomicUsize::new(0),
      spawned_workers: AtomicUsize::new(0),
      queued_tasks: AtomicUsize::new(0),
      delayed_tasks: AtomicUsize::new(0),
      completed_tasks: AtomicU64::new(0),
      active_task_info: DashMap::new(),
    });

    for _ in 0..kind.core_workers() {
      shared.spawn_worker();
    }
    info!(pool_name, ?kind, "Pool created.");

    Arc::new(Self {
      shared,
      task_queue_tx: Mutex::new(Some(tx)),
    })
  }

  pub fn single_worker(tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    Self::new(PoolKind::SingleWorker, tokio_handle, pool_name)
  }

  pub fn fixed(workers: usize, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    Self::new(PoolKind::Fixed(workers), tokio_handle, pool_name)
  }

  pub fn elastic(tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    Self::new(PoolKind::elastic(), tokio_handle, pool_name)
  }

  pub fn scheduled(workers: usize, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    Self::new(PoolKind::Scheduled(workers), tokio_handle, pool_name)
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn kind(&self) -> PoolKind {
    self.shared.kind
  }

  pub fn state(&self) -> PoolState {
    if self.shared.terminated_token.is_cancelled() {
      PoolState::Terminated
    } else if self.shared.shutdown_token.is_cancelled() {
      PoolState::ShuttingDown
    } else {
      PoolState::Running
    }
  }

  pub fn is_shutdown(&self) -> bool {
    self.shared.shutdown_token.is_cancelled()
  }

  pub fn is_terminated(&self) -> bool {
    self.shared.terminated_token.is_cancelled()
  }

  /// Number of live workers.
  pub fn worker_count(&self) -> usize {
    self.shared.live_workers.load(AtomicOrdering::SeqCst)
  }

  /// Highest number of workers that were ever alive at the same time.
  pub fn largest_worker_count(&self) -> usize {
    self.shared.largest_workers.load(AtomicOrdering::SeqCst)
  }

  pub fn active_task_count(&self) -> usize {
    self.shared.active_task_info.len()
  }

  /// Returns the current number of tasks in the pending queue.
  /// Delayed tasks whose delay has not elapsed are not counted.
  pub fn queued_task_count(&self) -> usize {
    self.shared.queued_tasks.load(AtomicOrdering::SeqCst)
  }

  pub fn completed_task_count(&self) -> u64 {
    self.shared.completed_tasks.load(AtomicOrdering::Relaxed)
  }

  /// Queues `task` and returns its handle immediately. Never blocks.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` once shutdown has begun.
  pub fn submit<R: Send + 'static>(&self, task: Task<R>) -> Result<TaskHandle<R>, PoolError> {
    let (managed_task, handle) = self.prepare(task);
    self.enqueue(managed_task)?;
    Ok(handle)
  }

  /// Fire-and-forget submission of an action; its outcome is discarded.
  pub fn execute<F>(&self, action: F) -> Result<(), PoolError>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.execute_task(Task::action(action))
  }

  /// Like [`execute`](Pool::execute) for an already built action task.
  pub fn execute_task(&self, task: Task<()>) -> Result<(), PoolError> {
    self.submit(task).map(drop)
  }

  /// Submits every task, then waits until all of them have finished.
  ///
  /// The returned handles are all done; their outcomes can be taken with
  /// [`TaskHandle::try_result`] or [`TaskHandle::await_result`]. If any
  /// submission is rejected, the tasks already submitted are cancelled and
  /// the rejection is returned.
  pub async fn submit_all<R, I>(&self, tasks: I) -> Result<Vec<TaskHandle<R>>, PoolError>
  where
    R: Send + 'static,
    I: IntoIterator<Item = Task<R>>,
  {
    let mut handles = Vec::new();
    for task in tasks {
      match self.submit(task) {
        Ok(handle) => handles.push(handle),
        Err(submit_error) => {
          warn!(pool_name = %self.shared.pool_name, submitted = handles.len(), "Batch submission rejected, cancelling submitted tasks.");
          for handle in &handles {
            handle.cancel();
          }
          return Err(submit_error);
        }
      }
    }

    debug!(pool_name = %self.shared.pool_name, count = handles.len(), "Batch submitted. Waiting for every task.");
    for handle in handles.iter_mut() {
      handle.wait().await;
    }
    Ok(handles)
  }

  /// Stops accepting new tasks. Queued and running tasks run to completion,
  /// as do delayed tasks already scheduled. Periodic tasks stop.
  pub fn shutdown(&self) {
    self.shutdown_with(ShutdownMode::Graceful);
  }

  /// Stops accepting new tasks and cancels everything in flight.
  ///
  /// Returns how many accepted tasks had not started yet; those resolve to
  /// `PoolError::TaskCancelled` without running.
  pub fn shutdown_now(&self) -> usize {
    self.shutdown_with(ShutdownMode::Immediate)
  }

  /// Waits until the pool is shut down and every worker has exited.
  pub async fn await_termination(&self) {
    self.shared.terminated_token.cancelled().await;
  }

  /// Like [`await_termination`](Pool::await_termination) with an upper bound.
  /// Returns `true` if the pool terminated in time.
  pub async fn await_termination_timeout(&self, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, self.await_termination()).await.is_ok()
  }

  pub(crate) fn prepare<R: Send + 'static>(&self, task: Task<R>) -> (ManagedTaskInternal, TaskHandle<R>) {
    ManagedTaskInternal::new(
      next_task_id(),
      self.shared.pool_name.clone(),
      task,
      self.shared.abort_token.child_token(),
    )
  }

  fn enqueue(&self, managed_task: ManagedTaskInternal) -> Result<(), PoolError> {
    let task_id = managed_task.task_id;
    if self.shared.shutdown_token.is_cancelled() {
      warn!(pool_name = %self.shared.pool_name, %task_id, "Submit: Attempted to submit task to a pool that is shutting down or closed.");
      return Err(PoolError::PoolShuttingDown);
    }

    {
      // Holding the sender lock across the send keeps submission and
      // shutdown strictly ordered.
      let sender_guard = self.task_queue_tx.lock();
      let Some(tx) = sender_guard.as_ref() else {
        warn!(pool_name = %self.shared.pool_name, %task_id, "Submit: Task queue already closed.");
        return Err(PoolError::PoolShuttingDown);
      };
      self.shared.queued_tasks.fetch_add(1, AtomicOrdering::SeqCst);
      if let Err(send_error) = tx.send(managed_task) {
        self.shared.queued_tasks.fetch_sub(1, AtomicOrdering::SeqCst);
        error!(pool_name = %self.shared.pool_name, %task_id, "Submit: Failed to send task to queue: {:?}", send_error.0);
        return Err(PoolError::QueueSendChannelClosed);
      }
    }
    debug!(pool_name = %self.shared.pool_name, %task_id, "Task queued.");

    if self.shared.kind.is_elastic()
      && self.shared.idle_workers.load(AtomicOrdering::SeqCst) < self.shared.queued_tasks.load(AtomicOrdering::SeqCst)
    {
      self.shared.spawn_worker();
    }
    Ok(())
  }

  /// Starts shutting the pool down. Returns how many accepted tasks had not
  /// started yet when an immediate shutdown cancelled them, `0` otherwise.
  ///
  /// Calling it again is harmless, and an `Immediate` call after a
  /// `Graceful` one still cancels the remaining work.
  pub fn shutdown_with(&self, mode: ShutdownMode) -> usize {
    let already_initiating_shutdown = self.shared.shutdown_token.is_cancelled();
    let mut not_started = 0;

    if mode == ShutdownMode::Immediate && !self.shared.abort_token.is_cancelled() {
      not_started = self.shared.queued_tasks.load(AtomicOrdering::SeqCst)
        + self.shared.delayed_tasks.load(AtomicOrdering::SeqCst);
      info!(pool_name = %self.shared.pool_name, not_started, "Immediate shutdown: Cancelling all queued and active tasks.");
      for entry in self.shared.active_task_info.iter() {
        debug!(pool_name = %self.shared.pool_name, task_id = %entry.key(), "Interrupting active task.");
      }
      // Every task token is a child of the abort token.
      self.shared.abort_token.cancel();
    }

    if !already_initiating_shutdown {
      info!(pool_name = %self.shared.pool_name, "Initiating pool shutdown (mode: {:?}).", mode);
      self.shared.shutdown_token.cancel();
      drop(self.task_queue_tx.lock().take());
      debug!(pool_name = %self.shared.pool_name, "Shutdown token cancelled and task queue sender closed.");
    } else {
      trace!(pool_name = %self.shared.pool_name, "Shutdown already in progress.");
    }

    if self.shared.live_workers.load(AtomicOrdering::SeqCst) == 0 {
      self.shared.mark_terminated();
    }
    not_started
  }
}

impl std::fmt::Debug for Pool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pool")
      .field("name", &*self.shared.pool_name)
      .field("kind", &self.shared.kind)
      .field("state", &self.state())
      .field("workers", &self.worker_count())
      .field("queued", &self.queued_task_count())
      .finish()
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    if !self.shared.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.shared.pool_name,
        "Pool dropped without explicit shutdown. Initiating implicit graceful shutdown."
      );
      self.shutdown_with(ShutdownMode::Graceful);
    } else {
      trace!(pool_name = %*self.shared.pool_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}
