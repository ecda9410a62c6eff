//! The demo harness: four pools, each exercised the way a typical caller
//! would use that policy, then shut down.

use crate::error::{PoolError, TaskError};
use crate::handle::TaskHandle;
use crate::pool::{Pool, PoolKind};
use crate::task::Task;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, info};

/// Knobs of the demo run. `Default` reproduces the stock scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
  /// How long every demo task "works" before finishing.
  pub task_duration: Duration,
  pub fixed_workers: usize,
  /// Each round submits one action and one failing computation to the fixed pool.
  pub fixed_rounds: usize,
  pub batch_size: usize,
  pub elastic_keep_alive: Duration,
  pub scheduled_workers: usize,
  pub scheduled_delay: Duration,
}

impl Default for HarnessConfig {
  fn default() -> Self {
    Self {
      task_duration: Duration::from_secs(5),
      fixed_workers: 2,
      fixed_rounds: 5,
      batch_size: 1000,
      elastic_keep_alive: crate::pool::DEFAULT_KEEP_ALIVE,
      scheduled_workers: 10,
      scheduled_delay: Duration::from_secs(5),
    }
  }
}

/// How the handles of one pool resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
  pub succeeded: usize,
  pub failed: usize,
  pub cancelled: usize,
}

impl OutcomeTally {
  pub fn record<R>(&mut self, outcome: &Result<R, PoolError>) {
    match outcome {
      Ok(_) => self.succeeded += 1,
      Err(PoolError::TaskCancelled) => self.cancelled += 1,
      Err(_) => self.failed += 1,
    }
  }

  pub fn total(&self) -> usize {
    self.succeeded + self.failed + self.cancelled
  }

  async fn of_handles<R: Send + 'static>(handles: Vec<TaskHandle<R>>) -> Self {
    let mut tally = Self::default();
    for handle in handles {
      tally.record(&handle.await_result().await);
    }
    tally
  }
}

/// Summary of one [`Harness::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessReport {
  /// Whether the first computation was already done right after submission.
  /// Almost always `false`; it is a scheduling race, not a guarantee.
  pub first_result_ready_on_submit: bool,
  pub single_worker: OutcomeTally,
  pub fixed: OutcomeTally,
  pub batch: OutcomeTally,
  /// Tasks of the elastic pool that had not started when `shutdown_now` ran.
  pub abandoned_on_shutdown_now: usize,
  pub scheduled: OutcomeTally,
}

/// Owns one pool of each kind and drives the demo scenario through them.
#[derive(Debug)]
pub struct Harness {
  config: HarnessConfig,
  single: Arc<Pool>,
  fixed: Arc<Pool>,
  elastic: Arc<Pool>,
  scheduled: Arc<Pool>,
}

impl Harness {
  pub fn new(config: HarnessConfig, tokio_handle: TokioHandle) -> Self {
    let single = Pool::single_worker(tokio_handle.clone(), "single");
    let fixed = Pool::fixed(config.fixed_workers, tokio_handle.clone(), "fixed");
    let elastic = Pool::new(
      PoolKind::Elastic {
        keep_alive: config.elastic_keep_alive,
      },
      tokio_handle.clone(),
      "elastic",
    );
    let scheduled = Pool::scheduled(config.scheduled_workers, tokio_handle, "scheduled");

    Self {
      config,
      single,
      fixed,
      elastic,
      scheduled,
    }
  }

  pub fn config(&self) -> &HarnessConfig {
    &self.config
  }

  pub fn pools(&self) -> [&Arc<Pool>; 4] {
    [&self.single, &self.fixed, &self.elastic, &self.scheduled]
  }

  /// Runs the scenario and waits for every pool to terminate.
  ///
  /// Task failures never make this fail; they only show up in the report.
  ///
  /// # Errors
  /// Returns the pool error if a submission is rejected.
  pub async fn run(&self) -> Result<HarnessReport, PoolError> {
    let mut report = HarnessReport::default();
    let duration = self.config.task_duration;

    // Single worker: a failing computation followed by an action, in order.
    let first = self.single.submit(failing_division(duration))?;
    report.first_result_ready_on_submit = first.is_done();
    debug!(ready = report.first_result_ready_on_submit, "Checked first computation right after submit.");
    self.single.execute_task(sleeping_action(duration))?;
    self.single.shutdown();

    // Fixed pool: more work than workers, so tasks queue.
    let mut fixed_handles = Vec::with_capacity(self.config.fixed_rounds);
    for _ in 0..self.config.fixed_rounds {
      self.fixed.execute_task(sleeping_action(duration))?;
      fixed_handles.push(self.fixed.submit(failing_division(duration))?);
    }
    self.fixed.shutdown();

    // Elastic pool: a batch that blocks until every task finished.
    let batch = (0..self.config.batch_size).map(|_| failing_division(duration));
    let batch_handles = self.elastic.submit_all(batch).await?;
    info!(handles = batch_handles.len(), "Batch invocation returned.");
    report.batch = OutcomeTally::of_handles(batch_handles).await;
    self.elastic.shutdown();
    report.abandoned_on_shutdown_now = self.elastic.shutdown_now();

    // Scheduled pool: one delayed action; a graceful shutdown still lets it fire.
    let delayed = self
      .scheduled
      .submit_delayed(sleeping_action(duration), self.config.scheduled_delay)?;
    self.scheduled.shutdown();

    for pool in self.pools() {
      pool.await_termination().await;
    }

    report.single_worker = OutcomeTally::of_handles(vec![first]).await;
    report.fixed = OutcomeTally::of_handles(fixed_handles).await;
    report.scheduled = OutcomeTally::of_handles(vec![delayed]).await;
    Ok(report)
  }
}

/// Integer division that reports a zero divisor as a task failure.
pub fn checked_div(dividend: i64, divisor: i64) -> Result<i64, TaskError> {
  dividend.checked_div(divisor).ok_or(TaskError::DivideByZero)
}

/// An action that works for `duration`, then logs.
pub fn sleeping_action(duration: Duration) -> Task<()> {
  Task::action(async move {
    tokio::time::sleep(duration).await;
    info!("Runnable call");
  })
}

/// A computation that works for `duration`, then divides by zero.
pub fn failing_division(duration: Duration) -> Task<String> {
  Task::computation(async move {
    tokio::time::sleep(duration).await;
    info!("Callable call");
    let quotient = checked_div(1, 0)?;
    Ok::<_, TaskError>(format!("Callable Return {quotient}"))
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn checked_div_reports_zero_divisor() {
    assert_eq!(checked_div(6, 3), Ok(2));
    assert_eq!(checked_div(1, 0), Err(TaskError::DivideByZero));
  }

  #[test]
  fn tally_sorts_outcomes() {
    let mut tally = OutcomeTally::default();
    tally.record(&Ok::<_, PoolError>(1));
    tally.record::<u8>(&Err(PoolError::TaskCancelled));
    tally.record::<u8>(&Err(PoolError::TaskFailed(TaskError::DivideByZero)));
    tally.record::<u8>(&Err(PoolError::TaskPanicked));
    assert_eq!(
      tally,
      OutcomeTally {
        succeeded: 1,
        failed: 2,
        cancelled: 1
      }
    );
    assert_eq!(tally.total(), 4);
  }

  #[test]
  fn default_config_matches_stock_scenario() {
    let config = HarnessConfig::default();
    assert_eq!(config.task_duration, Duration::from_secs(5));
    assert_eq!(config.fixed_workers, 2);
    assert_eq!(config.batch_size, 1000);
    assert_eq!(config.scheduled_workers, 10);
  }
}
